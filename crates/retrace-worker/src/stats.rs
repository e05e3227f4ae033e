//! Crash-statistics persistence.
//!
//! The distilled pipeline treats the statistics database purely as an
//! external collaborator (`init_crashstats_db`, `save_crashstats*`). This
//! module supplements it with a small [`CrashStatsStore`] trait —
//! grounded on the teacher's `StateStore` trait, which exists precisely to
//! make a persistence backend pluggable and testable — with a real
//! `rusqlite`-backed implementation and an in-memory test double.

use anyhow::Result;
use retrace_worker_types::StatsRecord;

/// Mirrors the four persistence calls in §6.
pub trait CrashStatsStore {
    /// Insert the initial row for a task, returning its stats id.
    fn save_crashstats(&mut self, record: &StatsRecord) -> Result<u64>;

    /// Finalise a successful task: duration, prerunning/concurrent counts,
    /// and the (currently always-zero, reserved) `rootsize` field.
    fn save_crashstats_success(
        &mut self,
        statsid: u64,
        prerunning: i64,
        running_now: i64,
        rootsize: i64,
    ) -> Result<()>;

    /// Persist the resolved package list, excluding the crash's own
    /// package (property 4: the first entry is excluded by the caller
    /// before this is invoked).
    fn save_crashstats_packages(&mut self, statsid: u64, packages: &[String]) -> Result<()>;

    /// Persist unresolved `(soname, build_id)` pairs, when any exist.
    fn save_crashstats_build_ids(&mut self, statsid: u64, missing: &[(String, String)]) -> Result<()>;
}

/// An in-memory `CrashStatsStore`, for tests — the same "real backend +
/// in-memory double" shape the teacher uses for `StateStore`.
#[derive(Default)]
pub struct MemoryCrashStatsStore {
    pub records: Vec<StatsRecord>,
    pub packages: Vec<(u64, Vec<String>)>,
    pub build_ids: Vec<(u64, Vec<(String, String)>)>,
    pub successes: Vec<(u64, i64, i64, i64)>,
    next_id: u64,
}

impl CrashStatsStore for MemoryCrashStatsStore {
    fn save_crashstats(&mut self, record: &StatsRecord) -> Result<u64> {
        self.next_id += 1;
        self.records.push(record.clone());
        Ok(self.next_id)
    }

    fn save_crashstats_success(
        &mut self,
        statsid: u64,
        prerunning: i64,
        running_now: i64,
        rootsize: i64,
    ) -> Result<()> {
        self.successes.push((statsid, prerunning, running_now, rootsize));
        Ok(())
    }

    fn save_crashstats_packages(&mut self, statsid: u64, packages: &[String]) -> Result<()> {
        self.packages.push((statsid, packages.to_vec()));
        Ok(())
    }

    fn save_crashstats_build_ids(&mut self, statsid: u64, missing: &[(String, String)]) -> Result<()> {
        if !missing.is_empty() {
            self.build_ids.push((statsid, missing.to_vec()));
        }
        Ok(())
    }
}

/// A `rusqlite`-backed `CrashStatsStore`.
pub struct SqliteCrashStatsStore {
    conn: rusqlite::Connection,
}

impl SqliteCrashStatsStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                taskid INTEGER NOT NULL,
                package TEXT,
                version TEXT,
                arch TEXT,
                starttime INTEGER,
                duration INTEGER,
                coresize INTEGER,
                status TEXT,
                prerunning INTEGER,
                running_now INTEGER,
                rootsize INTEGER
             );
             CREATE TABLE IF NOT EXISTS tasks_packages (
                statsid INTEGER NOT NULL,
                package TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tasks_build_ids (
                statsid INTEGER NOT NULL,
                soname TEXT NOT NULL,
                build_id TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE tasks_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                taskid INTEGER NOT NULL,
                package TEXT, version TEXT, arch TEXT,
                starttime INTEGER, duration INTEGER, coresize INTEGER, status TEXT,
                prerunning INTEGER, running_now INTEGER, rootsize INTEGER
             );
             CREATE TABLE tasks_packages (statsid INTEGER NOT NULL, package TEXT NOT NULL);
             CREATE TABLE tasks_build_ids (statsid INTEGER NOT NULL, soname TEXT NOT NULL, build_id TEXT NOT NULL);",
        )?;
        Ok(Self { conn })
    }
}

impl CrashStatsStore for SqliteCrashStatsStore {
    fn save_crashstats(&mut self, record: &StatsRecord) -> Result<u64> {
        self.conn.execute(
            "INSERT INTO tasks_stats (taskid, package, version, arch, starttime, duration, coresize, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.taskid as i64,
                record.package,
                record.version,
                record.arch,
                record.starttime,
                record.duration,
                record.coresize.map(|v| v as i64),
                format!("{:?}", record.status),
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    fn save_crashstats_success(
        &mut self,
        statsid: u64,
        prerunning: i64,
        running_now: i64,
        rootsize: i64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks_stats SET status = 'Success', prerunning = ?2, running_now = ?3, rootsize = ?4 WHERE id = ?1",
            rusqlite::params![statsid as i64, prerunning, running_now, rootsize],
        )?;
        Ok(())
    }

    fn save_crashstats_packages(&mut self, statsid: u64, packages: &[String]) -> Result<()> {
        for package in packages {
            self.conn.execute(
                "INSERT INTO tasks_packages (statsid, package) VALUES (?1, ?2)",
                rusqlite::params![statsid as i64, package],
            )?;
        }
        Ok(())
    }

    fn save_crashstats_build_ids(&mut self, statsid: u64, missing: &[(String, String)]) -> Result<()> {
        for (soname, build_id) in missing {
            self.conn.execute(
                "INSERT INTO tasks_build_ids (statsid, soname, build_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![statsid as i64, soname, build_id],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_worker_types::TaskStatus;

    #[test]
    fn memory_store_assigns_increasing_ids() {
        let mut store = MemoryCrashStatsStore::default();
        let a = store.save_crashstats(&StatsRecord::new(1, 100)).unwrap();
        let b = store.save_crashstats(&StatsRecord::new(2, 200)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn memory_store_excludes_nothing_itself_caller_filters() {
        let mut store = MemoryCrashStatsStore::default();
        let id = store.save_crashstats(&StatsRecord::new(1, 100)).unwrap();
        store.save_crashstats_packages(id, &["mesa-libGL".to_string()]).unwrap();
        assert_eq!(store.packages[0].1, vec!["mesa-libGL".to_string()]);
    }

    #[test]
    fn memory_store_skips_empty_build_ids() {
        let mut store = MemoryCrashStatsStore::default();
        let id = store.save_crashstats(&StatsRecord::new(1, 100)).unwrap();
        store.save_crashstats_build_ids(id, &[]).unwrap();
        assert!(store.build_ids.is_empty());
    }

    #[test]
    fn sqlite_store_round_trip() {
        let mut store = SqliteCrashStatsStore::open_in_memory().unwrap();
        let mut record = StatsRecord::new(42, 1_700_000_000);
        record.package = Some("firefox".to_string());
        record.status = TaskStatus::Success;
        let id = store.save_crashstats(&record).unwrap();
        store.save_crashstats_success(id, 0, 1, 0).unwrap();
        store.save_crashstats_packages(id, &["mesa-libGL".to_string()]).unwrap();
        store
            .save_crashstats_build_ids(id, &[("libfoo.so.1".to_string(), "abc123".to_string())])
            .unwrap();

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM tasks_packages WHERE statsid = ?1", [id as i64], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}

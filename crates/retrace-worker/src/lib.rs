//! # retrace-worker
//!
//! A per-task state machine that drives crash analysis from an uploaded
//! crash artifact through staging, environment provisioning, debugger
//! invocation, and status-phase transitions with durable side effects.
//!
//! ## Pipeline
//!
//! 1. [`crash_input`] (C1) validates required files and reads `package`,
//!    `executable`, `rootdir`, `os_release`.
//! 2. [`release`] (C2) resolves a [`retrace_worker_types::Release`] from
//!    release-file contents or package-name heuristics.
//! 3. [`packages`] (C3) enumerates required RPM packages and unresolved
//!    build-ids for a coredump via `coredump2packages`.
//! 4. [`environment`] (C4) provisions a `mock`, `podman`, or `native`
//!    analysis environment for the resolved release.
//! 5. [`retrace`] (C5) drives GDB against a coredump.
//! 6. [`vmcore`] (C6) drives the `crash` utility against a kernel vmcore.
//! 7. [`dedup`] (C7) hardlinks identical vmcores across tasks.
//! 8. [`lifecycle`] (C8) ties the above into the documented status DAG,
//!    owning per-task logging, hooks, failure handling, notification, and
//!    statistics persistence.
//!
//! ## Ambient stack
//!
//! - [`config`] — `retrace-worker.toml` loading and validation
//! - [`logging`] — the `Reporter` implementations (`TaskLogger`, `CliReporter`)
//! - [`stats`] — the `CrashStatsStore` trait plus SQLite/in-memory backends
//! - [`email`] — fire-and-forget task-completion notification
//! - [`strategies`] — the closed per-distribution strategy table

pub mod config;
pub mod crash_input;
pub mod dedup;
pub mod email;
pub mod environment;
pub mod lifecycle;
pub mod logging;
pub mod orchestrate;
pub mod packages;
pub mod release;
pub mod retrace;
pub mod stats;
pub mod strategies;
pub mod vmcore;

pub use retrace_worker_types as types;

//! `cronlock-scheduler`: distributed, poll-based cron job engine.
//!
//! # Overview
//!
//! Any number of worker processes share one SQLite job store. Each
//! [`engine::Scheduler::run_once`] pass selects the due jobs, claims each one
//! through an atomic conditional update on its `lock` column, invokes the
//! registered function, moves `next_run` forward from the cron schedule,
//! releases the lock and appends a [`types::JobLog`] row.
//!
//! # Job lifecycle
//!
//! | State     | `lock`      | Leaves via                                   |
//! |-----------|-------------|----------------------------------------------|
//! | `Idle`    | `NULL`      | a successful claim once `next_run <= now`    |
//! | `Claimed` | claim time  | finish (release + reschedule), or expiry     |
//!
//! Locks are advisory. Without a configured timeout a held lock never
//! expires; with one, another poller may take over a lock once
//! `now - lock >= timeout`.

pub mod codec;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lock;
pub mod log;
pub mod registry;
pub mod schedule;
pub mod sqlite;
pub mod store;
pub mod types;

pub use engine::{PassReport, RunOutcome, Scheduler};
pub use error::{Result, SchedulerError};
pub use executor::{ExecutionFailure, Executor, FailureKind};
pub use lock::{Claimed, LockManager, LockState};
pub use log::LogSink;
pub use registry::{CallArgs, FunctionRegistry};
pub use sqlite::SqliteStore;
pub use store::{ClaimOutcome, ClaimRequest, JobStore};
pub use types::{Job, JobLog, JobPatch, NewJob, NewLog, Timestamp};

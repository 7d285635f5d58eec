//! Persistence port for execution logs.

use crate::error::Result;
use crate::types::{JobLog, NewLog, Timestamp};

/// Append-only record of run attempts.
pub trait LogSink: Send + Sync {
    /// Persist one attempt, stamped with `now`.
    fn record(&self, entry: NewLog, now: Timestamp) -> Result<JobLog>;

    /// Most recent attempts for a job, newest first.
    fn list_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobLog>>;

    /// Most recent attempts across all jobs, newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<JobLog>>;

    /// Delete logs created at or before `older_than`. A non-empty `nodes`
    /// restricts the purge to logs written by those nodes. Returns the number
    /// of rows removed.
    fn purge(&self, older_than: Timestamp, nodes: &[String]) -> Result<usize>;
}

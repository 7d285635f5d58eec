//! Persistence port for jobs.

use crate::error::Result;
use crate::lock::Claimed;
use crate::types::{Job, JobPatch, NewJob, Timestamp};

/// Parameters of one atomic claim attempt.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub job_id: &'a str,
    /// Written into `lock` on success.
    pub now: Timestamp,
    /// A held lock taken at or before this instant counts as expired.
    /// `None` means held locks never expire.
    pub expired_before: Option<Timestamp>,
    /// Also require the job to still be due at `now`. Set by the poll pass so
    /// that a job another poller already ran and rescheduled is not run twice.
    pub only_if_due: bool,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another poller holds an unexpired lock, or (with `only_if_due`) the job
    /// is no longer due.
    Held,
    /// The job was deleted.
    Missing,
}

/// Storage for [`Job`] records.
///
/// Every write to `lock` and `next_run` goes through [`JobStore::claim`],
/// [`JobStore::finish`], [`JobStore::abandon`] or the operator override
/// [`JobStore::release`]. Implementations must make each of them a single
/// conditional update; a read followed by a write lets two pollers claim the
/// same job, and a poller whose expired lock was taken over must not clear
/// the new holder's lock.
pub trait JobStore: Send + Sync {
    /// Validate the schedule, compute the first `next_run` from `now` and insert.
    fn create(&self, job: NewJob, now: Timestamp) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// All jobs ordered by creation time.
    fn list(&self) -> Result<Vec<Job>>;

    /// Apply an administrative edit. A changed schedule is validated and
    /// `next_run` is recomputed from `now`.
    fn update(&self, id: &str, patch: JobPatch, now: Timestamp) -> Result<Job>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Exactly the jobs with `enabled ∧ lock = NULL ∧ next_run <= now`, in no
    /// particular order.
    fn select_due(&self, now: Timestamp) -> Result<Vec<Job>>;

    /// Enabled jobs with `next_run <= now` whose lock was taken at or before
    /// `expired_before`.
    fn select_stale(&self, now: Timestamp, expired_before: Timestamp) -> Result<Vec<Job>>;

    /// Atomically set `lock = now` if the lock is free or expired.
    fn claim(&self, request: ClaimRequest<'_>) -> Result<ClaimOutcome>;

    /// Set `lock = NULL` whoever holds it. Operator use only; releasing a
    /// free or missing job is not an error.
    fn release(&self, id: &str) -> Result<()>;

    /// Release and reschedule in one write, only while `claim` still holds
    /// the lock. Fails with `ClaimLost` when another poller has taken it over
    /// and with `JobNotFound` when the job is gone.
    fn finish(&self, claim: &Claimed, next_run: Option<Timestamp>) -> Result<()>;

    /// Drop `claim` without rescheduling. A lock that has since been taken
    /// over is left alone.
    fn abandon(&self, claim: &Claimed) -> Result<()>;
}

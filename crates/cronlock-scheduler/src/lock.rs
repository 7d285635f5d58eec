//! Advisory lock policy over [`JobStore::claim`].
//!
//! A lock is a bare claim timestamp on the job row. It is cooperative: any
//! writer that bypasses the store's claim operation can break mutual
//! exclusion. With no timeout configured a held lock never expires, so a
//! worker that crashes mid-run leaves its job unclaimable until an operator
//! clears it with [`LockManager::force_release`].
//!
//! A [`Claimed`] value is the holder's proof: finishing or abandoning a run
//! only clears the lock while it still carries that claim's instant.

use std::time::Duration;

use tracing::debug;

use crate::db::truncate_ts;
use crate::error::{Result, SchedulerError};
use crate::store::{ClaimOutcome, ClaimRequest, JobStore};
use crate::types::Timestamp;

/// How a lock looks from a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { since: Timestamp },
    Expired { since: Timestamp },
}

/// Proof of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    pub job_id: String,
    /// The value written to `lock`, at column precision.
    pub at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct LockManager {
    timeout: Option<chrono::Duration>,
}

impl LockManager {
    /// `None` disables expiry.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout: timeout.map(|t| chrono::Duration::from_std(t).unwrap_or(chrono::Duration::MAX)),
        }
    }

    pub fn timeout(&self) -> Option<chrono::Duration> {
        self.timeout
    }

    /// Locks taken at or before the returned instant have expired at `now`.
    pub fn expired_before(&self, now: Timestamp) -> Option<Timestamp> {
        self.timeout
            .map(|timeout| now.checked_sub_signed(timeout).unwrap_or(Timestamp::MIN_UTC))
    }

    pub fn state(&self, lock: Option<Timestamp>, now: Timestamp) -> LockState {
        match (lock, self.expired_before(now)) {
            (None, _) => LockState::Free,
            (Some(since), Some(cutoff)) if since <= cutoff => LockState::Expired { since },
            (Some(since), _) => LockState::Held { since },
        }
    }

    /// Claim `job_id` at `now`.
    ///
    /// Succeeds when the lock is free, or when a timeout is configured and
    /// `now - lock >= timeout`. Fails with `JobLocked` otherwise and with
    /// `JobNotFound` when the job has been deleted.
    pub fn try_claim(&self, store: &dyn JobStore, job_id: &str, now: Timestamp) -> Result<Claimed> {
        self.claim(store, job_id, now, false)
    }

    /// Like [`LockManager::try_claim`], additionally requiring the job to
    /// still be due at `now`.
    pub fn try_claim_due(&self, store: &dyn JobStore, job_id: &str, now: Timestamp) -> Result<Claimed> {
        self.claim(store, job_id, now, true)
    }

    fn claim(&self, store: &dyn JobStore, job_id: &str, now: Timestamp, only_if_due: bool) -> Result<Claimed> {
        let now = truncate_ts(now);
        let outcome = store.claim(ClaimRequest {
            job_id,
            now,
            expired_before: self.expired_before(now),
            only_if_due,
        })?;
        match outcome {
            ClaimOutcome::Claimed => Ok(Claimed {
                job_id: job_id.to_string(),
                at: now,
            }),
            ClaimOutcome::Held => {
                debug!(%job_id, "claim refused");
                Err(SchedulerError::JobLocked {
                    id: job_id.to_string(),
                })
            }
            ClaimOutcome::Missing => Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            }),
        }
    }

    /// Give up `claim` without rescheduling. Leaves a lock that another
    /// poller has taken over in place.
    pub fn release(&self, store: &dyn JobStore, claim: &Claimed) -> Result<()> {
        store.abandon(claim)
    }

    /// Clear the lock whoever holds it. Idempotent. For operators recovering
    /// a job stuck behind a crashed worker.
    pub fn force_release(&self, store: &dyn JobStore, job_id: &str) -> Result<()> {
        store.release(job_id)
    }
}

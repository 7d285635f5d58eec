use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The store failed to commit a read or write.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression does not parse or never fires.
    #[error("Invalid schedule '{expression}': {reason}")]
    ScheduleInvalid { expression: String, reason: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job is claimed by another poller and the claim has not expired.
    #[error("Job is locked: {id}")]
    JobLocked { id: String },

    /// Our lock expired and another poller claimed the job before we finished.
    #[error("Claim on job {id} was lost to another poller")]
    ClaimLost { id: String },

    /// No function is registered under this name.
    #[error("Function not registered: {function}")]
    FunctionResolution { function: String },

    /// Arguments or a result could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A stored timestamp is not valid RFC 3339.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl SchedulerError {
    pub(crate) fn schedule(expression: &str, reason: impl ToString) -> Self {
        SchedulerError::ScheduleInvalid {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// All instants handled by the scheduler are UTC.
pub type Timestamp = DateTime<Utc>;

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v7 string, primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Free-form text shown to operators.
    pub description: String,
    /// Name the function was registered under in the [`crate::FunctionRegistry`].
    pub function: String,
    /// Positional arguments, passed through untouched.
    pub args: Vec<Value>,
    /// Keyword arguments, passed through untouched.
    pub kwargs: Map<String, Value>,
    /// Cron expression (5 fields, or 6 with leading seconds).
    pub schedule: String,
    /// Disabled jobs are never selected as due.
    pub enabled: bool,
    /// Earliest instant at which the job becomes eligible.
    pub next_run: Option<Timestamp>,
    /// Set while a poller holds the claim; the value is the claim time.
    pub lock: Option<Timestamp>,
    pub created: Timestamp,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// `enabled ∧ lock = NULL ∧ next_run <= now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.enabled && self.lock.is_none() && self.next_run.is_some_and(|t| t <= now)
    }
}

/// Fields supplied when registering a job. `next_run` is computed by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub schedule: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            schedule: schedule.into(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// An administrative edit. `None` leaves a field untouched.
///
/// `lock` and `next_run` are deliberately absent: editors cannot write them.
/// A changed `schedule` recomputes `next_run` from the edit time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub function: Option<String>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
}

impl JobPatch {
    pub fn schedule(schedule: impl Into<String>) -> Self {
        Self {
            schedule: Some(schedule.into()),
            ..Self::default()
        }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn args(args: Vec<Value>) -> Self {
        Self {
            args: Some(args),
            ..Self::default()
        }
    }
}

/// One execution attempt. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: String,
    pub created: Timestamp,
    /// Host or process that ran the attempt. Descriptive only.
    pub node: String,
    pub job_id: String,
    /// Return value of the function; `None` when it failed.
    pub result: Option<Value>,
    /// Failure detail; `None` when the run succeeded.
    pub failure_info: Option<String>,
}

impl JobLog {
    pub fn succeeded(&self) -> bool {
        self.failure_info.is_none()
    }
}

/// Payload handed to a [`crate::LogSink`].
#[derive(Debug, Clone)]
pub struct NewLog {
    pub job_id: String,
    pub node: String,
    pub result: Option<Value>,
    pub failure_info: Option<String>,
}

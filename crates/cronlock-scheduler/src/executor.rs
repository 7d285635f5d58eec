use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::{CallArgs, FunctionRegistry};

/// Why a run produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The function name is not registered.
    Unresolved,
    /// The function returned an error.
    Raised,
    /// The function panicked.
    Panicked,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Unresolved => "unresolved",
            FailureKind::Raised => "raised",
            FailureKind::Panicked => "panicked",
        };
        write!(f, "{s}")
    }
}

/// A captured failure. This is data for the log, not an error that stops
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    /// Message, cause chain and backtrace where available.
    pub detail: String,
}

/// Resolves a job's function by name and invokes it.
#[derive(Debug, Clone)]
pub struct Executor {
    registry: Arc<FunctionRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Invoke `function` synchronously. Errors and panics raised by the
    /// function are caught and returned as [`ExecutionFailure`].
    pub fn run(
        &self,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> std::result::Result<Value, ExecutionFailure> {
        let f = self.registry.resolve(function).map_err(|e| ExecutionFailure {
            kind: FailureKind::Unresolved,
            detail: e.to_string(),
        })?;

        let call = CallArgs::new(args, kwargs);
        match panic::catch_unwind(AssertUnwindSafe(|| f(&call))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ExecutionFailure {
                kind: FailureKind::Raised,
                detail: format!("{e:?}"),
            }),
            Err(payload) => Err(ExecutionFailure {
                kind: FailureKind::Panicked,
                detail: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}

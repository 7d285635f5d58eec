//! Functions every worker registers at startup.

use std::sync::Arc;

use anyhow::bail;
use chrono::{Duration, Utc};
use cronlock_scheduler::{FunctionRegistry, LogSink};
use serde_json::{json, Value};

pub const ECHO: &str = "cronlock.echo";
pub const PURGE_LOGS: &str = "cronlock.purge_logs";

/// Build the registry: `cronlock.echo(*args, **kwargs)` and
/// `cronlock.purge_logs(days, nodes=None)`.
pub fn registry(logs: Arc<dyn LogSink>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register(ECHO, |call| {
            Ok(json!({
                "args": Value::Array(call.args.to_vec()),
                "kwargs": Value::Object(call.kwargs.clone()),
            }))
        })
        .register(PURGE_LOGS, move |call| {
            let days = call.i64_or(0, "days", 0)?;
            if days <= 0 {
                bail!("purge_logs needs a minimum age in days, got {days}");
            }
            let nodes = call.str_list(1, "nodes")?;
            let cutoff = Utc::now() - Duration::days(days);
            let removed = logs.purge(cutoff, &nodes)?;
            Ok(json!({ "removed": removed }))
        });
    registry
}

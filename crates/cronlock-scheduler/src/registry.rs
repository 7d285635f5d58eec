//! Explicit name → function table, filled once at process startup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use serde_json::{Map, Value};

use crate::error::{Result, SchedulerError};

/// A schedulable function. Returning `Err` (or panicking) marks the run as
/// failed; the scheduler records the failure and carries on.
pub type JobFn = dyn Fn(&CallArgs<'_>) -> anyhow::Result<Value> + Send + Sync;

/// Positional and keyword arguments of one invocation.
///
/// A parameter may be supplied either by position or by name, not both.
#[derive(Debug, Clone, Copy)]
pub struct CallArgs<'a> {
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

impl<'a> CallArgs<'a> {
    pub fn new(args: &'a [Value], kwargs: &'a Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Look up the parameter at `position`, also known as `name`.
    pub fn get(&self, position: usize, name: &str) -> anyhow::Result<Option<&'a Value>> {
        match (self.args.get(position), self.kwargs.get(name)) {
            (Some(_), Some(_)) => bail!("got multiple values for argument '{name}'"),
            (Some(v), None) | (None, Some(v)) => Ok(Some(v)),
            (None, None) => Ok(None),
        }
    }

    pub fn i64_or(&self, position: usize, name: &str, default: i64) -> anyhow::Result<i64> {
        match self.get(position, name)? {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| anyhow!("argument '{name}' must be an integer, got {v}")),
        }
    }

    pub fn bool_or(&self, position: usize, name: &str, default: bool) -> anyhow::Result<bool> {
        match self.get(position, name)? {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| anyhow!("argument '{name}' must be a boolean, got {v}")),
        }
    }

    pub fn str_list(&self, position: usize, name: &str) -> anyhow::Result<Vec<String>> {
        match self.get(position, name)? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("argument '{name}' must contain only strings"))
                })
                .collect(),
            Some(v) => bail!("argument '{name}' must be a list of strings, got {v}"),
        }
    }
}

/// Registered job functions, keyed by the name stored in `jobs.function`.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<JobFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&CallArgs<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<JobFn>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::FunctionResolution {
                function: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_unknown_is_typed_error() {
        let registry = FunctionRegistry::new();
        let err = registry.resolve("missing.fn").err().unwrap();
        assert!(matches!(err, SchedulerError::FunctionResolution { ref function } if function == "missing.fn"));
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("b", |_| Ok(json!("b")))
            .register("a", |_| Ok(json!("a")));
        assert_eq!(registry.names(), vec!["a", "b"]);

        let f = registry.resolve("a").unwrap();
        let kwargs = Map::new();
        assert_eq!(f(&CallArgs::new(&[], &kwargs)).unwrap(), json!("a"));
    }

    #[test]
    fn positional_and_keyword_binding() {
        let args = [json!(3)];
        let mut kwargs = Map::new();
        kwargs.insert("add".into(), json!(false));
        let call = CallArgs::new(&args, &kwargs);

        assert_eq!(call.i64_or(0, "x", 0).unwrap(), 3);
        assert_eq!(call.i64_or(1, "y", 7).unwrap(), 7);
        assert!(!call.bool_or(2, "add", true).unwrap());
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let args = [json!(1)];
        let mut kwargs = Map::new();
        kwargs.insert("x".into(), json!(2));
        let call = CallArgs::new(&args, &kwargs);
        assert!(call.get(0, "x").is_err());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let args = [json!("three")];
        let kwargs = Map::new();
        let call = CallArgs::new(&args, &kwargs);
        let err = call.i64_or(0, "x", 0).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));
    }

    #[test]
    fn str_list_reads_arrays() {
        let kwargs: Map<String, Value> =
            serde_json::from_value(json!({"nodes": ["a", "b"]})).unwrap();
        let call = CallArgs::new(&[], &kwargs);
        assert_eq!(call.str_list(1, "nodes").unwrap(), vec!["a", "b"]);
        assert!(call.str_list(2, "other").unwrap().is_empty());
    }
}

/// Name recorded on every execution log row.
///
/// Purely descriptive: nothing routes on it. Falls back to `"unknown"` when
/// the host name cannot be read.
pub fn current_node() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

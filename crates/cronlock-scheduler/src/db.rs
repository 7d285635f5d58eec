use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::types::Timestamp;

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
/// Timestamps are fixed-width RFC 3339 UTC text, so `<=` on the column
/// orders chronologically.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT    NOT NULL PRIMARY KEY,
            name         TEXT    NOT NULL,
            description  TEXT    NOT NULL DEFAULT '',
            function     TEXT    NOT NULL,
            args         TEXT    NOT NULL DEFAULT '[]',  -- codec-encoded
            kwargs       TEXT    NOT NULL DEFAULT '{}',  -- codec-encoded
            schedule     TEXT    NOT NULL,
            enabled      INTEGER NOT NULL DEFAULT 1,
            next_run     TEXT,                           -- NULL: never due
            lock         TEXT,                           -- NULL: unclaimed
            created      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs (name);
        -- Polling: WHERE enabled = 1 AND lock IS NULL AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (next_run, enabled, lock);

        CREATE TABLE IF NOT EXISTS job_logs (
            id            TEXT NOT NULL PRIMARY KEY,
            created       TEXT NOT NULL,
            node          TEXT NOT NULL,
            job_id        TEXT NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            result        TEXT,                          -- codec-encoded or NULL
            failure_info  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_logs_created_node ON job_logs (created, node);
        CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, created);
        ",
    )?;
    Ok(())
}

/// Render a timestamp in the column format, e.g. `2026-01-01T00:00:00.000000Z`.
pub fn format_ts(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Cut `ts` to the column precision, so an instant held in memory compares
/// equal to the value read back.
pub fn truncate_ts(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

pub fn parse_ts(raw: &str) -> std::result::Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

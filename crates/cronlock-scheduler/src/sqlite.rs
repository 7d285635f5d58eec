use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::codec::{ArgCodec, JsonCodec};
use crate::db::{format_ts, init_db, parse_ts, truncate_ts};
use crate::error::{Result, SchedulerError};
use crate::lock::Claimed;
use crate::log::LogSink;
use crate::schedule;
use crate::store::{ClaimOutcome, ClaimRequest, JobStore};
use crate::types::{Job, JobLog, JobPatch, NewJob, NewLog, Timestamp};

const JOB_COLUMNS: &str =
    "id, name, description, function, args, kwargs, schedule, enabled, next_run, lock, created";
const LOG_COLUMNS: &str = "id, created, node, job_id, result, failure_info";

/// SQLite-backed [`JobStore`] and [`LogSink`].
///
/// Wraps one connection in a `Mutex`. Each worker process (or thread that
/// wants to poll independently) opens its own `SqliteStore` on the shared
/// database file; SQLite's write lock is what serializes competing claims.
pub struct SqliteStore {
    db: Mutex<Connection>,
    codec: Box<dyn ArgCodec>,
}

impl SqliteStore {
    /// Wrap an already-open connection and initialise the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            codec: Box::new(JsonCodec),
        })
    }

    /// Open (or create) the database file shared by all workers.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    pub fn with_codec(mut self, codec: impl ArgCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_jobs(
        &self,
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params, JobRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;

        // A row the codec cannot read is skipped rather than failing the
        // whole listing; it stays visible through `get`.
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_job(self.codec.as_ref()) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(job_id = %id, "skipping unreadable job row: {e}");
                        None
                    }
                }
            })
            .collect())
    }

    fn query_logs(
        &self,
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<JobLog>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows: Vec<LogRow> = stmt
            .query_map(params, LogRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter()
            .map(|row| row.into_log(self.codec.as_ref()))
            .collect()
    }

    fn get_with(&self, conn: &Connection, id: &str) -> Result<Option<Job>> {
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_job(self.codec.as_ref())).transpose()
    }
}

fn parse_column(raw: &str) -> Result<Timestamp> {
    parse_ts(raw).map_err(|e| SchedulerError::InvalidTimestamp(format!("{raw}: {e}")))
}

struct JobRow {
    id: String,
    name: String,
    description: String,
    function: String,
    args: String,
    kwargs: String,
    schedule: String,
    enabled: bool,
    next_run: Option<String>,
    lock: Option<String>,
    created: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            function: row.get(3)?,
            args: row.get(4)?,
            kwargs: row.get(5)?,
            schedule: row.get(6)?,
            enabled: row.get::<_, i64>(7)? != 0,
            next_run: row.get(8)?,
            lock: row.get(9)?,
            created: row.get(10)?,
        })
    }

    fn into_job(self, codec: &dyn ArgCodec) -> Result<Job> {
        Ok(Job {
            args: codec.decode_args(&self.args)?,
            kwargs: codec.decode_kwargs(&self.kwargs)?,
            next_run: self.next_run.as_deref().map(parse_column).transpose()?,
            lock: self.lock.as_deref().map(parse_column).transpose()?,
            created: parse_column(&self.created)?,
            id: self.id,
            name: self.name,
            description: self.description,
            function: self.function,
            schedule: self.schedule,
            enabled: self.enabled,
        })
    }
}

struct LogRow {
    id: String,
    created: String,
    node: String,
    job_id: String,
    result: Option<String>,
    failure_info: Option<String>,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created: row.get(1)?,
            node: row.get(2)?,
            job_id: row.get(3)?,
            result: row.get(4)?,
            failure_info: row.get(5)?,
        })
    }

    fn into_log(self, codec: &dyn ArgCodec) -> Result<JobLog> {
        Ok(JobLog {
            created: parse_column(&self.created)?,
            result: self
                .result
                .as_deref()
                .map(|r| codec.decode_value(r))
                .transpose()?,
            id: self.id,
            node: self.node,
            job_id: self.job_id,
            failure_info: self.failure_info,
        })
    }
}

impl JobStore for SqliteStore {
    #[instrument(skip(self, job), fields(name = %job.name))]
    fn create(&self, job: NewJob, now: Timestamp) -> Result<Job> {
        let schedule = job.schedule.trim().to_string();
        let created = truncate_ts(now);
        let next_run = schedule::compute_next_run(&schedule, now)?;
        let id = Uuid::now_v7().to_string();
        let args = self.codec.encode_args(&job.args)?;
        let kwargs = self.codec.encode_kwargs(&job.kwargs)?;

        self.conn().execute(
            "INSERT INTO jobs
             (id, name, description, function, args, kwargs, schedule,
              enabled, next_run, lock, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)",
            rusqlite::params![
                id,
                job.name,
                job.description,
                job.function,
                args,
                kwargs,
                schedule,
                job.enabled,
                format_ts(next_run),
                format_ts(created),
            ],
        )?;

        info!(job_id = %id, function = %job.function, %next_run, "job created");

        Ok(Job {
            id,
            name: job.name,
            description: job.description,
            function: job.function,
            args: job.args,
            kwargs: job.kwargs,
            schedule,
            enabled: job.enabled,
            next_run: Some(next_run),
            lock: None,
            created,
        })
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        self.get_with(&conn, id)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        self.query_jobs(
            &conn,
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created, id"),
            [],
        )
    }

    #[instrument(skip(self, patch))]
    fn update(&self, id: &str, patch: JobPatch, now: Timestamp) -> Result<Job> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = self
            .get_with(&tx, id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;

        let reschedule = match patch.schedule {
            Some(schedule) if schedule.trim() != job.schedule => {
                let schedule = schedule.trim().to_string();
                let next_run = schedule::compute_next_run(&schedule, now)?;
                job.schedule = schedule;
                job.next_run = Some(next_run);
                true
            }
            _ => false,
        };
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = description;
        }
        if let Some(function) = patch.function {
            job.function = function;
        }
        if let Some(args) = patch.args {
            job.args = args;
        }
        if let Some(kwargs) = patch.kwargs {
            job.kwargs = kwargs;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }

        // `lock` is never written here, so an edit cannot clobber a live claim.
        tx.execute(
            "UPDATE jobs
             SET name = ?2, description = ?3, function = ?4, args = ?5,
                 kwargs = ?6, schedule = ?7, enabled = ?8,
                 next_run = CASE WHEN ?9 THEN ?10 ELSE next_run END
             WHERE id = ?1",
            rusqlite::params![
                id,
                job.name,
                job.description,
                job.function,
                self.codec.encode_args(&job.args)?,
                self.codec.encode_kwargs(&job.kwargs)?,
                job.schedule,
                job.enabled,
                reschedule,
                job.next_run.map(format_ts),
            ],
        )?;
        let job = self
            .get_with(&tx, id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        tx.commit()?;

        info!(job_id = %id, rescheduled = reschedule, "job updated");
        Ok(job)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let n = self.conn().execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    fn select_due(&self, now: Timestamp) -> Result<Vec<Job>> {
        let conn = self.conn();
        self.query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE enabled = 1 AND lock IS NULL
                   AND next_run IS NOT NULL AND next_run <= ?1"
            ),
            [format_ts(now)],
        )
    }

    fn select_stale(&self, now: Timestamp, expired_before: Timestamp) -> Result<Vec<Job>> {
        let conn = self.conn();
        self.query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE enabled = 1 AND lock IS NOT NULL AND lock <= ?2
                   AND next_run IS NOT NULL AND next_run <= ?1"
            ),
            [format_ts(now), format_ts(expired_before)],
        )
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    fn claim(&self, request: ClaimRequest<'_>) -> Result<ClaimOutcome> {
        // One conditional UPDATE: whichever poller's statement commits first
        // wins, every other one matches zero rows.
        let mut sql = String::from(
            "UPDATE jobs SET lock = ?1
             WHERE id = ?2
               AND (lock IS NULL OR (?3 IS NOT NULL AND lock <= ?3))",
        );
        if request.only_if_due {
            sql.push_str(" AND enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1");
        }

        let conn = self.conn();
        let changed = conn.execute(
            &sql,
            rusqlite::params![
                format_ts(request.now),
                request.job_id,
                request.expired_before.map(format_ts),
            ],
        )?;
        if changed == 1 {
            debug!("claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [request.job_id], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(if exists {
            ClaimOutcome::Held
        } else {
            ClaimOutcome::Missing
        })
    }

    fn release(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("UPDATE jobs SET lock = NULL WHERE id = ?1", [id])?;
        Ok(())
    }

    fn finish(&self, claim: &Claimed, next_run: Option<Timestamp>) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET lock = NULL, next_run = ?2 WHERE id = ?1 AND lock = ?3",
            rusqlite::params![claim.job_id, next_run.map(format_ts), format_ts(claim.at)],
        )?;
        if n == 1 {
            return Ok(());
        }

        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [&claim.job_id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            warn!(job_id = %claim.job_id, claimed_at = %claim.at, "lock was taken over, leaving it in place");
            Err(SchedulerError::ClaimLost {
                id: claim.job_id.clone(),
            })
        } else {
            Err(SchedulerError::JobNotFound {
                id: claim.job_id.clone(),
            })
        }
    }

    fn abandon(&self, claim: &Claimed) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE jobs SET lock = NULL WHERE id = ?1 AND lock = ?2",
            rusqlite::params![claim.job_id, format_ts(claim.at)],
        )?;
        if n == 0 {
            debug!(job_id = %claim.job_id, "claim already gone, nothing to abandon");
        }
        Ok(())
    }
}

impl LogSink for SqliteStore {
    fn record(&self, entry: NewLog, now: Timestamp) -> Result<JobLog> {
        let id = Uuid::now_v7().to_string();
        let created = truncate_ts(now);
        let result = entry
            .result
            .as_ref()
            .map(|v| self.codec.encode_value(v))
            .transpose()?;

        self.conn().execute(
            "INSERT INTO job_logs (id, created, node, job_id, result, failure_info)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                format_ts(created),
                entry.node,
                entry.job_id,
                result,
                entry.failure_info,
            ],
        )?;

        Ok(JobLog {
            id,
            created,
            node: entry.node,
            job_id: entry.job_id,
            result: entry.result,
            failure_info: entry.failure_info,
        })
    }

    fn list_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<JobLog>> {
        let conn = self.conn();
        self.query_logs(
            &conn,
            &format!(
                "SELECT {LOG_COLUMNS} FROM job_logs
                 WHERE job_id = ?1
                 ORDER BY created DESC, id DESC
                 LIMIT ?2"
            ),
            rusqlite::params![job_id, limit as i64],
        )
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<JobLog>> {
        let conn = self.conn();
        self.query_logs(
            &conn,
            &format!(
                "SELECT {LOG_COLUMNS} FROM job_logs
                 ORDER BY created DESC, id DESC
                 LIMIT ?1"
            ),
            [limit as i64],
        )
    }

    #[instrument(skip(self))]
    fn purge(&self, older_than: Timestamp, nodes: &[String]) -> Result<usize> {
        let mut sql = String::from("DELETE FROM job_logs WHERE created <= ?1");
        let mut params = vec![format_ts(older_than)];
        if !nodes.is_empty() {
            let placeholders: Vec<String> = (0..nodes.len()).map(|i| format!("?{}", i + 2)).collect();
            sql.push_str(&format!(" AND node IN ({})", placeholders.join(", ")));
            params.extend(nodes.iter().cloned());
        }

        let n = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(params.iter()))?;
        info!(removed = n, "job logs purged");
        Ok(n)
    }
}

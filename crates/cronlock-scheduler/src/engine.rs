use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::executor::{ExecutionFailure, Executor};
use crate::lock::{Claimed, LockManager};
use crate::log::LogSink;
use crate::registry::FunctionRegistry;
use crate::schedule::compute_next_run;
use crate::store::JobStore;
use crate::types::{Job, JobLog, NewLog, Timestamp};

/// What one claimed run did.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: String,
    pub result: Option<Value>,
    pub failure: Option<ExecutionFailure>,
    /// `None` when the schedule could not produce a next instant; the job is
    /// then parked until its schedule is edited.
    pub next_run: Option<Timestamp>,
    pub log: JobLog,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// A job whose run could not be persisted.
#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub job_id: String,
    pub name: String,
    pub error: String,
}

/// Summary of one [`Scheduler::run_once`] pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Held by another poller (or already run by one) at claim time.
    pub skipped_locked: usize,
    /// Deleted between selection and claim.
    pub vanished: usize,
    pub errors: Vec<JobError>,
    /// Set when the due-job query itself failed; nothing ran.
    pub selection_error: Option<String>,
}

/// Drives poll passes: select due jobs, claim, execute, reschedule, release, log.
///
/// Stateless between passes; every worker process builds its own instance
/// over its own store connection.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogSink>,
    locks: LockManager,
    executor: Executor,
    node: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        logs: Arc<dyn LogSink>,
        registry: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            store,
            logs,
            locks: LockManager::default(),
            executor: Executor::new(registry),
            node: "local".to_string(),
        }
    }

    /// Allow other pollers to take over a lock older than `timeout`.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.locks = LockManager::new(timeout);
        self
    }

    /// Name recorded on every log row written by this scheduler.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// One poll pass over every job due at `now`.
    ///
    /// Never fails as a whole: a locked job is skipped, a failing function
    /// is logged, and a persistence error is reported for that job alone
    /// while the remaining candidates are still processed. Jobs that become
    /// due while the pass runs wait for the next pass.
    pub fn run_once(&self, now: Timestamp) -> PassReport {
        let mut report = PassReport::default();

        let candidates = match self.candidates(now) {
            Ok(c) => c,
            Err(e) => {
                error!("selecting due jobs failed: {e}");
                report.selection_error = Some(e.to_string());
                return report;
            }
        };
        report.candidates = candidates.len();

        for job in candidates {
            match self.process(&job.id, now, true) {
                Ok(outcome) if outcome.succeeded() => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(SchedulerError::JobLocked { .. }) => {
                    debug!(job_id = %job.id, name = %job.name, "job locked, skipped this pass");
                    report.skipped_locked += 1;
                }
                Err(SchedulerError::JobNotFound { .. }) => {
                    debug!(job_id = %job.id, name = %job.name, "job deleted during pass");
                    report.vanished += 1;
                }
                Err(e) => {
                    error!(job_id = %job.id, name = %job.name, "job run could not be persisted: {e}");
                    report.errors.push(JobError {
                        job_id: job.id.clone(),
                        name: job.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            node = %self.node,
            candidates = report.candidates,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped_locked,
            errors = report.errors.len(),
            "poll pass complete"
        );
        report
    }

    /// Claim and run a single job right now, whether or not it is due.
    ///
    /// Unlike [`Scheduler::run_once`] this surfaces `JobLocked` and
    /// `JobNotFound` to the caller.
    pub fn run_job(&self, job_id: &str, now: Timestamp) -> Result<RunOutcome> {
        self.process(job_id, now, false)
    }

    /// Run passes every `interval` until `shutdown` becomes `true` or its
    /// sender is dropped.
    ///
    /// Each pass runs on the blocking pool, since job functions are plain
    /// synchronous code. A shutdown signalled mid-pass is seen immediately,
    /// but the loop still waits for that pass so no claimed job is left
    /// locked.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node, ?interval, "scheduler loop started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let scheduler = Arc::clone(&self);
            let mut pass = tokio::task::spawn_blocking(move || scheduler.run_once(Utc::now()));
            let stop = tokio::select! {
                joined = &mut pass => {
                    if let Err(e) = joined {
                        error!("poll pass aborted: {e}");
                    }
                    false
                }
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        info!("shutdown requested, waiting for the running pass");
                    }
                    if let Err(e) = pass.await {
                        error!("poll pass aborted: {e}");
                    }
                    stop
                }
            };
            if stop {
                break;
            }
        }
        info!("scheduler loop shutting down");
    }

    // --- private helpers ---------------------------------------------------

    /// Due jobs, plus jobs whose lock has expired when a timeout is set.
    fn candidates(&self, now: Timestamp) -> Result<Vec<Job>> {
        let mut jobs = self.store.select_due(now)?;

        if let Some(cutoff) = self.locks.expired_before(now) {
            let mut seen: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();
            for job in self.store.select_stale(now, cutoff)? {
                if seen.insert(job.id.clone()) {
                    warn!(job_id = %job.id, name = %job.name, lock = ?job.lock, "lock expired, reclaiming");
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    fn process(&self, job_id: &str, now: Timestamp, only_if_due: bool) -> Result<RunOutcome> {
        let store = self.store.as_ref();
        let claim = if only_if_due {
            self.locks.try_claim_due(store, job_id, now)?
        } else {
            self.locks.try_claim(store, job_id, now)?
        };

        // Read under the claim so the run sees the latest arguments.
        let job = match store.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                return Err(SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                })
            }
            Err(e) => {
                if let Err(release_err) = self.locks.release(store, &claim) {
                    error!(%job_id, "release after failed read also failed: {release_err}");
                }
                return Err(e);
            }
        };

        self.execute(&job, &claim, now)
    }

    fn execute(&self, job: &Job, claim: &Claimed, now: Timestamp) -> Result<RunOutcome> {
        info!(job_id = %job.id, name = %job.name, function = %job.function, "executing job");

        let (result, failure) = match self.executor.run(&job.function, &job.args, &job.kwargs) {
            Ok(value) => (Some(value), None),
            Err(failure) => {
                warn!(job_id = %job.id, name = %job.name, kind = %failure.kind, "job failed: {}", failure.detail);
                (None, Some(failure))
            }
        };

        let next_run = match compute_next_run(&job.schedule, now) {
            Ok(next) => Some(next),
            Err(e) => {
                error!(job_id = %job.id, "cannot reschedule, job parked until its schedule is edited: {e}");
                None
            }
        };

        // Release + reschedule, then the log row. Both are attempted even if
        // the first fails so the attempt is still recorded where possible.
        let finished = self.store.finish(claim, next_run);
        if let Err(e) = &finished {
            error!(job_id = %job.id, "release and reschedule failed: {e}");
        }
        let logged = self.logs.record(
            NewLog {
                job_id: job.id.clone(),
                node: self.node.clone(),
                result: result.clone(),
                failure_info: failure.as_ref().map(ToString::to_string),
            },
            now,
        );
        if let Err(e) = &logged {
            error!(job_id = %job.id, "writing execution log failed: {e}");
        }
        finished?;
        let log = logged?;

        Ok(RunOutcome {
            job_id: job.id.clone(),
            result,
            failure,
            next_run,
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use crate::types::NewJob;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn scheduler(store: Arc<SqliteStore>) -> Scheduler {
        let mut registry = FunctionRegistry::new();
        registry
            .register("ok", |_| Ok(json!("done")))
            .register("fail", |_| Err(anyhow::anyhow!("nope")));
        Scheduler::new(store.clone(), store, Arc::new(registry)).with_node("test-node")
    }

    #[test]
    fn pass_counts_outcomes() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let created = t0() - chrono::Duration::seconds(5);
        store.create(NewJob::new("a", "ok", "* * * * * *"), created).unwrap();
        store.create(NewJob::new("b", "fail", "* * * * * *"), created).unwrap();
        store.create(NewJob::new("c", "missing", "* * * * * *"), created).unwrap();
        let locked = store.create(NewJob::new("d", "ok", "* * * * * *"), created).unwrap();
        store.create(NewJob::new("e", "ok", "* * * * * *").disabled(), created).unwrap();
        LockManager::new(None).try_claim(store.as_ref(), &locked.id, created).unwrap();

        let report = scheduler(store.clone()).run_once(t0());
        assert_eq!(report.candidates, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(report.errors.is_empty());
        assert_eq!(store.list_recent(10).unwrap().len(), 3);
    }

    /// Delegates to SQLite but fails `finish` for one job.
    struct FailingFinish {
        inner: Arc<SqliteStore>,
        broken: String,
    }

    impl JobStore for FailingFinish {
        fn create(&self, job: NewJob, now: Timestamp) -> Result<Job> {
            self.inner.create(job, now)
        }
        fn get(&self, id: &str) -> Result<Option<Job>> {
            self.inner.get(id)
        }
        fn list(&self) -> Result<Vec<Job>> {
            self.inner.list()
        }
        fn update(&self, id: &str, patch: crate::types::JobPatch, now: Timestamp) -> Result<Job> {
            self.inner.update(id, patch, now)
        }
        fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id)
        }
        fn select_due(&self, now: Timestamp) -> Result<Vec<Job>> {
            self.inner.select_due(now)
        }
        fn select_stale(&self, now: Timestamp, expired_before: Timestamp) -> Result<Vec<Job>> {
            self.inner.select_stale(now, expired_before)
        }
        fn claim(&self, request: crate::store::ClaimRequest<'_>) -> Result<crate::store::ClaimOutcome> {
            self.inner.claim(request)
        }
        fn release(&self, id: &str) -> Result<()> {
            self.inner.release(id)
        }
        fn finish(&self, claim: &Claimed, next_run: Option<Timestamp>) -> Result<()> {
            if claim.job_id == self.broken {
                return Err(SchedulerError::Database(rusqlite::Error::InvalidQuery));
            }
            self.inner.finish(claim, next_run)
        }
        fn abandon(&self, claim: &Claimed) -> Result<()> {
            self.inner.abandon(claim)
        }
    }

    #[test]
    fn persistence_failure_is_isolated_to_its_job() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        let created = t0() - chrono::Duration::seconds(5);
        let ids: Vec<String> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                sqlite
                    .create(NewJob::new(name, "ok", "* * * * * *"), created)
                    .unwrap()
                    .id
            })
            .collect();
        let store = Arc::new(FailingFinish {
            inner: sqlite.clone(),
            broken: ids[1].clone(),
        });

        let mut registry = FunctionRegistry::new();
        registry.register("ok", |_| Ok(json!("done")));
        let report = Scheduler::new(store, sqlite.clone(), Arc::new(registry)).run_once(t0());

        assert_eq!(report.candidates, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].job_id, ids[1]);
        assert_eq!(report.errors[0].name, "b");
        for id in &ids {
            assert_eq!(sqlite.list_for_job(id, 10).unwrap().len(), 1, "{id}");
        }
        for id in [&ids[0], &ids[2]] {
            let job = sqlite.get(id).unwrap().unwrap();
            assert!(job.lock.is_none());
            assert!(job.next_run.unwrap() > t0());
        }
    }

    #[test]
    fn lost_claim_is_reported_and_new_holder_keeps_lock() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let job = store.create(NewJob::new("a", "ok", "* * * * * *"), t0()).unwrap();
        let locks = LockManager::new(Some(Duration::from_secs(30)));

        let stale = locks.try_claim(store.as_ref(), &job.id, t0()).unwrap();
        let current = locks
            .try_claim(store.as_ref(), &job.id, t0() + chrono::Duration::seconds(31))
            .unwrap();

        let err = store.finish(&stale, Some(t0() + chrono::Duration::hours(1))).unwrap_err();
        assert!(matches!(err, SchedulerError::ClaimLost { .. }));
        assert_eq!(store.get(&job.id).unwrap().unwrap().lock, Some(current.at));

        let blocked = scheduler(store.clone())
            .with_lock_timeout(Some(Duration::from_secs(30)))
            .run_job(&job.id, t0() + chrono::Duration::seconds(40))
            .unwrap_err();
        assert!(matches!(blocked, SchedulerError::JobLocked { .. }));
    }

    #[test]
    fn pass_with_timeout_reclaims_stale_lock() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let created = t0() - chrono::Duration::minutes(10);
        let job = store.create(NewJob::new("a", "ok", "* * * * * *"), created).unwrap();
        LockManager::new(None).try_claim(store.as_ref(), &job.id, created).unwrap();

        let no_timeout = scheduler(store.clone()).run_once(t0());
        assert_eq!(no_timeout.candidates, 0);

        let report = scheduler(store.clone())
            .with_lock_timeout(Some(Duration::from_secs(60)))
            .run_once(t0());
        assert_eq!(report.candidates, 1);
        assert_eq!(report.succeeded, 1);
        let job = store.get(&job.id).unwrap().unwrap();
        assert!(job.lock.is_none());
        assert!(job.next_run.unwrap() > t0());
    }

    #[test]
    fn run_job_surfaces_lock() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let job = store.create(NewJob::new("a", "ok", "* * * * * *"), t0()).unwrap();
        LockManager::new(None).try_claim(store.as_ref(), &job.id, t0()).unwrap();

        let err = scheduler(store).run_job(&job.id, t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::JobLocked { .. }));
    }

    #[test]
    fn run_job_on_missing_job() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let err = scheduler(store).run_job("missing", t0()).unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }

    #[test]
    fn log_records_node() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let job = store.create(NewJob::new("a", "ok", "* * * * * *"), t0()).unwrap();
        let outcome = scheduler(store).run_job(&job.id, t0()).unwrap();
        assert_eq!(outcome.log.node, "test-node");
        assert_eq!(outcome.result, Some(json!("done")));
        assert!(outcome.log.succeeded());
    }

    #[tokio::test]
    async fn loop_runs_until_shutdown() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .create(
                NewJob::new("a", "ok", "* * * * * *"),
                Utc::now() - chrono::Duration::seconds(5),
            )
            .unwrap();
        let sched = Arc::new(scheduler(store.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&sched).run(Duration::from_millis(20), rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!store.list_recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_during_a_slow_pass_waits_for_it() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let job = store
            .create(
                NewJob::new("slow", "slow", "* * * * * *"),
                Utc::now() - chrono::Duration::seconds(5),
            )
            .unwrap();
        let mut registry = FunctionRegistry::new();
        registry.register("slow", |_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(json!("slept"))
        });
        let sched = Arc::new(Scheduler::new(store.clone(), store.clone(), Arc::new(registry)));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&sched).run(Duration::from_secs(3600), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The pass is on the blocking pool, so this task keeps running.
        tx.send(true).unwrap();
        handle.await.unwrap();

        let job = store.get(&job.id).unwrap().unwrap();
        assert!(job.lock.is_none());
        assert_eq!(store.list_for_job(&job.id, 10).unwrap().len(), 1);
    }
}

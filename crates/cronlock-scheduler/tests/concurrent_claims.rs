// Several pollers, each with its own connection to one database file,
// racing for the same job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use cronlock_scheduler::{
    FunctionRegistry, JobStore, LockManager, LogSink, NewJob, Scheduler, SchedulerError,
    SqliteStore,
};
use serde_json::json;

const POLLERS: usize = 8;

fn open(path: &std::path::Path) -> SqliteStore {
    SqliteStore::open(path, Duration::from_secs(10)).unwrap()
}

#[test]
fn exactly_one_claim_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let now = Utc::now();
    let job = open(&path)
        .create(NewJob::new("contended", "f", "* * * * * *"), now)
        .unwrap();

    let barrier = Arc::new(Barrier::new(POLLERS));
    let handles: Vec<_> = (0..POLLERS)
        .map(|_| {
            let path = path.clone();
            let id = job.id.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = open(&path);
                barrier.wait();
                LockManager::new(None).try_claim(&store, &id, now)
            })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => won += 1,
            Err(SchedulerError::JobLocked { .. }) => {}
            Err(e) => panic!("unexpected claim error: {e}"),
        }
    }
    assert_eq!(won, 1);
}

#[test]
fn concurrent_passes_run_a_due_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let created = Utc::now() - chrono::Duration::seconds(5);
    let job = open(&path)
        .create(NewJob::new("counted", "count", "* * * * * *"), created)
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = FunctionRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register("count", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        });
    }
    let registry = Arc::new(registry);

    let now = Utc::now();
    let barrier = Arc::new(Barrier::new(POLLERS));
    let handles: Vec<_> = (0..POLLERS)
        .map(|i| {
            let path = path.clone();
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = Arc::new(open(&path));
                let scheduler =
                    Scheduler::new(store.clone(), store, registry).with_node(format!("node-{i}"));
                barrier.wait();
                scheduler.run_once(now)
            })
        })
        .collect();

    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reports.iter().map(|r| r.succeeded).sum::<usize>(), 1);
    assert!(reports.iter().all(|r| r.errors.is_empty()));

    let store = open(&path);
    assert_eq!(store.list_for_job(&job.id, 10).unwrap().len(), 1);
    let job = store.get(&job.id).unwrap().unwrap();
    assert!(job.lock.is_none());
    assert!(job.next_run.unwrap() > now);
}

#[test]
fn takeover_after_timeout_from_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let first = open(&path);
    let second = open(&path);
    let t0 = Utc::now();
    let job = first
        .create(NewJob::new("stuck", "f", "* * * * * *"), t0)
        .unwrap();

    let locks = LockManager::new(Some(Duration::from_secs(30)));
    locks.try_claim(&first, &job.id, t0).unwrap();

    let too_early = locks.try_claim(&second, &job.id, t0 + chrono::Duration::seconds(10));
    assert!(matches!(too_early, Err(SchedulerError::JobLocked { .. })));

    let later = t0 + chrono::Duration::seconds(31);
    let claimed = locks.try_claim(&second, &job.id, later).unwrap();
    assert_eq!(first.get(&job.id).unwrap().unwrap().lock, Some(claimed.at));
}

#[test]
fn stalled_holder_cannot_clear_a_takeover() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let a = open(&path);
    let b = open(&path);
    let c = open(&path);
    let t0 = Utc::now();
    let job = a
        .create(NewJob::new("slow", "f", "* * * * * *"), t0)
        .unwrap();
    let locks = LockManager::new(Some(Duration::from_secs(30)));

    let stalled = locks.try_claim(&a, &job.id, t0).unwrap();
    let takeover = locks
        .try_claim(&b, &job.id, t0 + chrono::Duration::seconds(31))
        .unwrap();

    // The stalled holder wakes up and tries to wrap up its run.
    let finished = a.finish(&stalled, Some(t0 + chrono::Duration::hours(1)));
    assert!(matches!(finished, Err(SchedulerError::ClaimLost { .. })));
    locks.release(&a, &stalled).unwrap();
    assert_eq!(c.get(&job.id).unwrap().unwrap().lock, Some(takeover.at));

    let third = locks.try_claim(&c, &job.id, t0 + chrono::Duration::seconds(35));
    assert!(matches!(third, Err(SchedulerError::JobLocked { .. })));

    b.finish(&takeover, Some(t0 + chrono::Duration::hours(1))).unwrap();
    assert!(c.get(&job.id).unwrap().unwrap().lock.is_none());
}

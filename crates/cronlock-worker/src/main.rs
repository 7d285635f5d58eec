use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use cronlock_core::config::{ensure_parent_dir, CronlockConfig};
use cronlock_scheduler::schedule::CronSchedule;
use cronlock_scheduler::{
    JobPatch, JobStore, LogSink, NewJob, PassReport, Scheduler, SqliteStore,
};
use serde_json::{Map, Value};
use tracing::{info, warn};

mod builtins;
mod cli;

use cli::{Cli, Command, JobsCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronlock_worker=info,cronlock_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > CRONLOCK_CONFIG > ~/.cronlock/cronlock.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRONLOCK_CONFIG").ok());
    let config = CronlockConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CronlockConfig::default()
    });

    match cli.command {
        // `check` never touches the database.
        Command::Check { expression, count } => check(&expression, count),
        command => run_command(&config, command).await,
    }
}

async fn run_command(config: &CronlockConfig, command: Command) -> anyhow::Result<()> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(
        SqliteStore::open(db_path, config.database.busy_timeout())
            .with_context(|| format!("opening {db_path}"))?,
    );

    let registry = Arc::new(builtins::registry(store.clone()));
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), store.clone(), registry)
            .with_lock_timeout(config.scheduler.lock_timeout())
            .with_node(config.scheduler.node_name()),
    );
    if scheduler.locks().timeout().is_none() {
        warn!("no lock timeout configured; a job left locked by a crashed worker stays locked until `jobs unlock`");
    }

    match command {
        Command::Check { expression, count } => check(&expression, count)?,
        Command::Once => {
            let report = scheduler.run_once(Utc::now());
            print_report(&report);
        }
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received");
                }
                let _ = shutdown_tx.send(true);
            });
            scheduler
                .run(config.scheduler.poll_interval(), shutdown_rx)
                .await;
        }
        Command::Jobs(cmd) => jobs(&scheduler, store.as_ref(), cmd)?,
        Command::Logs { job, limit } => {
            let logs = match job {
                Some(id) => store.list_for_job(&id, limit)?,
                None => store.list_recent(limit)?,
            };
            for log in logs {
                let outcome = match (&log.result, &log.failure_info) {
                    (_, Some(failure)) => format!("FAILED {}", first_line(failure)),
                    (Some(result), None) => format!("ok {result}"),
                    (None, None) => "ok".to_string(),
                };
                println!(
                    "{}  {}  {}  {}",
                    log.created.to_rfc3339(),
                    log.job_id,
                    log.node,
                    outcome
                );
            }
        }
        Command::Functions => {
            for name in scheduler.executor().registry().names() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn check(expression: &str, count: usize) -> anyhow::Result<()> {
    let schedule = CronSchedule::parse(expression)?;
    println!("{}: next {count} runs", schedule.expression());
    for at in schedule.upcoming(Utc::now(), count) {
        println!("{}", at.to_rfc3339());
    }
    Ok(())
}

fn jobs(scheduler: &Scheduler, store: &SqliteStore, cmd: JobsCommand) -> anyhow::Result<()> {
    let now = Utc::now();
    match cmd {
        JobsCommand::Add {
            name,
            function,
            schedule,
            args,
            kwargs,
            description,
            disabled,
        } => {
            let args: Vec<Value> =
                serde_json::from_str(&args).context("--args must be a JSON array")?;
            let kwargs: Map<String, Value> =
                serde_json::from_str(&kwargs).context("--kwargs must be a JSON object")?;
            if !scheduler.executor().registry().contains(&function) {
                warn!(%function, "function is not registered on this worker");
            }
            let mut new = NewJob::new(name, function, schedule)
                .with_description(description)
                .with_args(args)
                .with_kwargs(kwargs);
            if disabled {
                new = new.disabled();
            }
            let job = store.create(new, now)?;
            println!("{}", job.id);
        }
        JobsCommand::List => {
            for job in store.list()? {
                let next = job
                    .next_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let state = match (job.enabled, job.is_locked()) {
                    (_, true) => "locked",
                    (true, false) => "enabled",
                    (false, false) => "disabled",
                };
                println!(
                    "{}  {:<8}  {:<20}  {:<16}  {}  {}",
                    job.id, state, job.schedule, job.name, job.function, next
                );
            }
        }
        JobsCommand::Enable { id } => {
            store.update(&id, JobPatch::enabled(true), now)?;
        }
        JobsCommand::Disable { id } => {
            store.update(&id, JobPatch::enabled(false), now)?;
        }
        JobsCommand::Remove { id } => store.delete(&id)?,
        JobsCommand::Reschedule { id, schedule } => {
            let job = store.update(&id, JobPatch::schedule(schedule), now)?;
            if let Some(next) = job.next_run {
                println!("{}", next.to_rfc3339());
            }
        }
        JobsCommand::Run { id } => {
            let outcome = scheduler.run_job(&id, now)?;
            match (&outcome.result, &outcome.failure) {
                (_, Some(failure)) => println!("FAILED {failure}"),
                (Some(result), None) => println!("{result}"),
                (None, None) => {}
            }
        }
        JobsCommand::Unlock { id } => scheduler.locks().force_release(store, &id)?,
    }
    Ok(())
}

fn print_report(report: &PassReport) {
    println!(
        "candidates={} succeeded={} failed={} skipped_locked={} vanished={}",
        report.candidates, report.succeeded, report.failed, report.skipped_locked, report.vanished
    );
    if let Some(err) = &report.selection_error {
        println!("selection failed: {err}");
    }
    for err in &report.errors {
        println!("{} ({}): {}", err.job_id, err.name, err.error);
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

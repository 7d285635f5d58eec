use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "cronlock-worker",
    version,
    about = "Poll a shared job store and run the cron jobs that are due"
)]
pub struct Cli {
    /// Config file. Falls back to $CRONLOCK_CONFIG, then ~/.cronlock/cronlock.toml.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single poll pass and exit.
    Once,
    /// Run a poll pass every `scheduler.poll_interval_secs` until Ctrl-C.
    Run,
    /// Validate a cron expression and print its next run times.
    Check {
        expression: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Inspect and edit jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Show execution logs, newest first.
    Logs {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List the functions this worker can run.
    Functions,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// Register a job. The schedule is validated before anything is stored.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        function: String,
        #[arg(long)]
        schedule: String,
        /// JSON array of positional arguments.
        #[arg(long, default_value = "[]")]
        args: String,
        /// JSON object of keyword arguments.
        #[arg(long, default_value = "{}")]
        kwargs: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Enable { id: String },
    Disable { id: String },
    Remove { id: String },
    /// Replace the schedule; the next run is recomputed immediately.
    Reschedule { id: String, schedule: String },
    /// Claim and run one job now, whether or not it is due.
    Run { id: String },
    /// Clear a lock left behind by a crashed worker.
    Unlock { id: String },
}

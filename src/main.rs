//! worker-agent — entry point
//!
//! All stdout is JSON only (one envelope line per `run-job` invocation, or
//! the tailed unified log for `start`). Tracing logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use worker_agent::types::{AgentEnvelope, JobError, Timing};
use worker_agent::{orchestrator, paths, reaper, start, supervisor};

#[derive(Debug, Parser)]
#[command(name = "worker-agent")]
#[command(about = "Container-local job execution agent", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Override the on-disk state root (jobs/workers/lock files).
    #[arg(long, global = true)]
    root: Option<String>,

    /// Override the log root (agent/unified/job/worker logs).
    #[arg(long, global = true)]
    log_root: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute one job end-to-end and print the stdout envelope.
    RunJob {
        /// Base64-encoded `JobPayload` JSON.
        #[arg(long)]
        payload_base64: String,
    },

    /// Run a persistent worker under supervision until it exits.
    WorkerSupervisor {
        /// Base64-encoded worker-supervisor config JSON.
        #[arg(long)]
        worker_config_base64: String,
    },

    /// PID-1 entrypoint: warm up workers, then tail the unified log.
    Start {
        /// `--warmup <port> <cmd…>`, repeatable.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let state_root = paths::resolve_state_root(cli.root.as_deref());
    let log_root = paths::resolve_log_root(cli.log_root.as_deref());

    match run(cli.command, &state_root, &log_root) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // A failure here means the orchestrator itself never got to
            // print its envelope (e.g. the state root is unwritable); this
            // is the one path that still owes stdout a JSON line, per §6's
            // "always the last line the agent writes to its own stdout".
            let envelope = AgentEnvelope {
                success: false,
                job_id: String::new(),
                job_class: String::new(),
                status: None,
                exit_code: None,
                result: None,
                output_files: vec![],
                worker_pid: None,
                timing: Timing::default(),
                error: Some(JobError::new("internal_error", format!("{e:#}"))),
            };
            envelope.print();
            std::process::exit(1);
        }
    }
}

fn run(command: Command, state_root: &std::path::Path, log_root: &std::path::Path) -> Result<i32> {
    // §4.A/§9: the reaper is installed in every invocation, not just
    // `start` — `install()` only wires the SIGCHLD handler and poll
    // thread, it leaves reaping inactive until `enable()` is called.
    reaper::install()?;

    match command {
        Command::RunJob { payload_base64 } => {
            orchestrator::run(&payload_base64, state_root, log_root)
        }

        Command::WorkerSupervisor {
            worker_config_base64,
        } => {
            let config = supervisor::decode_config(&worker_config_base64)?;
            supervisor::run(&config, state_root, log_root)?;
            Ok(0)
        }

        Command::Start { args } => {
            start::run(&args, state_root, log_root)?;
            Ok(0)
        }
    }
}

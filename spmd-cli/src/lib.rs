#![warn(missing_docs)]
//! spmd CLI Library
//!
//! Command-line entry point for SPMD programs. The same executable plays
//! two parts: started by a user it is the launcher, which starts the group
//! (as processes or threads); started by the launcher with the hidden
//! `--spmd-task` flag it is one task of that group.
//!
//! # Example
//!
//! ```ignore
//! use spmd::prelude::*;
//!
//! fn main() -> anyhow::Result<std::process::ExitCode> {
//!     spmd::run(MyManager::default(), MyWorker::default())
//! }
//! ```

mod config;
mod hub;
mod launcher;
mod server;

pub use config::*;
pub use hub::{Hub, Outbox};
pub use launcher::{
    LaunchError, LaunchPlan, LaunchReport, TASK_FLAG, TIMEOUT_EXIT_CODE, aggregate_exit_codes,
    exit_code_of, launch,
};
pub use server::{HubReader, HubServer, HubWriter};

use clap::Parser;
use spmd_core::{LocalGroup, ManagerWorkload, PipeTransport, RoleRunner, RunOptions, WorkerWorkload};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Exit code reported for a task thread that panicked
pub const PANIC_EXIT_CODE: u8 = 101;

/// spmd CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Run an SPMD program as a group of cooperating tasks")]
pub struct Cli {
    /// Number of tasks in the group
    #[arg(short = 'n', long)]
    pub tasks: Option<usize>,

    /// Rank that runs the manager workload
    #[arg(long)]
    pub manager_rank: Option<usize>,

    /// How tasks are hosted: process or thread
    #[arg(long, value_enum)]
    pub isolation: Option<IsolationMode>,

    /// Skip the barrier before the workload starts
    #[arg(long)]
    pub no_sync_starts: bool,

    /// Add a barrier after the workload ends
    #[arg(long)]
    pub sync_ends: bool,

    /// Wall-clock limit for the whole group in seconds (0 disables it;
    /// no limit unless `spmd.toml` sets one)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as one task of a launched group
    #[arg(long, hide = true)]
    pub spmd_task: bool,

    /// Arguments handed to the workload
    #[arg(last = true)]
    pub task_args: Vec<String>,
}

/// Effective settings after merging `spmd.toml` and the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Number of tasks
    pub tasks: usize,
    /// Role and synchronization options for every task
    pub options: RunOptions,
    /// How tasks are hosted
    pub isolation: IsolationMode,
    /// Wall-clock limit for the group
    pub timeout: Option<Duration>,
    /// Debug logging
    pub verbose: bool,
}

impl Settings {
    /// Merge `cli` over `config`.
    pub fn resolve(cli: &Cli, config: &SpmdConfig) -> anyhow::Result<Self> {
        let tasks = cli.tasks.unwrap_or(config.group.tasks);
        if tasks == 0 {
            anyhow::bail!("a group needs at least one task");
        }
        let timeout = match cli.timeout {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => config.timeout()?,
        };
        Ok(Self {
            tasks,
            options: RunOptions {
                manager_rank: cli.manager_rank.unwrap_or(config.group.manager_rank),
                sync_starts: config.group.sync_starts && !cli.no_sync_starts,
                sync_ends: config.group.sync_ends || cli.sync_ends,
            },
            isolation: cli.isolation.unwrap_or(config.launcher.isolation),
            timeout,
            verbose: cli.verbose,
        })
    }

    /// Arguments for a launched task, after [`TASK_FLAG`].
    ///
    /// Every option is spelled out so a task never consults `spmd.toml`.
    pub fn task_argv(&self, workload_args: &[String]) -> Vec<String> {
        let mut argv = vec![
            "--manager-rank".to_string(),
            self.options.manager_rank.to_string(),
        ];
        if !self.options.sync_starts {
            argv.push("--no-sync-starts".to_string());
        }
        if self.options.sync_ends {
            argv.push("--sync-ends".to_string());
        }
        if self.verbose {
            argv.push("--verbose".to_string());
        }
        if !workload_args.is_empty() {
            argv.push("--".to_string());
            argv.extend(workload_args.iter().cloned());
        }
        argv
    }
}

/// Run the spmd CLI with the given workloads.
/// This is the main entry point for SPMD binaries.
pub fn run<M, W>(manager: M, worker: W) -> anyhow::Result<ExitCode>
where
    M: ManagerWorkload + Clone + Send,
    W: WorkerWorkload + Clone + Send,
{
    let cli = Cli::parse();
    run_with_cli(cli, manager, worker)
}

/// Run the spmd CLI with pre-parsed arguments.
pub fn run_with_cli<M, W>(cli: Cli, manager: M, worker: W) -> anyhow::Result<ExitCode>
where
    M: ManagerWorkload + Clone + Send,
    W: WorkerWorkload + Clone + Send,
{
    // Initialize logging; stdout is left to the workload
    let filter = if cli.verbose { "spmd=debug" } else { "spmd=info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    // Handle task mode first; the launcher already resolved every option
    if cli.spmd_task {
        let settings = Settings::resolve(&cli, &SpmdConfig::default())?;
        return Ok(run_task_mode(&settings, &cli.task_args, manager, worker));
    }

    // Discover spmd.toml configuration (CLI flags override)
    let config = SpmdConfig::discover().unwrap_or_default();
    let settings = Settings::resolve(&cli, &config)?;
    debug!(?settings, "resolved settings");

    let code = match settings.isolation {
        IsolationMode::Process => {
            let plan = LaunchPlan::current_exe(settings.tasks, settings.task_argv(&cli.task_args))?
                .with_timeout(settings.timeout);
            let report = launch(&plan)?;
            info!(rounds = report.rounds, codes = ?report.exit_codes, "group finished");
            report.exit_code(settings.options.manager_rank)
        }
        IsolationMode::Thread => {
            let codes = run_threads(&settings, &cli.task_args, manager, worker);
            aggregate_exit_codes(&codes, settings.options.manager_rank)
        }
    };
    Ok(ExitCode::from(code))
}

/// Run as one launched task (IPC mode)
fn run_task_mode<M, W>(settings: &Settings, args: &[String], manager: M, worker: W) -> ExitCode
where
    M: ManagerWorkload,
    W: WorkerWorkload,
{
    let mut runner = RoleRunner::with_options(manager, worker, settings.options);
    runner.run(PipeTransport::from_env(), args).into()
}

/// Run every task of the group on its own thread and return each task's
/// exit code, in rank order.
pub fn run_threads<M, W>(settings: &Settings, args: &[String], manager: M, worker: W) -> Vec<u8>
where
    M: ManagerWorkload + Clone + Send,
    W: WorkerWorkload + Clone + Send,
{
    let endpoints = LocalGroup::named("world", settings.tasks);
    let options = settings.options;
    thread::scope(|s| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let manager = manager.clone();
                let worker = worker.clone();
                s.spawn(move || {
                    RoleRunner::with_options(manager, worker, options)
                        .run(endpoint, args)
                        .exit_code()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(PANIC_EXIT_CODE))
            .collect()
    })
}

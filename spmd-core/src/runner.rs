//! Role dispatch and run sequencing
//!
//! ```text
//! Init ──► StartSync ──► Dispatch ──► EndSync ──► Finalize
//!   │          │            │            │            ▲
//!   └──────────┴────────────┴────────────┴────────────┘
//!                  (any failure skips ahead)
//! ```
//!
//! The sequence never loops or steps back. Finalize runs exactly once on
//! every path, and the first failure recorded is the one reported.

use crate::collective::CollectiveOps;
use crate::context::{GroupContext, Role};
use crate::error::{ErrorCode, RunStatus};
use crate::transport::Transport;
use tracing::info;

/// The manager half of a workload
pub trait ManagerWorkload {
    /// Run on the task whose rank equals the manager rank
    fn run_as_manager(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode>;
}

/// The worker half of a workload
pub trait WorkerWorkload {
    /// Run on every task except the manager
    fn run_as_worker(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode>;
}

impl<F> ManagerWorkload for F
where
    F: FnMut(&GroupContext, &CollectiveOps<'_>, &[String]) -> Result<(), ErrorCode>,
{
    fn run_as_manager(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode> {
        self(ctx, ops, args)
    }
}

impl<F> WorkerWorkload for F
where
    F: FnMut(&GroupContext, &CollectiveOps<'_>, &[String]) -> Result<(), ErrorCode>,
{
    fn run_as_worker(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode> {
        self(ctx, ops, args)
    }
}

/// Knobs for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Rank that runs the manager workload
    pub manager_rank: usize,
    /// Barrier before dispatch
    pub sync_starts: bool,
    /// Barrier after a successful dispatch
    pub sync_ends: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            manager_rank: 0,
            sync_starts: true,
            sync_ends: false,
        }
    }
}

/// Runs one task of an SPMD program
pub struct RoleRunner<M, W> {
    manager: M,
    worker: W,
    options: RunOptions,
}

impl<M: ManagerWorkload, W: WorkerWorkload> RoleRunner<M, W> {
    /// Runner with default options
    pub fn new(manager: M, worker: W) -> Self {
        Self::with_options(manager, worker, RunOptions::default())
    }

    /// Runner with explicit options
    pub fn with_options(manager: M, worker: W, options: RunOptions) -> Self {
        Self {
            manager,
            worker,
            options,
        }
    }

    /// Run this task over `transport` and return the run's status.
    pub fn run(&mut self, transport: impl Transport + 'static, args: &[String]) -> RunStatus {
        let mut ctx = GroupContext::new(transport, self.options.manager_rank);
        if let Err(code) = self.execute(&mut ctx, args) {
            ctx.record(code);
        }
        let name = ctx.task_name();
        let status = ctx.finalize();
        info!(task = %name, exit_code = status.exit_code(), "task ending");
        status
    }

    fn execute(&mut self, ctx: &mut GroupContext, args: &[String]) -> Result<(), ErrorCode> {
        ctx.init()?;
        let ctx: &GroupContext = ctx;
        info!(task = %ctx.task_name(), role = ?ctx.role(), "task started");

        let ops = ctx.collectives();
        if self.options.sync_starts {
            ops.barrier()?;
        }

        match ctx.role() {
            Role::Manager => self.manager.run_as_manager(ctx, &ops, args)?,
            Role::Worker => self.worker.run_as_worker(ctx, &ops, args)?,
        }

        if self.options.sync_ends {
            ops.barrier()?;
        }
        Ok(())
    }
}

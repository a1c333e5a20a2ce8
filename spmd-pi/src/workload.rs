//! Manager and worker halves of the π estimate
//!
//! Both roles issue the same collectives in the same order: broadcast the
//! settings, throw darts, barrier, reduce the hit counts into the manager.

use crate::darts::{estimate_pi, rng_for, throw_darts, work_share};
use crate::settings::PiSettings;
use spmd::prelude::*;
use tracing::debug;

/// One task's part of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskShare {
    /// Rank that threw
    pub rank: usize,
    /// Darts thrown
    pub throws: u64,
    /// Darts inside the circle
    pub hits: u64,
}

/// What the manager learns once the reduction completes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiEstimate {
    /// Settings that were distributed
    pub settings: PiSettings,
    /// The manager's own share
    pub share: TaskShare,
    /// Hits summed over the group
    pub total_hits: u64,
    /// `4 * hits / throws`
    pub computed_pi: f64,
}

impl PiEstimate {
    /// Distance from the true value
    pub fn error(&self) -> f64 {
        std::f64::consts::PI - self.computed_pi
    }
}

/// Throw this task's darts, then meet the group at the barrier.
fn throw_share(
    ctx: &GroupContext,
    ops: &CollectiveOps<'_>,
    settings: &PiSettings,
) -> Result<TaskShare, ErrorCode> {
    let throws = work_share(settings.total_throws, ctx.size(), ctx.is_manager());
    let mut rng = rng_for(settings.seed, ctx.rank());
    let hits = throw_darts(&mut rng, throws);
    println!("Task {} had {hits} hits out of {throws} throws", ctx.rank());

    ops.barrier()?;
    Ok(TaskShare {
        rank: ctx.rank(),
        throws,
        hits,
    })
}

/// Manager side: parse, distribute, throw, gather.
pub fn manage(
    ctx: &GroupContext,
    ops: &CollectiveOps<'_>,
    args: &[String],
) -> Result<PiEstimate, ErrorCode> {
    let mut settings = PiSettings::from_args(args)?;
    ops.broadcast_record(&mut settings, None)?;
    debug!(?settings, "settings distributed");

    let share = throw_share(ctx, ops, &settings)?;
    let total_hits = ops.reduce_sum(share.hits, None)?.ok_or_else(|| {
        tracing::warn!(rank = ctx.rank(), "reduction delivered no sum to the manager");
        ErrorCode::Reduce
    })?;

    Ok(PiEstimate {
        settings,
        share,
        total_hits,
        computed_pi: estimate_pi(total_hits, settings.total_throws),
    })
}

/// Worker side: receive, throw, contribute.
pub fn work(ctx: &GroupContext, ops: &CollectiveOps<'_>) -> Result<TaskShare, ErrorCode> {
    let mut settings = PiSettings::default();
    ops.broadcast_record(&mut settings, None)?;

    let share = throw_share(ctx, ops, &settings)?;
    ops.reduce_sum(share.hits, None)?;
    Ok(share)
}

/// Manager workload that prints the estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct PiManager;

impl ManagerWorkload for PiManager {
    fn run_as_manager(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode> {
        println!("{}", ctx.version_string());
        let estimate = manage(ctx, ops, args)?;

        println!("After {} throws...", estimate.settings.total_throws);
        println!("  Computed PI : {}", estimate.computed_pi);
        println!("  Actual   PI : {}", std::f64::consts::PI);
        println!("  Error       : {}", estimate.error());
        Ok(())
    }
}

/// Worker workload
#[derive(Debug, Clone, Copy, Default)]
pub struct PiWorker;

impl WorkerWorkload for PiWorker {
    fn run_as_worker(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        _args: &[String],
    ) -> Result<(), ErrorCode> {
        work(ctx, ops).map(|_| ())
    }
}

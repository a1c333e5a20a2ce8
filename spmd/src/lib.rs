#![warn(missing_docs)]
//! # spmd
//!
//! Single-program-multiple-data coordination for Rust.
//!
//! Every task of a group runs the same executable. One task, the manager,
//! distributes configuration and gathers the aggregate; every other task is
//! a worker. The framework provides:
//! - **Group membership**: size, rank and role, captured once at init
//! - **Collectives**: barrier, broadcast of fixed-size records, sum-reduce
//! - **Role dispatch**: manager and worker workloads behind one runner
//! - **Deterministic teardown**: finalize runs on every path, first error wins
//! - **Launcher**: one process per task over inherited pipes, or one thread per task
//!
//! ## Quick Start
//!
//! ```ignore
//! use spmd::prelude::*;
//!
//! fn manager(ctx: &GroupContext, ops: &CollectiveOps<'_>, args: &[String]) -> Result<(), ErrorCode> {
//!     let total = ops.reduce_sum(ctx.rank() as u64, None)?;
//!     println!("sum of ranks: {total:?}");
//!     Ok(())
//! }
//!
//! fn worker(ctx: &GroupContext, ops: &CollectiveOps<'_>, _args: &[String]) -> Result<(), ErrorCode> {
//!     ops.reduce_sum(ctx.rank() as u64, None)?;
//!     Ok(())
//! }
//!
//! fn main() -> anyhow::Result<std::process::ExitCode> {
//!     spmd::run(manager, worker)
//! }
//! ```

// Re-export core types
pub use spmd_core::{
    CollectiveOps, ErrorCode, GroupContext, LocalGroup, ManagerWorkload, Role, RoleRunner,
    RunOptions, RunStatus, Transport, TransportError, WorkerWorkload,
};

// Re-export the wire record trait
pub use spmd_ipc::{WireError, WireRecord};

// Re-export CLI entry points
pub use spmd_cli::{Cli, IsolationMode, Settings, SpmdConfig, run_threads, run_with_cli};

/// Fault injection for exercising teardown paths in tests
pub mod testing {
    pub use spmd_core::{FaultPoint, FaultyTransport, TransportProbe};
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CollectiveOps, ErrorCode, GroupContext, ManagerWorkload, Role, WireError, WireRecord,
        WorkerWorkload,
    };
}

/// Run the spmd CLI harness.
///
/// Call this from your program's `main()`:
/// ```ignore
/// fn main() -> anyhow::Result<std::process::ExitCode> {
///     spmd::run(MyManager::default(), MyWorker::default())
/// }
/// ```
pub use spmd_cli::run;

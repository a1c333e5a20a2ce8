#![warn(missing_docs)]
//! spmd Core - Task Runtime
//!
//! This crate provides the per-task side of an SPMD program:
//! - `GroupContext` for joining a group and reading this task's identity
//! - `CollectiveOps` for barrier, broadcast and sum-reduce
//! - `RoleRunner` for the init, dispatch, finalize sequence
//! - `LocalGroup` (threads) and `PipeTransport` (launched processes)
//! - `FaultyTransport` for exercising failure paths

mod collective;
mod context;
mod error;
mod fault;
mod local;
mod pipe;
mod round;
mod runner;
mod transport;

pub use collective::CollectiveOps;
pub use context::{GroupContext, Role};
pub use error::{ErrorCode, RunStatus, TransportError};
pub use fault::{FaultPoint, FaultyTransport, TransportProbe};
pub use local::{LocalEndpoint, LocalGroup};
pub use pipe::PipeTransport;
pub use round::{Completion, Rejection, RoundOutcome, RoundTable};
pub use runner::{ManagerWorkload, RoleRunner, RunOptions, WorkerWorkload};
pub use transport::{Transport, host_name};

//! Monte-Carlo estimate of π on an spmd group
//!
//! The manager parses `-t/--throws` and `-s/--seed`, broadcasts the
//! settings, and every task throws its share of darts. Hit counts are
//! summed into the manager, which prints the estimate.

pub mod darts;
pub mod settings;
pub mod workload;

pub use settings::{DEFAULT_TOTAL_THROWS, PiSettings};
pub use workload::{PiEstimate, PiManager, PiWorker, TaskShare, manage, work};

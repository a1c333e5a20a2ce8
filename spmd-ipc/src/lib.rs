#![warn(missing_docs)]
//! spmd IPC Protocol
//!
//! Wire protocol between a task process and the launcher hub that matches
//! its collective calls. Messages are rkyv-archived and carried in
//! length-prefixed frames over an inherited pipe pair.
//!
//! Also defines [`WireRecord`], the fixed-size binary layout used for
//! records that travel through the broadcast primitive.

mod framing;
mod messages;
mod wire;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{CollectiveCall, CollectiveReply, GroupInfo, HubReply, RefusalKind, TaskRequest};
pub use wire::{WireError, WireRecord};

/// Protocol version exchanged in the join handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the inherited `<read_fd>,<write_fd>` pair
pub const IPC_FD_ENV: &str = "SPMD_IPC_FD";

/// Library version reported to tasks (`major.minor` is the API level)
pub const LIBRARY_VERSION: &str = concat!("spmd ", env!("CARGO_PKG_VERSION"));

/// API level reported alongside [`LIBRARY_VERSION`]
pub const API_VERSION: (u32, u32) = (1, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version_names_the_crate() {
        assert!(LIBRARY_VERSION.starts_with("spmd "));
    }

    #[test]
    fn test_fd_env_name() {
        assert_eq!(IPC_FD_ENV, "SPMD_IPC_FD");
    }
}

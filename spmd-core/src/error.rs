//! Run error codes and transport errors
//!
//! [`ErrorCode`] is the closed set of ways a run can fail; it becomes the
//! process exit code. [`TransportError`] carries the detail of what went
//! wrong underneath and is only ever logged, never returned past
//! [`crate::CollectiveOps`] or [`crate::GroupContext`].

use crate::fault::FaultPoint;
use spmd_ipc::{FrameError, RefusalKind};
use thiserror::Error;

/// One failure category per run. Success is the absence of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum ErrorCode {
    /// Task and group disagree on the protocol version
    #[error("protocol version mismatch")]
    Version = 1,
    /// The group facility could not be initialized
    #[error("group initialization failed")]
    Init = 2,
    /// The group size could not be determined
    #[error("group size query failed")]
    Size = 3,
    /// This task's rank could not be determined
    #[error("rank query failed")]
    Rank = 4,
    /// A sum-reduction failed
    #[error("reduction failed")]
    Reduce = 5,
    /// Releasing the group failed
    #[error("group finalization failed")]
    Finalize = 6,
    /// A barrier failed
    #[error("barrier failed")]
    Barrier = 7,
    /// A broadcast failed
    #[error("broadcast failed")]
    Broadcast = 8,
    /// The workload's arguments were malformed
    #[error("invalid arguments")]
    Args = 9,
}

impl ErrorCode {
    /// Every code, in numeric order
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::Version,
        ErrorCode::Init,
        ErrorCode::Size,
        ErrorCode::Rank,
        ErrorCode::Reduce,
        ErrorCode::Finalize,
        ErrorCode::Barrier,
        ErrorCode::Broadcast,
        ErrorCode::Args,
    ];

    /// Numeric value used as the process exit status
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ErrorCode::code`]; `0` and unknown values map to `None`
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

/// Accumulated result of one run: the first recorded error wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatus {
    first_error: Option<ErrorCode>,
}

impl RunStatus {
    /// A status with nothing recorded
    pub fn success() -> Self {
        Self::default()
    }

    /// Record `code` unless an earlier error is already held.
    ///
    /// Returns `true` if `code` became the run's error.
    pub fn record(&mut self, code: ErrorCode) -> bool {
        if self.first_error.is_some() {
            return false;
        }
        self.first_error = Some(code);
        true
    }

    /// The run's error, if any
    pub fn error(&self) -> Option<ErrorCode> {
        self.first_error
    }

    /// Whether nothing has failed
    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    /// Process exit status (0 on success)
    pub fn exit_code(&self) -> u8 {
        self.first_error.map_or(0, ErrorCode::code)
    }
}

impl From<RunStatus> for std::process::ExitCode {
    fn from(status: RunStatus) -> Self {
        std::process::ExitCode::from(status.exit_code())
    }
}

/// Failures reported by a [`crate::Transport`]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IPC channel not configured: {0}")]
    NotConfigured(String),

    #[error("transport used before init or after finalize")]
    NotJoined,

    #[error("protocol version mismatch: task speaks {local}, group speaks {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("IPC error: {0}")]
    Frame(#[from] FrameError),

    #[error("group rejected {request} ({kind:?}): {message}")]
    Rejected {
        request: &'static str,
        kind: RefusalKind,
        message: String,
    },

    #[error("unexpected reply to {request}: {reply}")]
    UnexpectedReply { request: &'static str, reply: String },

    #[error("buffer is {actual} bytes but the broadcast carried {expected}")]
    BufferMismatch { expected: usize, actual: usize },

    #[error("rank {rank} is outside a group of {size}")]
    RankOutOfRange { rank: usize, size: usize },

    #[error("injected fault at {0:?}")]
    Injected(FaultPoint),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_nonzero() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::ALL {
            assert_ne!(code.code(), 0);
            assert!(seen.insert(code.code()));
        }
    }

    #[test]
    fn test_from_code_inverts_code() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(200), None);
    }

    #[test]
    fn test_first_error_wins() {
        let mut status = RunStatus::success();
        assert!(status.is_success());
        assert!(status.record(ErrorCode::Barrier));
        assert!(!status.record(ErrorCode::Finalize));
        assert_eq!(status.error(), Some(ErrorCode::Barrier));
        assert_eq!(status.exit_code(), 7);
    }

    #[test]
    fn test_success_exits_zero() {
        assert_eq!(RunStatus::success().exit_code(), 0);
    }
}

//! Group membership for one task
//!
//! A [`GroupContext`] owns the task's [`Transport`] handle and walks it
//! through `init` → run → `finalize`. Identity (size, rank, manager rank)
//! is captured once during [`GroupContext::init`] and is read-only after.

use crate::collective::CollectiveOps;
use crate::error::{ErrorCode, RunStatus, TransportError};
use crate::transport::Transport;
use spmd_ipc::GroupInfo;
use tracing::{debug, warn};

/// Which side of the role contract a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Distributes configuration and owns the aggregate
    Manager,
    /// Every other task
    Worker,
}

/// One task's membership in a fixed-size group
pub struct GroupContext {
    transport: Box<dyn Transport>,
    manager_rank: usize,
    size: usize,
    rank: usize,
    info: Option<GroupInfo>,
    joined: bool,
    status: RunStatus,
}

impl GroupContext {
    /// Context over `transport` with `manager_rank` as the coordinator.
    ///
    /// No collective call is made until [`GroupContext::init`].
    pub fn new(transport: impl Transport + 'static, manager_rank: usize) -> Self {
        Self {
            transport: Box::new(transport),
            manager_rank,
            size: 0,
            rank: 0,
            info: None,
            joined: false,
            status: RunStatus::success(),
        }
    }

    /// Join the group and capture this task's identity.
    ///
    /// The three steps short-circuit: size is only queried after a
    /// successful join, rank only after a successful size query.
    pub fn init(&mut self) -> Result<(), ErrorCode> {
        let info = self.transport.init().map_err(|e| {
            warn!(error = %e, "group init failed");
            match e {
                TransportError::VersionMismatch { .. } => ErrorCode::Version,
                _ => ErrorCode::Init,
            }
        })?;
        if info.protocol_version != spmd_ipc::PROTOCOL_VERSION {
            warn!(
                local = spmd_ipc::PROTOCOL_VERSION,
                remote = info.protocol_version,
                "group speaks another protocol version"
            );
            return Err(ErrorCode::Version);
        }
        self.info = Some(info);

        let size = self.transport.size().map_err(|e| {
            warn!(error = %e, "group size query failed");
            ErrorCode::Size
        })?;
        if size == 0 {
            warn!("group reported zero tasks");
            return Err(ErrorCode::Size);
        }

        let rank = self.transport.rank().map_err(|e| {
            warn!(error = %e, "rank query failed");
            ErrorCode::Rank
        })?;
        if rank >= size {
            warn!(rank, size, "rank outside the group");
            return Err(ErrorCode::Rank);
        }
        if self.manager_rank >= size {
            warn!(manager = self.manager_rank, size, "manager rank outside the group");
            return Err(ErrorCode::Rank);
        }

        self.size = size;
        self.rank = rank;
        self.joined = true;
        debug!(rank, size, manager = self.manager_rank, "joined group");
        Ok(())
    }

    /// Record a failure; the first recorded failure is kept.
    pub fn record(&mut self, code: ErrorCode) {
        if !self.status.record(code) {
            debug!(%code, kept = ?self.status.error(), "later failure not recorded");
        }
    }

    /// Current run status
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Release the group unconditionally and return the final status.
    ///
    /// A failing release is recorded as [`ErrorCode::Finalize`] only when
    /// nothing failed earlier.
    pub fn finalize(mut self) -> RunStatus {
        if let Err(e) = self.transport.finalize() {
            warn!(error = %e, "group finalize failed");
            self.record(ErrorCode::Finalize);
        }
        self.status
    }

    /// Collective operations for this task
    pub fn collectives(&self) -> CollectiveOps<'_> {
        CollectiveOps::new(self.transport.as_ref(), self.manager_rank, self.size)
    }

    /// Number of tasks in the group (0 before a successful init)
    pub fn size(&self) -> usize {
        self.size
    }

    /// This task's rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The coordinating task's rank
    pub fn manager_rank(&self) -> usize {
        self.manager_rank
    }

    /// Whether init completed
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Whether this task is the manager
    pub fn is_manager(&self) -> bool {
        self.joined && self.rank == self.manager_rank
    }

    /// This task's role
    pub fn role(&self) -> Role {
        if self.is_manager() {
            Role::Manager
        } else {
            Role::Worker
        }
    }

    /// `<group>.<rank>@<host>`
    pub fn task_name(&self) -> String {
        let group = self
            .info
            .as_ref()
            .map_or("NULL_COMMNAME", |i| i.group_name.as_str());
        let host = self
            .info
            .as_ref()
            .map_or("NULL_PROCNAME", |i| i.processor_name.as_str());
        if self.joined {
            format!("{group}.{}@{host}", self.rank)
        } else {
            format!("{group}.?@{host}")
        }
    }

    /// `<library version> API(<major>.<minor>)`
    pub fn version_string(&self) -> String {
        match &self.info {
            Some(info) => format!(
                "{} API({}.{})",
                info.library_version, info.api_major, info.api_minor
            ),
            None => "NULL_LIB_VERSION API(NULL)".to_string(),
        }
    }
}

//! Task/Hub Message Types
//!
//! A task sends exactly one [`TaskRequest`] and then blocks until the hub
//! answers with one [`HubReply`]. Collective requests are answered only once
//! every task in the group has submitted its matching call.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// One collective call as submitted by a single task
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum CollectiveCall {
    /// Wait until every task has arrived
    Barrier,
    /// Distribute `len` bytes from `root`
    Broadcast {
        /// Source rank
        root: u32,
        /// Buffer size every task must agree on
        len: u32,
        /// Present only on the root
        payload: Option<Vec<u8>>,
    },
    /// Sum one value per task into `root`
    ReduceSum {
        /// Rank that receives the aggregate
        root: u32,
        /// This task's contribution
        value: u64,
    },
}

impl CollectiveCall {
    /// Short name used in logs and mismatch reports
    pub fn kind(&self) -> &'static str {
        match self {
            CollectiveCall::Barrier => "barrier",
            CollectiveCall::Broadcast { .. } => "broadcast",
            CollectiveCall::ReduceSum { .. } => "reduce-sum",
        }
    }
}

/// Requests sent from a task to the hub
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum TaskRequest {
    /// First message on a fresh pipe
    Join {
        /// Protocol version the task was built with
        protocol_version: u32,
        /// OS process id, for launcher diagnostics
        pid: u32,
    },
    /// Ask for the group size
    QuerySize,
    /// Ask for this task's rank
    QueryRank,
    /// Participate in the next collective round
    Collective(CollectiveCall),
    /// Leave the group; no further requests follow
    Finalize,
}

/// Static facts about the group handed out at join time
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct GroupInfo {
    /// Protocol version spoken by the hub
    pub protocol_version: u32,
    /// Name of the group ("world" for a launched group)
    pub group_name: String,
    /// Host the hub runs on
    pub processor_name: String,
    /// Library version string
    pub library_version: String,
    /// API level, major part
    pub api_major: u32,
    /// API level, minor part
    pub api_minor: u32,
}

impl GroupInfo {
    /// Group facts for this build, running on `processor_name`
    pub fn current(group_name: impl Into<String>, processor_name: impl Into<String>) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            group_name: group_name.into(),
            processor_name: processor_name.into(),
            library_version: crate::LIBRARY_VERSION.to_string(),
            api_major: crate::API_VERSION.0,
            api_minor: crate::API_VERSION.1,
        }
    }
}

/// Completion of a collective round, as seen by one task
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum CollectiveReply {
    /// Every task reached the barrier
    BarrierReleased,
    /// The root's bytes
    Broadcast(Vec<u8>),
    /// The sum on the root, `None` everywhere else
    Reduced(Option<u64>),
}

/// Why the hub refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RefusalKind {
    /// Join carried a different protocol version
    ProtocolMismatch,
    /// A request arrived before `Join`
    NotJoined,
    /// Tasks submitted different collectives for the same round
    CallMismatch,
    /// Root rank outside the group
    InvalidRoot,
    /// A task left the group while the round was open
    PeerDeparted,
    /// Request not valid in the current state
    Unexpected,
}

/// Replies sent from the hub to a task
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum HubReply {
    /// Join accepted
    Welcome(GroupInfo),
    /// Group size
    Size(u32),
    /// Caller's rank
    Rank(u32),
    /// Collective round completed
    Collective(CollectiveReply),
    /// Finalize acknowledged
    Finalized,
    /// Request failed
    Refused {
        /// Failure category
        kind: RefusalKind,
        /// Human-readable detail
        message: String,
    },
}

impl HubReply {
    /// Build a refusal
    pub fn refused(kind: RefusalKind, message: impl Into<String>) -> Self {
        HubReply::Refused {
            kind,
            message: message.into(),
        }
    }
}

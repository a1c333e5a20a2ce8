//! Launcher-side request matching
//!
//! The hub holds no I/O. The launcher feeds it one event at a time (a
//! request read from a task's pipe, or a task's pipe closing) and writes
//! back whatever replies it returns. Collective requests produce no reply
//! until the round is complete, then one reply per participant.

use spmd_core::{RoundOutcome, RoundTable};
use spmd_ipc::{GroupInfo, HubReply, PROTOCOL_VERSION, RefusalKind, TaskRequest};
use tracing::{debug, info, warn};

/// Replies to deliver, addressed by rank
pub type Outbox = Vec<(usize, HubReply)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    /// Connected, no `Join` yet
    Pending,
    Joined,
    Finalized,
    /// Pipe closed without `Finalize`
    Departed,
}

/// Collective matcher for a launched group
pub struct Hub {
    info: GroupInfo,
    table: RoundTable,
    members: Vec<Member>,
}

impl Hub {
    /// Hub for `size` tasks sharing `info`
    pub fn new(info: GroupInfo, size: usize) -> Self {
        Self {
            info,
            table: RoundTable::new(size),
            members: vec![Member::Pending; size],
        }
    }

    /// Group size
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Collective rounds completed so far
    pub fn completed_rounds(&self) -> u64 {
        self.table.completed_rounds()
    }

    /// Whether every task has finalized or gone away
    pub fn is_done(&self) -> bool {
        self.members
            .iter()
            .all(|m| matches!(m, Member::Finalized | Member::Departed))
    }

    /// Whether `rank` left without finalizing
    pub fn departed_abruptly(&self, rank: usize) -> bool {
        self.members.get(rank) == Some(&Member::Departed)
    }

    /// Handle one request from `rank`.
    pub fn handle(&mut self, rank: usize, request: TaskRequest) -> Outbox {
        let Some(member) = self.members.get(rank).copied() else {
            warn!(rank, "request from unknown rank");
            return Vec::new();
        };

        match request {
            TaskRequest::Join {
                protocol_version,
                pid,
            } => {
                if member != Member::Pending {
                    return refuse(rank, RefusalKind::Unexpected, "already joined");
                }
                if protocol_version != PROTOCOL_VERSION {
                    warn!(rank, pid, protocol_version, "task speaks another protocol");
                    return refuse(
                        rank,
                        RefusalKind::ProtocolMismatch,
                        format!("hub speaks protocol {PROTOCOL_VERSION}"),
                    );
                }
                self.members[rank] = Member::Joined;
                debug!(rank, pid, "task joined");
                vec![(rank, HubReply::Welcome(self.info.clone()))]
            }
            TaskRequest::QuerySize | TaskRequest::QueryRank | TaskRequest::Collective(_)
                if member != Member::Joined =>
            {
                refuse(rank, RefusalKind::NotJoined, format!("rank {rank} has not joined"))
            }
            TaskRequest::QuerySize => vec![(rank, HubReply::Size(self.size() as u32))],
            TaskRequest::QueryRank => vec![(rank, HubReply::Rank(rank as u32))],
            TaskRequest::Collective(call) => {
                let kind = call.kind();
                match self.table.arrive(rank, call) {
                    Ok(Some(outcome)) => fan_out(outcome),
                    Ok(None) => {
                        debug!(rank, kind, "waiting for the rest of the round");
                        Vec::new()
                    }
                    Err(rejection) => {
                        warn!(rank, kind, %rejection, "collective refused");
                        vec![(
                            rank,
                            HubReply::refused(rejection.kind, rejection.message),
                        )]
                    }
                }
            }
            TaskRequest::Finalize => {
                if matches!(member, Member::Finalized | Member::Departed) {
                    return refuse(rank, RefusalKind::Unexpected, "already finalized");
                }
                self.members[rank] = Member::Finalized;
                debug!(rank, "task finalized");
                let mut outbox = vec![(rank, HubReply::Finalized)];
                if let Some(outcome) = self.table.depart(rank) {
                    outbox.extend(fan_out(outcome));
                }
                outbox
            }
        }
    }

    /// Record that `rank`'s pipe closed.
    pub fn hang_up(&mut self, rank: usize) -> Outbox {
        match self.members.get(rank) {
            Some(Member::Pending | Member::Joined) => {}
            _ => return Vec::new(),
        }
        self.members[rank] = Member::Departed;
        info!(rank, "task left the group without finalizing");
        self.table.depart(rank).map(fan_out).unwrap_or_default()
    }
}

fn refuse(rank: usize, kind: RefusalKind, message: impl Into<String>) -> Outbox {
    vec![(rank, HubReply::refused(kind, message))]
}

fn fan_out(outcome: RoundOutcome) -> Outbox {
    match &outcome.result {
        Ok(_) => debug!(round = outcome.round, "round complete"),
        Err(rejection) => warn!(round = outcome.round, %rejection, "round failed"),
    }
    outcome
        .participants
        .iter()
        .map(|&rank| {
            let reply = match outcome.reply_for(rank) {
                Ok(reply) => HubReply::Collective(reply),
                Err(rejection) => HubReply::refused(rejection.kind, rejection.message),
            };
            (rank, reply)
        })
        .collect()
}

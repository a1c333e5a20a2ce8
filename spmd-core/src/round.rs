//! Collective round matching
//!
//! Collective calls carry no identifiers: the k-th collective of one task
//! pairs with the k-th collective of every other task. Since each task blocks
//! in its current call, a round is simply "the one pending call per task".
//! [`RoundTable`] collects those calls and decides when and how a round
//! completes. It is shared by the in-process group and the launcher hub.

use spmd_ipc::{CollectiveCall, CollectiveReply, RefusalKind};
use std::fmt;

/// A request the table refused, or a round that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Failure category
    pub kind: RefusalKind,
    /// Human-readable detail
    pub message: String,
}

impl Rejection {
    fn new(kind: RefusalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// How a completed round resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// All tasks met at the barrier
    Barrier,
    /// The root's bytes
    Broadcast(Vec<u8>),
    /// The sum, delivered to `root`
    Reduced {
        /// Receiving rank
        root: usize,
        /// Sum of every contribution
        sum: u64,
    },
}

/// A finished round and the tasks waiting on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Zero-based index of the round
    pub round: u64,
    /// Ranks that submitted a call to this round
    pub participants: Vec<usize>,
    /// Result shared by every participant
    pub result: Result<Completion, Rejection>,
}

impl RoundOutcome {
    /// The reply owed to `rank`
    pub fn reply_for(&self, rank: usize) -> Result<CollectiveReply, Rejection> {
        match &self.result {
            Ok(Completion::Barrier) => Ok(CollectiveReply::BarrierReleased),
            Ok(Completion::Broadcast(bytes)) => Ok(CollectiveReply::Broadcast(bytes.clone())),
            Ok(Completion::Reduced { root, sum }) => {
                Ok(CollectiveReply::Reduced((*root == rank).then_some(*sum)))
            }
            Err(rejection) => Err(rejection.clone()),
        }
    }
}

/// Pending collective calls for a fixed-size group
#[derive(Debug)]
pub struct RoundTable {
    pending: Vec<Option<CollectiveCall>>,
    departed: Vec<bool>,
    completed: u64,
}

impl RoundTable {
    /// Table for a group of `size` tasks
    pub fn new(size: usize) -> Self {
        Self {
            pending: vec![None; size],
            departed: vec![false; size],
            completed: 0,
        }
    }

    /// Group size
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    /// Rounds completed so far
    pub fn completed_rounds(&self) -> u64 {
        self.completed
    }

    /// Whether `rank` has left the group
    pub fn has_departed(&self, rank: usize) -> bool {
        self.departed.get(rank).copied().unwrap_or(false)
    }

    /// Submit `rank`'s call for the current round.
    ///
    /// Returns the outcome if this arrival completed the round.
    pub fn arrive(
        &mut self,
        rank: usize,
        call: CollectiveCall,
    ) -> Result<Option<RoundOutcome>, Rejection> {
        let size = self.size();
        if rank >= size {
            return Err(Rejection::new(
                RefusalKind::Unexpected,
                format!("rank {rank} is outside a group of {size}"),
            ));
        }
        if self.departed[rank] {
            return Err(Rejection::new(
                RefusalKind::Unexpected,
                format!("rank {rank} already left the group"),
            ));
        }
        if let Some(existing) = &self.pending[rank] {
            return Err(Rejection::new(
                RefusalKind::Unexpected,
                format!(
                    "rank {rank} submitted a {} while its {} is still pending",
                    call.kind(),
                    existing.kind()
                ),
            ));
        }
        self.pending[rank] = Some(call);
        Ok(self.try_complete())
    }

    /// Record that `rank` left the group.
    ///
    /// A round that is still missing `rank` can never complete; once every
    /// remaining task has arrived it fails for all of them.
    pub fn depart(&mut self, rank: usize) -> Option<RoundOutcome> {
        if rank >= self.size() || self.departed[rank] {
            return None;
        }
        self.departed[rank] = true;
        self.pending[rank] = None;
        self.try_complete()
    }

    fn try_complete(&mut self) -> Option<RoundOutcome> {
        let arrived = self.pending.iter().filter(|p| p.is_some()).count();
        let departed = self.departed.iter().filter(|d| **d).count();
        if arrived == 0 || arrived + departed < self.size() {
            return None;
        }

        let calls: Vec<(usize, CollectiveCall)> = self
            .pending
            .iter_mut()
            .enumerate()
            .filter_map(|(rank, slot)| slot.take().map(|call| (rank, call)))
            .collect();
        let round = self.completed;
        self.completed += 1;

        let result = if departed > 0 {
            let gone: Vec<String> = self
                .departed
                .iter()
                .enumerate()
                .filter(|(_, d)| **d)
                .map(|(rank, _)| rank.to_string())
                .collect();
            Err(Rejection::new(
                RefusalKind::PeerDeparted,
                format!(
                    "round {round} ({}) cannot complete: rank(s) {} left the group",
                    calls[0].1.kind(),
                    gone.join(", ")
                ),
            ))
        } else {
            resolve(&calls)
        };

        Some(RoundOutcome {
            round,
            participants: calls.iter().map(|(rank, _)| *rank).collect(),
            result,
        })
    }
}

fn resolve(calls: &[(usize, CollectiveCall)]) -> Result<Completion, Rejection> {
    let size = calls.len();
    let (_, first) = &calls[0];

    if let Some((rank, odd)) = calls.iter().find(|(_, c)| c.kind() != first.kind()) {
        return Err(Rejection::new(
            RefusalKind::CallMismatch,
            format!(
                "rank {} called {} but rank {rank} called {}",
                calls[0].0,
                first.kind(),
                odd.kind()
            ),
        ));
    }

    match first {
        CollectiveCall::Barrier => Ok(Completion::Barrier),
        CollectiveCall::Broadcast { root, len, .. } => {
            let (root, len) = (*root, *len);
            check_root(root, size)?;
            let mut bytes = None;
            for (rank, call) in calls {
                let CollectiveCall::Broadcast {
                    root: r,
                    len: l,
                    payload,
                } = call
                else {
                    unreachable!("kinds checked above");
                };
                if *r != root || *l != len {
                    return Err(Rejection::new(
                        RefusalKind::CallMismatch,
                        format!(
                            "rank {rank} broadcast {l} bytes from {r}, expected {len} bytes from {root}"
                        ),
                    ));
                }
                if *rank == root as usize {
                    bytes = payload.clone();
                }
            }
            match bytes {
                Some(bytes) if bytes.len() == len as usize => Ok(Completion::Broadcast(bytes)),
                Some(bytes) => Err(Rejection::new(
                    RefusalKind::CallMismatch,
                    format!("root sent {} bytes for a {len} byte broadcast", bytes.len()),
                )),
                None => Err(Rejection::new(
                    RefusalKind::CallMismatch,
                    format!("root {root} sent no payload"),
                )),
            }
        }
        CollectiveCall::ReduceSum { root, .. } => {
            let root = *root;
            check_root(root, size)?;
            let mut sum = 0u64;
            for (rank, call) in calls {
                let CollectiveCall::ReduceSum { root: r, value } = call else {
                    unreachable!("kinds checked above");
                };
                if *r != root {
                    return Err(Rejection::new(
                        RefusalKind::CallMismatch,
                        format!("rank {rank} reduced to {r}, expected {root}"),
                    ));
                }
                sum = sum.checked_add(*value).ok_or_else(|| {
                    Rejection::new(RefusalKind::Unexpected, "sum overflowed u64")
                })?;
            }
            Ok(Completion::Reduced {
                root: root as usize,
                sum,
            })
        }
    }
}

fn check_root(root: u32, size: usize) -> Result<(), Rejection> {
    if (root as usize) < size {
        Ok(())
    } else {
        Err(Rejection::new(
            RefusalKind::InvalidRoot,
            format!("root {root} is outside a group of {size}"),
        ))
    }
}

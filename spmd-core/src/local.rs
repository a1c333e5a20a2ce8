//! In-process group
//!
//! [`LocalGroup`] creates `size` endpoints that share one [`RoundTable`].
//! Each endpoint is meant to be driven by its own thread. A dropped endpoint
//! counts as having left the group, so a task that panics does not leave
//! the others blocked forever.

use crate::error::TransportError;
use crate::round::{RoundOutcome, RoundTable};
use crate::transport::{Transport, host_name, wire_root};
use parking_lot::{Condvar, Mutex};
use spmd_ipc::{CollectiveCall, CollectiveReply, GroupInfo};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

struct Rendezvous {
    table: RoundTable,
    /// Bumped every time a round completes
    generation: u64,
    /// Outcome of the most recent round
    latest: Option<RoundOutcome>,
}

struct Shared {
    info: GroupInfo,
    state: Mutex<Rendezvous>,
    round_done: Condvar,
}

/// Factory for in-process groups
pub struct LocalGroup;

impl LocalGroup {
    /// Endpoints for a group of `size` tasks named "local"
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        Self::named("local", size)
    }

    /// Endpoints for a group of `size` tasks called `name`
    pub fn named(name: &str, size: usize) -> Vec<LocalEndpoint> {
        let processor = host_name().unwrap_or_else(|| "localhost".to_string());
        let shared = Arc::new(Shared {
            info: GroupInfo::current(name, processor),
            state: Mutex::new(Rendezvous {
                table: RoundTable::new(size),
                generation: 0,
                latest: None,
            }),
            round_done: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalEndpoint {
                shared: Arc::clone(&shared),
                rank,
                joined: AtomicBool::new(false),
                left: AtomicBool::new(false),
            })
            .collect()
    }
}

/// One task's view of a [`LocalGroup`]
pub struct LocalEndpoint {
    shared: Arc<Shared>,
    rank: usize,
    joined: AtomicBool,
    left: AtomicBool,
}

impl LocalEndpoint {
    fn ensure_joined(&self) -> Result<(), TransportError> {
        if self.joined.load(Ordering::Acquire) && !self.left.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotJoined)
        }
    }

    fn collective(
        &self,
        request: &'static str,
        call: CollectiveCall,
    ) -> Result<CollectiveReply, TransportError> {
        self.ensure_joined()?;

        let mut state = self.shared.state.lock();
        let generation = state.generation;
        let completed = state
            .table
            .arrive(self.rank, call)
            .map_err(|rejection| TransportError::Rejected {
                request,
                kind: rejection.kind,
                message: rejection.message,
            })?;

        if let Some(outcome) = completed {
            publish(&mut state, outcome);
            self.shared.round_done.notify_all();
        } else {
            while state.generation == generation {
                self.shared.round_done.wait(&mut state);
            }
        }

        // The next round cannot complete before this task arrives in it,
        // so `latest` still holds the round we took part in.
        let outcome = state
            .latest
            .as_ref()
            .ok_or(TransportError::UnexpectedReply {
                request,
                reply: "no round outcome recorded".to_string(),
            })?;
        outcome
            .reply_for(self.rank)
            .map_err(|rejection| TransportError::Rejected {
                request,
                kind: rejection.kind,
                message: rejection.message,
            })
    }

    fn group_size(&self) -> usize {
        self.shared.state.lock().table.size()
    }

    fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.shared.state.lock();
        if let Some(outcome) = state.table.depart(self.rank) {
            publish(&mut state, outcome);
            self.shared.round_done.notify_all();
        }
        debug!(rank = self.rank, "left local group");
    }
}

fn publish(state: &mut Rendezvous, outcome: RoundOutcome) {
    debug!(round = outcome.round, ok = outcome.result.is_ok(), "local round complete");
    state.latest = Some(outcome);
    state.generation += 1;
}

impl Transport for LocalEndpoint {
    fn init(&self) -> Result<GroupInfo, TransportError> {
        if self.left.load(Ordering::Acquire) {
            return Err(TransportError::NotJoined);
        }
        self.joined.store(true, Ordering::Release);
        Ok(self.shared.info.clone())
    }

    fn size(&self) -> Result<usize, TransportError> {
        self.ensure_joined()?;
        Ok(self.shared.state.lock().table.size())
    }

    fn rank(&self) -> Result<usize, TransportError> {
        self.ensure_joined()?;
        Ok(self.rank)
    }

    fn barrier(&self) -> Result<(), TransportError> {
        match self.collective("barrier", CollectiveCall::Barrier)? {
            CollectiveReply::BarrierReleased => Ok(()),
            other => Err(TransportError::UnexpectedReply {
                request: "barrier",
                reply: format!("{other:?}"),
            }),
        }
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<(), TransportError> {
        let call = CollectiveCall::Broadcast {
            root: wire_root(root, self.group_size())?,
            len: buf.len() as u32,
            payload: (root == self.rank).then(|| buf.to_vec()),
        };
        match self.collective("broadcast", call)? {
            CollectiveReply::Broadcast(bytes) if bytes.len() == buf.len() => {
                buf.copy_from_slice(&bytes);
                Ok(())
            }
            CollectiveReply::Broadcast(bytes) => Err(TransportError::BufferMismatch {
                expected: bytes.len(),
                actual: buf.len(),
            }),
            other => Err(TransportError::UnexpectedReply {
                request: "broadcast",
                reply: format!("{other:?}"),
            }),
        }
    }

    fn reduce_sum(&self, value: u64, root: usize) -> Result<Option<u64>, TransportError> {
        let call = CollectiveCall::ReduceSum {
            root: wire_root(root, self.group_size())?,
            value,
        };
        match self.collective("reduce-sum", call)? {
            CollectiveReply::Reduced(sum) => Ok(sum),
            other => Err(TransportError::UnexpectedReply {
                request: "reduce-sum",
                reply: format!("{other:?}"),
            }),
        }
    }

    fn finalize(&self) -> Result<(), TransportError> {
        self.leave();
        Ok(())
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spmd_ipc::RefusalKind;
    use std::thread;

    fn joined(size: usize) -> Vec<LocalEndpoint> {
        let endpoints = LocalGroup::new(size);
        for endpoint in &endpoints {
            endpoint.init().unwrap();
        }
        endpoints
    }

    #[test]
    fn test_identity() {
        let endpoints = joined(3);
        for (rank, endpoint) in endpoints.iter().enumerate() {
            assert_eq!(endpoint.rank().unwrap(), rank);
            assert_eq!(endpoint.size().unwrap(), 3);
        }
    }

    #[test]
    fn test_queries_before_init_fail() {
        let endpoints = LocalGroup::new(2);
        assert!(matches!(endpoints[0].size(), Err(TransportError::NotJoined)));
        assert!(matches!(endpoints[0].rank(), Err(TransportError::NotJoined)));
    }

    #[test]
    fn test_single_task_collectives_complete_immediately() {
        let endpoints = joined(1);
        endpoints[0].barrier().unwrap();
        let mut buf = [9u8, 8, 7];
        endpoints[0].broadcast(&mut buf, 0).unwrap();
        assert_eq!(buf, [9, 8, 7]);
        assert_eq!(endpoints[0].reduce_sum(5, 0).unwrap(), Some(5));
    }

    #[test]
    fn test_threads_share_rounds() {
        let endpoints = joined(4);
        let results: Vec<(Vec<u8>, Option<u64>)> = thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .iter()
                .enumerate()
                .map(|(rank, endpoint)| {
                    s.spawn(move || {
                        let mut buf = if rank == 0 { vec![1, 2, 3, 4] } else { vec![0; 4] };
                        endpoint.broadcast(&mut buf, 0).unwrap();
                        endpoint.barrier().unwrap();
                        let sum = endpoint.reduce_sum(rank as u64 + 1, 0).unwrap();
                        (buf, sum)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, (buf, sum)) in results.into_iter().enumerate() {
            assert_eq!(buf, vec![1, 2, 3, 4]);
            if rank == 0 {
                assert_eq!(sum, Some(10));
            } else {
                assert_eq!(sum, None);
            }
        }
    }

    #[test]
    fn test_finalized_peer_fails_barrier() {
        let mut endpoints = joined(2);
        let leaver = endpoints.pop().unwrap();
        let stayer = endpoints.pop().unwrap();
        leaver.finalize().unwrap();

        let err = stayer.barrier().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected {
                kind: RefusalKind::PeerDeparted,
                ..
            }
        ));
    }

    #[test]
    fn test_dropped_peer_releases_waiter() {
        let mut endpoints = joined(2);
        let leaver = endpoints.pop().unwrap();
        let stayer = endpoints.pop().unwrap();

        let waiter = thread::spawn(move || stayer.reduce_sum(1, 0));
        thread::sleep(std::time::Duration::from_millis(20));
        drop(leaver);

        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_root_outside_group_refused() {
        let endpoints = joined(1);
        assert!(matches!(
            endpoints[0].reduce_sum(5, 1usize << 32),
            Err(TransportError::RankOutOfRange { size: 1, .. })
        ));
        let mut buf = [0u8; 2];
        assert!(matches!(
            endpoints[0].broadcast(&mut buf, 1),
            Err(TransportError::RankOutOfRange { rank: 1, size: 1 })
        ));
        // The refused calls opened no round.
        assert_eq!(endpoints[0].reduce_sum(5, 0).unwrap(), Some(5));
    }

    #[test]
    fn test_collectives_after_finalize_fail() {
        let endpoints = joined(1);
        endpoints[0].finalize().unwrap();
        assert!(matches!(endpoints[0].barrier(), Err(TransportError::NotJoined)));
    }
}

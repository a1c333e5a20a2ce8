//! Typed collective operations
//!
//! The only way workloads talk to the group. Each call maps a transport
//! failure onto its own [`ErrorCode`] so a workload can simply `?` it:
//! the remainder of the task's workload is abandoned and the code becomes
//! the run's error. Nothing here retries.
//!
//! Every task must issue the same collectives, in the same order, with the
//! same buffer sizes. A task that skips one leaves the others blocked.

use crate::error::ErrorCode;
use crate::transport::Transport;
use spmd_ipc::WireRecord;
use tracing::warn;

/// Barrier, broadcast and sum-reduce over the group
pub struct CollectiveOps<'a> {
    transport: &'a dyn Transport,
    manager_rank: usize,
    size: usize,
}

impl<'a> CollectiveOps<'a> {
    pub(crate) fn new(transport: &'a dyn Transport, manager_rank: usize, size: usize) -> Self {
        Self {
            transport,
            manager_rank,
            size,
        }
    }

    /// `root`, or the manager when `None`, if it names a task of the group
    fn resolve_root(&self, root: Option<usize>) -> Option<usize> {
        let root = root.unwrap_or(self.manager_rank);
        (root < self.size).then_some(root)
    }

    /// Rank used when no root is given
    pub fn manager_rank(&self) -> usize {
        self.manager_rank
    }

    /// Block until every task has reached this barrier
    pub fn barrier(&self) -> Result<(), ErrorCode> {
        self.transport.barrier().map_err(|e| {
            warn!(error = %e, "barrier failed");
            ErrorCode::Barrier
        })
    }

    /// Overwrite `buf` on every task with the bytes held by `root`
    /// (the manager when `None`).
    pub fn broadcast(&self, buf: &mut [u8], root: Option<usize>) -> Result<(), ErrorCode> {
        let Some(root) = self.resolve_root(root) else {
            warn!(?root, size = self.size, "broadcast root outside the group");
            return Err(ErrorCode::Broadcast);
        };
        self.transport.broadcast(buf, root).map_err(|e| {
            warn!(error = %e, root, len = buf.len(), "broadcast failed");
            ErrorCode::Broadcast
        })
    }

    /// Broadcast a fixed-size record. Non-root tasks' values are replaced.
    pub fn broadcast_record<T: WireRecord>(
        &self,
        record: &mut T,
        root: Option<usize>,
    ) -> Result<(), ErrorCode> {
        let mut buf = record.to_wire();
        self.broadcast(&mut buf, root)?;
        *record = T::from_wire(&buf).map_err(|e| {
            warn!(error = %e, "broadcast record did not decode");
            ErrorCode::Broadcast
        })?;
        Ok(())
    }

    /// Sum `local` across the group. `Some(sum)` on `root` (the manager
    /// when `None`), `None` on every other task.
    pub fn reduce_sum(&self, local: u64, root: Option<usize>) -> Result<Option<u64>, ErrorCode> {
        let Some(root) = self.resolve_root(root) else {
            warn!(?root, size = self.size, "reduce root outside the group");
            return Err(ErrorCode::Reduce);
        };
        self.transport.reduce_sum(local, root).map_err(|e| {
            warn!(error = %e, root, "reduce failed");
            ErrorCode::Reduce
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::context::GroupContext;
    use crate::error::ErrorCode;
    use crate::fault::{FaultPoint, FaultyTransport};
    use crate::local::LocalGroup;
    use std::thread;

    #[test]
    fn test_defaults_to_manager_root() {
        let endpoints = LocalGroup::new(2);
        let sums: Vec<Option<u64>> = thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    s.spawn(move || {
                        let mut ctx = GroupContext::new(endpoint, 1);
                        ctx.init().unwrap();
                        let sum = ctx.collectives().reduce_sum(10, None).unwrap();
                        ctx.finalize();
                        sum
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(sums, vec![None, Some(20)]);
    }

    #[test]
    fn test_failures_map_to_their_codes() {
        for (point, expected) in [
            (FaultPoint::Barrier, ErrorCode::Barrier),
            (FaultPoint::Broadcast, ErrorCode::Broadcast),
            (FaultPoint::Reduce, ErrorCode::Reduce),
        ] {
            let endpoint = LocalGroup::new(1).pop().unwrap();
            let mut ctx = GroupContext::new(FaultyTransport::new(endpoint).fail_at(point), 0);
            ctx.init().unwrap();
            let ops = ctx.collectives();
            let got = match point {
                FaultPoint::Barrier => ops.barrier().unwrap_err(),
                FaultPoint::Broadcast => ops.broadcast(&mut [0u8; 4], None).unwrap_err(),
                _ => ops.reduce_sum(1, None).unwrap_err(),
            };
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_root_outside_group_fails_on_every_task() {
        let endpoints = LocalGroup::new(2);
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    s.spawn(move || {
                        let mut ctx = GroupContext::new(endpoint, 0);
                        ctx.init().unwrap();
                        let ops = ctx.collectives();
                        let wrapped = ops.reduce_sum(5, Some(1usize << 32));
                        let past_end = ops.reduce_sum(5, Some(2));
                        let bcast = ops.broadcast(&mut [0u8; 4], Some(2));
                        // The group is still usable afterwards.
                        let sum = ops.reduce_sum(5, None).unwrap();
                        ctx.finalize();
                        (wrapped, past_end, bcast, sum)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, (wrapped, past_end, bcast, sum)) in results.into_iter().enumerate() {
            assert_eq!(wrapped, Err(ErrorCode::Reduce), "rank {rank}");
            assert_eq!(past_end, Err(ErrorCode::Reduce), "rank {rank}");
            assert_eq!(bcast, Err(ErrorCode::Broadcast), "rank {rank}");
            assert_eq!(sum, (rank == 0).then_some(10));
        }
    }

    #[test]
    fn test_broadcast_record_replaces_worker_value() {
        let endpoints = LocalGroup::new(3);
        let values: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|endpoint| {
                    s.spawn(move || {
                        let mut ctx = GroupContext::new(endpoint, 0);
                        ctx.init().unwrap();
                        let mut value: u64 = if ctx.is_manager() { 1234 } else { 0 };
                        ctx.collectives().broadcast_record(&mut value, None).unwrap();
                        ctx.finalize();
                        value
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(values, vec![1234, 1234, 1234]);
    }
}

//! Fault injection
//!
//! [`FaultyTransport`] wraps any transport and fails chosen operations so
//! that the teardown discipline can be exercised at every step of a run.
//! A [`TransportProbe`] shared with the wrapper records which operations
//! were attempted, including how many times `finalize` ran.

use crate::error::TransportError;
use crate::transport::Transport;
use parking_lot::Mutex;
use spmd_ipc::GroupInfo;
use std::sync::Arc;

/// A transport operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `Transport::init`
    Init,
    /// `Transport::size`
    Size,
    /// `Transport::rank`
    Rank,
    /// `Transport::barrier`
    Barrier,
    /// `Transport::broadcast`
    Broadcast,
    /// `Transport::reduce_sum`
    Reduce,
    /// `Transport::finalize`
    Finalize,
}

/// Shared record of the operations a [`FaultyTransport`] saw
#[derive(Debug, Clone, Default)]
pub struct TransportProbe {
    calls: Arc<Mutex<Vec<FaultPoint>>>,
}

impl TransportProbe {
    /// Every attempted operation, in order
    pub fn calls(&self) -> Vec<FaultPoint> {
        self.calls.lock().clone()
    }

    /// How many times `point` was attempted
    pub fn count(&self, point: FaultPoint) -> usize {
        self.calls.lock().iter().filter(|p| **p == point).count()
    }

    /// How many times the group was torn down
    pub fn finalize_calls(&self) -> usize {
        self.count(FaultPoint::Finalize)
    }

    fn note(&self, point: FaultPoint) {
        self.calls.lock().push(point);
    }
}

/// A transport that fails selected operations
pub struct FaultyTransport<T> {
    inner: T,
    faults: Vec<FaultPoint>,
    probe: TransportProbe,
}

impl<T: Transport> FaultyTransport<T> {
    /// Wrap `inner` with no faults armed
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            faults: Vec::new(),
            probe: TransportProbe::default(),
        }
    }

    /// Make every call at `point` fail
    pub fn fail_at(mut self, point: FaultPoint) -> Self {
        if !self.faults.contains(&point) {
            self.faults.push(point);
        }
        self
    }

    /// Handle for inspecting the calls after the wrapper has been moved
    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }

    fn check(&self, point: FaultPoint) -> Result<(), TransportError> {
        self.probe.note(point);
        if self.faults.contains(&point) {
            Err(TransportError::Injected(point))
        } else {
            Ok(())
        }
    }
}

impl<T: Transport> Transport for FaultyTransport<T> {
    fn init(&self) -> Result<GroupInfo, TransportError> {
        self.check(FaultPoint::Init)?;
        self.inner.init()
    }

    fn size(&self) -> Result<usize, TransportError> {
        self.check(FaultPoint::Size)?;
        self.inner.size()
    }

    fn rank(&self) -> Result<usize, TransportError> {
        self.check(FaultPoint::Rank)?;
        self.inner.rank()
    }

    fn barrier(&self) -> Result<(), TransportError> {
        self.check(FaultPoint::Barrier)?;
        self.inner.barrier()
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<(), TransportError> {
        self.check(FaultPoint::Broadcast)?;
        self.inner.broadcast(buf, root)
    }

    fn reduce_sum(&self, value: u64, root: usize) -> Result<Option<u64>, TransportError> {
        self.check(FaultPoint::Reduce)?;
        self.inner.reduce_sum(value, root)
    }

    fn finalize(&self) -> Result<(), TransportError> {
        // Resources are released even when the failure is injected.
        let released = self.inner.finalize();
        self.check(FaultPoint::Finalize)?;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalGroup;

    #[test]
    fn test_unarmed_wrapper_passes_through() {
        let endpoint = LocalGroup::new(1).pop().unwrap();
        let faulty = FaultyTransport::new(endpoint);
        let probe = faulty.probe();
        faulty.init().unwrap();
        assert_eq!(faulty.size().unwrap(), 1);
        assert_eq!(faulty.reduce_sum(4, 0).unwrap(), Some(4));
        faulty.finalize().unwrap();
        assert_eq!(
            probe.calls(),
            vec![
                FaultPoint::Init,
                FaultPoint::Size,
                FaultPoint::Reduce,
                FaultPoint::Finalize
            ]
        );
    }

    #[test]
    fn test_armed_point_fails_without_touching_inner() {
        let endpoint = LocalGroup::new(1).pop().unwrap();
        let faulty = FaultyTransport::new(endpoint).fail_at(FaultPoint::Barrier);
        faulty.init().unwrap();
        assert!(matches!(
            faulty.barrier(),
            Err(TransportError::Injected(FaultPoint::Barrier))
        ));
        // The inner group never saw the barrier, so a reduce still works.
        assert_eq!(faulty.reduce_sum(2, 0).unwrap(), Some(2));
    }

    #[test]
    fn test_injected_finalize_still_counts() {
        let endpoint = LocalGroup::new(1).pop().unwrap();
        let faulty = FaultyTransport::new(endpoint).fail_at(FaultPoint::Finalize);
        let probe = faulty.probe();
        assert!(faulty.finalize().is_err());
        assert_eq!(probe.finalize_calls(), 1);
    }
}

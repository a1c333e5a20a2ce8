//! The collective-communication facility a group runs on.
//!
//! [`Transport`] is the only seam between the coordination core and the
//! mechanism that actually moves bytes. Every method blocks until it
//! completes; collective methods complete only when every member of the
//! group has made the matching call.

use crate::error::TransportError;
use spmd_ipc::GroupInfo;

/// An established collective-communication group, seen from one task.
///
/// Implementations use interior mutability so collectives can be issued
/// through a shared reference while the task's identity is being read.
pub trait Transport: Send {
    /// Join the group. Returns the group's static facts.
    fn init(&self) -> Result<GroupInfo, TransportError>;

    /// Number of tasks in the group
    fn size(&self) -> Result<usize, TransportError>;

    /// This task's rank
    fn rank(&self) -> Result<usize, TransportError>;

    /// Block until every task has called `barrier`
    fn barrier(&self) -> Result<(), TransportError>;

    /// Copy `buf` from `root` into `buf` on every task
    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<(), TransportError>;

    /// Sum `value` across the group; the sum is returned on `root` only
    fn reduce_sum(&self, value: u64, root: usize) -> Result<Option<u64>, TransportError>;

    /// Leave the group and release its resources
    fn finalize(&self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn init(&self) -> Result<GroupInfo, TransportError> {
        (**self).init()
    }
    fn size(&self) -> Result<usize, TransportError> {
        (**self).size()
    }
    fn rank(&self) -> Result<usize, TransportError> {
        (**self).rank()
    }
    fn barrier(&self) -> Result<(), TransportError> {
        (**self).barrier()
    }
    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<(), TransportError> {
        (**self).broadcast(buf, root)
    }
    fn reduce_sum(&self, value: u64, root: usize) -> Result<Option<u64>, TransportError> {
        (**self).reduce_sum(value, root)
    }
    fn finalize(&self) -> Result<(), TransportError> {
        (**self).finalize()
    }
}

/// Narrow `root` to its wire form, refusing ranks outside a group of `size`.
pub(crate) fn wire_root(root: usize, size: usize) -> Result<u32, TransportError> {
    u32::try_from(root)
        .ok()
        .filter(|_| root < size)
        .ok_or(TransportError::RankOutOfRange { rank: root, size })
}

/// Name of the host this process runs on
pub fn host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}

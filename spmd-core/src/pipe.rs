//! Task side of the launcher pipes
//!
//! A task started by the launcher inherits a pipe pair on fd 3 (hub to
//! task) and fd 4 (task to hub), advertised through `SPMD_IPC_FD`. Each
//! transport call sends one [`TaskRequest`] frame and blocks for the
//! hub's [`HubReply`]; collective replies only arrive once every task has
//! made the matching call.

use crate::error::TransportError;
use crate::transport::{Transport, wire_root};
use parking_lot::Mutex;
use spmd_ipc::{
    CollectiveCall, CollectiveReply, FrameError, FrameReader, FrameWriter, GroupInfo, HubReply,
    IPC_FD_ENV, PROTOCOL_VERSION, RefusalKind, TaskRequest,
};
use std::io::{Read, Write};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

struct Channel {
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
    joined: bool,
    /// Answers to the identity queries, fixed once the hub has given them
    size: Option<usize>,
    rank: Option<usize>,
}

impl Channel {
    fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            joined: false,
            size: None,
            rank: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Identity {
    Size,
    Rank,
}

enum Link {
    /// Opened from the environment on first use
    Unopened,
    Open(Channel),
    Closed,
}

/// Transport over the pipe pair inherited from the launcher
pub struct PipeTransport {
    link: Mutex<Link>,
}

impl PipeTransport {
    /// Transport that opens the pipes named by `SPMD_IPC_FD` at init.
    pub fn from_env() -> Self {
        Self {
            link: Mutex::new(Link::Unopened),
        }
    }

    /// Transport over explicit streams (hub to task, task to hub).
    pub fn with_streams(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            link: Mutex::new(Link::Open(Channel::new(reader, writer))),
        }
    }

    fn exchange(&self, request: &'static str, message: TaskRequest) -> Result<HubReply, TransportError> {
        let mut link = self.link.lock();
        let channel = match &mut *link {
            Link::Open(channel) if channel.joined => channel,
            _ => return Err(TransportError::NotJoined),
        };
        round_trip(channel, request, &message)
    }

    /// Size or rank, asking the hub only the first time.
    fn identity(&self, which: Identity) -> Result<usize, TransportError> {
        let mut link = self.link.lock();
        let channel = match &mut *link {
            Link::Open(channel) if channel.joined => channel,
            _ => return Err(TransportError::NotJoined),
        };
        let cached = match which {
            Identity::Size => channel.size,
            Identity::Rank => channel.rank,
        };
        if let Some(value) = cached {
            return Ok(value);
        }

        let (request, query) = match which {
            Identity::Size => ("size", TaskRequest::QuerySize),
            Identity::Rank => ("rank", TaskRequest::QueryRank),
        };
        match (which, round_trip(channel, request, &query)?) {
            (Identity::Size, HubReply::Size(size)) => {
                channel.size = Some(size as usize);
                Ok(size as usize)
            }
            (Identity::Rank, HubReply::Rank(rank)) => {
                channel.rank = Some(rank as usize);
                Ok(rank as usize)
            }
            (_, other) => Err(unexpected(request, &other)),
        }
    }

    fn collective(
        &self,
        request: &'static str,
        call: CollectiveCall,
    ) -> Result<CollectiveReply, TransportError> {
        match self.exchange(request, TaskRequest::Collective(call))? {
            HubReply::Collective(reply) => Ok(reply),
            other => Err(unexpected(request, &other)),
        }
    }
}

fn round_trip(
    channel: &mut Channel,
    request: &'static str,
    message: &TaskRequest,
) -> Result<HubReply, TransportError> {
    channel.writer.send(message)?;
    match channel.reader.recv::<HubReply>()? {
        HubReply::Refused { kind, message } => Err(TransportError::Rejected {
            request,
            kind,
            message,
        }),
        reply => Ok(reply),
    }
}

fn unexpected(request: &'static str, reply: &HubReply) -> TransportError {
    TransportError::UnexpectedReply {
        request,
        reply: format!("{reply:?}"),
    }
}

/// Parse `<read_fd>,<write_fd>`
pub(crate) fn parse_fd_pair(value: &str) -> Option<(i32, i32)> {
    let (read, write) = value.split_once(',')?;
    let read = read.trim().parse::<i32>().ok()?;
    let write = write.trim().parse::<i32>().ok()?;
    (read >= 0 && write >= 0 && read != write).then_some((read, write))
}

#[cfg(unix)]
fn open_inherited(value: Option<String>) -> Result<Channel, TransportError> {
    let value = value.ok_or_else(|| {
        TransportError::NotConfigured(format!("{IPC_FD_ENV} is not set; start tasks through the launcher"))
    })?;
    let (read_fd, write_fd) = parse_fd_pair(&value).ok_or_else(|| {
        TransportError::NotConfigured(format!(
            "invalid {IPC_FD_ENV}={value:?} (expected format: <read_fd>,<write_fd>)"
        ))
    })?;
    for fd in [read_fd, write_fd] {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(TransportError::NotConfigured(format!(
                "{IPC_FD_ENV} names fd {fd}, which is not open"
            )));
        }
    }

    // The fds were handed to this process for its exclusive use.
    let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
    debug!(read_fd, write_fd, "opened launcher pipes");
    Ok(Channel::new(Box::new(read_file), Box::new(write_file)))
}

#[cfg(not(unix))]
fn open_inherited(_value: Option<String>) -> Result<Channel, TransportError> {
    Err(TransportError::NotConfigured(
        "inherited pipes are only supported on unix".to_string(),
    ))
}

impl Transport for PipeTransport {
    fn init(&self) -> Result<GroupInfo, TransportError> {
        let mut link = self.link.lock();
        if matches!(*link, Link::Unopened) {
            *link = Link::Open(open_inherited(std::env::var(IPC_FD_ENV).ok())?);
        }
        let channel = match &mut *link {
            Link::Open(channel) => channel,
            _ => return Err(TransportError::NotJoined),
        };

        let join = TaskRequest::Join {
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
        };
        let info = match round_trip(channel, "join", &join) {
            Ok(HubReply::Welcome(info)) => info,
            Ok(other) => return Err(unexpected("join", &other)),
            Err(TransportError::Rejected {
                kind: RefusalKind::ProtocolMismatch,
                message,
                ..
            }) => {
                warn!(%message, "hub refused our protocol version");
                return Err(TransportError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: remote_version(&message).unwrap_or(0),
                });
            }
            Err(e) => return Err(e),
        };
        if info.protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: info.protocol_version,
            });
        }
        channel.joined = true;
        Ok(info)
    }

    fn size(&self) -> Result<usize, TransportError> {
        self.identity(Identity::Size)
    }

    fn rank(&self) -> Result<usize, TransportError> {
        self.identity(Identity::Rank)
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
        let wire = wire_root(root, self.size()?)?;
        let rank = self.rank()?;
        let call = CollectiveCall::Broadcast {
            root: wire,
            len: buf.len() as u32,
            payload: (root == rank).then(|| buf.to_vec()),
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
            root: wire_root(root, self.size()?)?,
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
        let mut link = self.link.lock();
        let previous = std::mem::replace(&mut *link, Link::Closed);
        let mut channel = match previous {
            Link::Open(channel) => channel,
            Link::Unopened | Link::Closed => return Ok(()),
        };

        // Dropping the channel closes both pipes whatever the hub answers.
        match round_trip(&mut channel, "finalize", &TaskRequest::Finalize) {
            Ok(HubReply::Finalized) => Ok(()),
            Ok(other) => Err(unexpected("finalize", &other)),
            // A task that never joined has nothing to release.
            Err(TransportError::Rejected {
                kind: RefusalKind::NotJoined,
                ..
            }) if !channel.joined => Ok(()),
            Err(TransportError::Frame(FrameError::Closed)) if !channel.joined => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The hub reports its own version as the last word of a protocol refusal.
fn remote_version(message: &str) -> Option<u32> {
    message.rsplit(' ').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Run a scripted hub on the far end of a socket pair.
    fn scripted_hub<F>(mut answer: F) -> (PipeTransport, thread::JoinHandle<Vec<TaskRequest>>)
    where
        F: FnMut(&TaskRequest) -> Option<HubReply> + Send + 'static,
    {
        let (task_side, hub_side) = UnixStream::pair().unwrap();
        let transport = PipeTransport::with_streams(
            Box::new(task_side.try_clone().unwrap()),
            Box::new(task_side),
        );
        let hub = thread::spawn(move || {
            let mut reader = FrameReader::new(hub_side.try_clone().unwrap());
            let mut writer = FrameWriter::new(hub_side);
            let mut seen = Vec::new();
            while let Ok(request) = reader.recv::<TaskRequest>() {
                let reply = answer(&request);
                seen.push(request);
                match reply {
                    Some(reply) => writer.send(&reply).unwrap(),
                    None => break,
                }
            }
            seen
        });
        (transport, hub)
    }

    fn single_task_hub(request: &TaskRequest) -> Option<HubReply> {
        Some(match request {
            TaskRequest::Join { .. } => HubReply::Welcome(GroupInfo::current("world", "hub-host")),
            TaskRequest::QuerySize => HubReply::Size(1),
            TaskRequest::QueryRank => HubReply::Rank(0),
            TaskRequest::Collective(CollectiveCall::Barrier) => {
                HubReply::Collective(CollectiveReply::BarrierReleased)
            }
            TaskRequest::Collective(CollectiveCall::Broadcast { payload, .. }) => HubReply::Collective(
                CollectiveReply::Broadcast(payload.clone().unwrap_or_default()),
            ),
            TaskRequest::Collective(CollectiveCall::ReduceSum { value, .. }) => {
                HubReply::Collective(CollectiveReply::Reduced(Some(*value)))
            }
            TaskRequest::Finalize => HubReply::Finalized,
        })
    }

    #[test]
    fn test_parse_fd_pair() {
        assert_eq!(parse_fd_pair("3,4"), Some((3, 4)));
        assert_eq!(parse_fd_pair(" 3 , 4 "), Some((3, 4)));
        assert_eq!(parse_fd_pair("3"), None);
        assert_eq!(parse_fd_pair("3,x"), None);
        assert_eq!(parse_fd_pair("3,3"), None);
        assert_eq!(parse_fd_pair("-1,4"), None);
    }

    #[test]
    fn test_missing_env_is_not_configured() {
        assert!(matches!(
            open_inherited(None),
            Err(TransportError::NotConfigured(_))
        ));
        assert!(matches!(
            open_inherited(Some("garbage".to_string())),
            Err(TransportError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_full_session() {
        let (transport, hub) = scripted_hub(single_task_hub);
        let info = transport.init().unwrap();
        assert_eq!(info.group_name, "world");
        assert_eq!(transport.size().unwrap(), 1);
        assert_eq!(transport.rank().unwrap(), 0);
        transport.barrier().unwrap();
        let mut buf = [1u8, 2, 3];
        transport.broadcast(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transport.reduce_sum(7, 0).unwrap(), Some(7));
        transport.finalize().unwrap();
        drop(transport);

        let seen = hub.join().unwrap();
        assert!(matches!(seen[0], TaskRequest::Join { protocol_version: PROTOCOL_VERSION, .. }));
        assert_eq!(seen.last(), Some(&TaskRequest::Finalize));
    }

    #[test]
    fn test_queries_before_join_fail_locally() {
        let (transport, hub) = scripted_hub(single_task_hub);
        assert!(matches!(transport.size(), Err(TransportError::NotJoined)));
        transport.finalize().unwrap();
        drop(transport);
        assert_eq!(hub.join().unwrap(), vec![TaskRequest::Finalize]);
    }

    #[test]
    fn test_refusal_becomes_rejected() {
        let (transport, _hub) = scripted_hub(|request| {
            Some(match request {
                TaskRequest::Collective(_) => {
                    HubReply::refused(RefusalKind::PeerDeparted, "rank 1 left the group")
                }
                other => single_task_hub(other)?,
            })
        });
        transport.init().unwrap();
        let err = transport.barrier().unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected {
                request: "barrier",
                kind: RefusalKind::PeerDeparted,
                ..
            }
        ));
    }

    #[test]
    fn test_protocol_refusal_is_version_mismatch() {
        let (transport, _hub) = scripted_hub(|_| {
            Some(HubReply::refused(
                RefusalKind::ProtocolMismatch,
                "hub speaks protocol 9",
            ))
        });
        assert!(matches!(
            transport.init(),
            Err(TransportError::VersionMismatch { local: PROTOCOL_VERSION, remote: 9 })
        ));
    }

    #[test]
    fn test_hub_hangup_is_an_error() {
        let (transport, _hub) = scripted_hub(|request| match request {
            TaskRequest::Collective(_) => None,
            other => single_task_hub(other),
        });
        transport.init().unwrap();
        assert!(matches!(
            transport.reduce_sum(1, 0),
            Err(TransportError::Frame(FrameError::Closed))
        ));
    }

    #[test]
    fn test_identity_is_asked_once() {
        let (transport, hub) = scripted_hub(single_task_hub);
        transport.init().unwrap();
        assert_eq!(transport.size().unwrap(), 1);
        assert_eq!(transport.size().unwrap(), 1);
        assert_eq!(transport.rank().unwrap(), 0);
        let mut buf = [4u8; 2];
        transport.broadcast(&mut buf, 0).unwrap();
        transport.finalize().unwrap();
        drop(transport);

        let seen = hub.join().unwrap();
        let queries = seen
            .iter()
            .filter(|r| matches!(r, TaskRequest::QuerySize | TaskRequest::QueryRank))
            .count();
        assert_eq!(queries, 2);
    }

    #[test]
    fn test_root_outside_group_never_reaches_hub() {
        let (transport, hub) = scripted_hub(single_task_hub);
        transport.init().unwrap();
        assert!(matches!(
            transport.reduce_sum(5, 1usize << 32),
            Err(TransportError::RankOutOfRange { size: 1, .. })
        ));
        let mut buf = [0u8; 3];
        assert!(matches!(
            transport.broadcast(&mut buf, 1),
            Err(TransportError::RankOutOfRange { rank: 1, size: 1 })
        ));
        transport.finalize().unwrap();
        drop(transport);

        let seen = hub.join().unwrap();
        assert!(!seen.iter().any(|r| matches!(r, TaskRequest::Collective(_))));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let (transport, _hub) = scripted_hub(single_task_hub);
        transport.init().unwrap();
        transport.finalize().unwrap();
        transport.finalize().unwrap();
        assert!(matches!(transport.barrier(), Err(TransportError::NotJoined)));
    }
}

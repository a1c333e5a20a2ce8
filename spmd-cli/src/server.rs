//! Hub I/O loop
//!
//! [`HubServer`] owns the hub-side end of every task connection. A reader
//! thread per task decodes requests and forwards them into one channel, so
//! the [`Hub`] sees a single ordered stream of events and never blocks on a
//! particular task.

use crate::hub::{Hub, Outbox};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use spmd_ipc::{FrameError, FrameReader, FrameWriter, GroupInfo, TaskRequest};
use std::io::{Read, Write};
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

/// Hub-side reading end of a task connection
pub type HubReader = Box<dyn Read + Send>;
/// Hub-side writing end of a task connection
pub type HubWriter = Box<dyn Write + Send>;

enum Event {
    Request { rank: usize, request: TaskRequest },
    Closed { rank: usize, error: Option<FrameError> },
}

/// Serves one group's connections until every task has gone
pub struct HubServer {
    hub: Hub,
    writers: Vec<Option<FrameWriter<HubWriter>>>,
    tx: Option<Sender<Event>>,
    rx: Receiver<Event>,
}

impl HubServer {
    /// Server for `size` tasks
    pub fn new(info: GroupInfo, size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            hub: Hub::new(info, size),
            writers: (0..size).map(|_| None).collect(),
            tx: Some(tx),
            rx,
        }
    }

    /// Start reading requests for `rank`.
    pub fn attach(
        &mut self,
        rank: usize,
        reader: HubReader,
        writer: HubWriter,
    ) -> std::io::Result<()> {
        let Some(slot) = self.writers.get_mut(rank) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("rank {rank} is outside a group of {}", self.hub.size()),
            ));
        };
        let Some(tx) = self.tx.clone() else {
            return Err(std::io::Error::other("server already running"));
        };
        *slot = Some(FrameWriter::new(writer));

        thread::Builder::new()
            .name(format!("spmd-reader-{rank}"))
            .spawn(move || forward_requests(rank, FrameReader::new(reader), tx))?;
        Ok(())
    }

    /// Run until every connection has closed. Returns `true` if `deadline`
    /// passed first.
    pub fn serve(&mut self, deadline: Option<Instant>) -> bool {
        // Only the reader threads hold senders now, so the channel
        // disconnects once every connection has closed.
        self.tx = None;

        loop {
            let event = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(remaining) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => return true,
                        Err(RecvTimeoutError::Disconnected) => return false,
                    }
                }
                None => match self.rx.recv() {
                    Ok(event) => event,
                    Err(_) => return false,
                },
            };

            let outbox = match event {
                Event::Request { rank, request } => self.hub.handle(rank, request),
                Event::Closed { rank, error } => {
                    if let Some(e) = error {
                        warn!(rank, error = %e, "task pipe failed");
                    }
                    if let Some(slot) = self.writers.get_mut(rank) {
                        *slot = None;
                    }
                    self.hub.hang_up(rank)
                }
            };
            self.deliver(outbox);
        }
    }

    /// Close every hub-side writer so tasks blocked on a reply see EOF.
    pub fn disconnect(&mut self) {
        for slot in &mut self.writers {
            *slot = None;
        }
    }

    /// Collective rounds completed so far
    pub fn completed_rounds(&self) -> u64 {
        self.hub.completed_rounds()
    }

    /// Whether every task finalized or went away
    pub fn is_done(&self) -> bool {
        self.hub.is_done()
    }

    fn deliver(&mut self, outbox: Outbox) {
        for (rank, reply) in outbox {
            let Some(slot) = self.writers.get_mut(rank) else {
                continue;
            };
            let Some(writer) = slot.as_mut() else {
                debug!(rank, "dropping reply for a closed task");
                continue;
            };
            if let Err(e) = writer.send(&reply) {
                warn!(rank, error = %e, "could not deliver reply");
                *slot = None;
            }
        }
    }
}

/// Reader thread body: forward every request until the pipe closes.
fn forward_requests(rank: usize, mut reader: FrameReader<HubReader>, events: Sender<Event>) {
    loop {
        match reader.recv::<TaskRequest>() {
            Ok(request) => {
                if events.send(Event::Request { rank, request }).is_err() {
                    return;
                }
            }
            Err(FrameError::Closed) => {
                let _ = events.send(Event::Closed { rank, error: None });
                return;
            }
            Err(e) => {
                let _ = events.send(Event::Closed {
                    rank,
                    error: Some(e),
                });
                return;
            }
        }
    }
}

//! Reliable request/response layer over the control sub-channel.
//!
//! Every command gets an id, is serialized once and retransmitted verbatim
//! until the remote acks or nacks it or the retry budget runs out. Commands
//! sent while the control sub-channel is down are queued and flushed in
//! order once it opens.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use remote_panes_core::{NetConfig, ReadyState, SubChannel};
use remote_panes_transport::{ControlCommand, Envelope, MessageId, ReplyFrame};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::SessionError,
    tasks::{self, TaskGuard},
};

/// Terminal outcome of one control message.
#[derive(Debug)]
pub struct Resolved<R> {
    pub id: MessageId,
    pub command: &'static str,
    pub responder: R,
    /// Reply body on ack. Nack maps to [`SessionError::Rejected`].
    pub outcome: Result<Value, SessionError>,
}

struct Queued<R> {
    id: MessageId,
    command: ControlCommand,
    responder: R,
}

struct InFlight<R> {
    command: &'static str,
    responder: R,
    tries: u32,
    payload: Bytes,
    created: Instant,
    _retry: TaskGuard,
}

/// Outbound half of the control protocol.
///
/// Retry timers post the message id on the channel given to [`ControlLink::new`];
/// the owner hands each one back through [`ControlLink::on_retry`].
pub struct ControlLink<R> {
    net: NetConfig,
    next_id: MessageId,
    channel: Option<Arc<dyn SubChannel>>,
    queue: VecDeque<Queued<R>>,
    pending: HashMap<MessageId, InFlight<R>>,
    retries: mpsc::UnboundedSender<MessageId>,
}

impl<R> ControlLink<R> {
    #[must_use]
    pub fn new(net: NetConfig, retries: mpsc::UnboundedSender<MessageId>) -> Self {
        Self {
            net,
            next_id: 1,
            channel: None,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            retries,
        }
    }

    /// Whether a control sub-channel is attached and open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| c.ready_state() == ReadyState::Open)
    }

    /// Number of messages waiting for the control sub-channel.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of transmitted messages awaiting a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send a command, or queue it behind earlier ones if the control
    /// sub-channel is not open.
    ///
    /// # Errors
    /// Returns the resolved message if it could not be serialized.
    pub fn send(&mut self, command: ControlCommand, responder: R) -> Result<MessageId, Resolved<R>> {
        let id = self.allocate();
        if self.is_open() {
            self.transmit(id, command, responder)?;
        } else {
            tracing::debug!(message_id = id, kind = command.kind(), "queueing control message");
            self.queue.push_back(Queued {
                id,
                command,
                responder,
            });
        }
        Ok(id)
    }

    /// Like [`send`](Self::send) but jumps ahead of queued messages.
    ///
    /// # Errors
    /// Returns the resolved message if it could not be serialized.
    pub fn send_urgent(&mut self, command: ControlCommand, responder: R) -> Result<MessageId, Resolved<R>> {
        let id = self.allocate();
        if self.is_open() {
            self.transmit(id, command, responder)?;
        } else {
            self.queue.push_front(Queued {
                id,
                command,
                responder,
            });
        }
        Ok(id)
    }

    /// Attach an open control sub-channel and flush the queue in order.
    pub fn attach(&mut self, channel: Arc<dyn SubChannel>) -> Vec<Resolved<R>> {
        self.channel = Some(channel);
        let mut failed = Vec::new();
        while self.is_open() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            if let Err(resolved) = self.transmit(queued.id, queued.command, queued.responder) {
                failed.push(resolved);
            }
        }
        failed
    }

    /// Forget the control sub-channel. In-flight messages keep their retry
    /// timers; new sends queue.
    pub fn detach(&mut self) {
        self.channel = None;
    }

    /// Match a reply to its message.
    ///
    /// Returns `None` for replies to unknown or already resolved ids.
    pub fn on_reply(&mut self, frame: ReplyFrame) -> Option<Resolved<R>> {
        let id = frame.reference();
        let Some(entry) = self.pending.remove(&id) else {
            tracing::debug!(message_id = id, "reply for unknown control message");
            return None;
        };
        tracing::debug!(
            message_id = id,
            kind = entry.command,
            tries = entry.tries,
            elapsed_ms = u64::try_from(entry.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            "control message answered"
        );
        let outcome = match frame {
            ReplyFrame::Ack(reply) => Ok(reply.body),
            ReplyFrame::Nack(reply) => Err(SessionError::Rejected {
                command: entry.command,
                body: reply.body,
            }),
        };
        Some(Resolved {
            id,
            command: entry.command,
            responder: entry.responder,
            outcome,
        })
    }

    /// Handle a retry timer.
    ///
    /// Retransmits while tries remain; returns the message once the budget
    /// is spent.
    pub fn on_retry(&mut self, id: MessageId) -> Option<Resolved<R>> {
        let entry = self.pending.remove(&id)?;
        if entry.tries < self.net.retries {
            let tries = entry.tries + 1;
            tracing::debug!(message_id = id, kind = entry.command, tries, "retransmitting");
            if let Some(channel) = &self.channel {
                if let Err(e) = channel.send(entry.payload.clone()) {
                    tracing::debug!(message_id = id, "retransmit failed: {e}");
                }
            }
            let retry = tasks::after(self.net.timeout(), &self.retries, id);
            self.pending.insert(
                id,
                InFlight {
                    tries,
                    _retry: retry,
                    ..entry
                },
            );
            return None;
        }

        tracing::warn!(message_id = id, kind = entry.command, tries = entry.tries, "retries exhausted");
        Some(Resolved {
            id,
            command: entry.command,
            responder: entry.responder,
            outcome: Err(SessionError::Timeout),
        })
    }

    /// Resolve every queued and in-flight message with `error`.
    pub fn fail_all(&mut self, error: &SessionError) -> Vec<Resolved<R>> {
        let queued = self.queue.drain(..).map(|q| Resolved {
            id: q.id,
            command: q.command.kind(),
            responder: q.responder,
            outcome: Err(error.clone()),
        });
        let mut resolved: Vec<_> = queued.collect();
        let mut in_flight: Vec<_> = self.pending.drain().collect();
        in_flight.sort_unstable_by_key(|(id, _)| *id);
        resolved.extend(in_flight.into_iter().map(|(id, entry)| Resolved {
            id,
            command: entry.command,
            responder: entry.responder,
            outcome: Err(error.clone()),
        }));
        resolved
    }

    fn allocate(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn transmit(&mut self, id: MessageId, command: ControlCommand, responder: R) -> Result<(), Resolved<R>> {
        let kind = command.kind();
        let payload = match Envelope::new(id, command).encode() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(Resolved {
                    id,
                    command: kind,
                    responder,
                    outcome: Err(SessionError::Internal(e.to_string())),
                });
            }
        };
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send(payload.clone()) {
                tracing::debug!(message_id = id, "transmit failed, relying on retry: {e}");
            }
        }
        tracing::trace!(message_id = id, kind, "control message sent");
        self.pending.insert(
            id,
            InFlight {
                command: kind,
                responder,
                tries: 1,
                payload,
                created: Instant::now(),
                _retry: tasks::after(self.net.timeout(), &self.retries, id),
            },
        );
        Ok(())
    }
}

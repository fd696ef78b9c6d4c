//! Pane channels multiplexed over the session transport.

use std::{collections::VecDeque, fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use remote_panes_core::{ReadyState, SubChannel};
use remote_panes_transport::{ChannelId, ControlCommand};
use tokio::sync::{mpsc, oneshot};

use crate::{error::SessionError, session::Command};

/// Why a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// [`Channel::close`] was called.
    Requested,
    /// The remote closed the sub-channel. This is the per-channel form of a
    /// lost data channel ([`FailureReason::DataChannelLost`]).
    ///
    /// [`FailureReason::DataChannelLost`]: remote_panes_core::FailureReason::DataChannelLost
    Remote,
    /// The session disengaged; the remote process keeps running.
    Disengaged,
    /// The same remote channel was reattached and the new sub-channel took
    /// over.
    Replaced,
    /// The session was closed.
    SessionClosed,
}

/// Event delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Bytes),
    Closed { reason: CloseReason },
}

enum Link {
    Attached(Arc<dyn SubChannel>),
    Detached,
    Closed(CloseReason),
}

/// Events kept for the first subscriber. Older data is dropped past this.
pub const BACKLOG_LIMIT: usize = 1024;

#[derive(Default)]
struct Observers {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ChannelEvent>)>,
    backlog: VecDeque<ChannelEvent>,
    dropped: usize,
    subscribed: bool,
}

impl Observers {
    fn deliver(&mut self, event: ChannelEvent) {
        if !self.subscribed {
            if self.backlog.len() == BACKLOG_LIMIT {
                self.backlog.pop_front();
                self.dropped += 1;
            }
            self.backlog.push_back(event);
            return;
        }
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

struct ChannelInner {
    id: ChannelId,
    generation: u64,
    key: u64,
    link: Mutex<Link>,
    observers: Mutex<Observers>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to one pane channel.
///
/// Cheap to clone. A reattached pane gets a new `Channel` with the same id.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        generation: u64,
        key: u64,
        sub: Arc<dyn SubChannel>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                generation,
                key,
                link: Mutex::new(Link::Attached(sub)),
                observers: Mutex::new(Observers::default()),
                commands,
            }),
        }
    }

    /// Remote channel id.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Session generation the channel was created on.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub(crate) fn key(&self) -> u64 {
        self.inner.key
    }

    /// Current readiness. `Disconnected` once the transport went away.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        match &*self.inner.link.lock() {
            Link::Attached(sub) => sub.ready_state(),
            Link::Detached => ReadyState::Disconnected,
            Link::Closed(_) => ReadyState::Closed,
        }
    }

    /// Why the channel closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match &*self.inner.link.lock() {
            Link::Closed(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Write bytes to the remote process.
    ///
    /// # Errors
    /// Returns error if the channel is not open.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let sub = match &*self.inner.link.lock() {
            Link::Attached(sub) => Arc::clone(sub),
            Link::Detached | Link::Closed(_) => return Err(SessionError::NotConnected),
        };
        sub.send(data.into()).map_err(SessionError::from)
    }

    /// Resize the remote pane.
    ///
    /// # Errors
    /// Returns error if the channel is closed or the remote refuses.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if matches!(*self.inner.link.lock(), Link::Closed(_)) {
            return Err(SessionError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        let command = ControlCommand::Resize {
            id: self.inner.id,
            cols,
            rows,
        };
        self.inner
            .commands
            .send(Command::Request { command, reply })
            .map_err(|_| SessionError::Cancelled)?;
        rx.await.map_err(|_| SessionError::Cancelled)?.map(|_| ())
    }

    /// Close the channel. The remote process is told through the sub-channel
    /// closing; subscribers receive [`CloseReason::Requested`].
    pub fn close(&self) {
        if matches!(*self.inner.link.lock(), Link::Closed(_)) {
            return;
        }
        let _ = self.inner.commands.send(Command::CloseChannel {
            id: self.inner.id,
            key: self.inner.key,
        });
    }

    /// Observe channel events.
    ///
    /// The first subscriber also receives what was delivered before it
    /// subscribed, up to the last [`BACKLOG_LIMIT`] events.
    #[must_use]
    pub fn subscribe(&self) -> ChannelSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self.inner.observers.lock();
        if observers.subscribed {
            if let Some(reason) = self.close_reason() {
                let _ = tx.send(ChannelEvent::Closed { reason });
            }
        } else {
            observers.subscribed = true;
            if observers.dropped > 0 {
                tracing::debug!(
                    channel_id = self.inner.id,
                    dropped = observers.dropped,
                    "backlog overflowed before first subscriber"
                );
            }
            for event in observers.backlog.drain(..) {
                let _ = tx.send(event);
            }
        }
        let id = observers.next_id;
        observers.next_id += 1;
        observers.subscribers.push((id, tx));
        ChannelSubscription {
            id,
            channel: Arc::downgrade(&self.inner),
            events: rx,
        }
    }

    /// Drop every subscriber.
    pub fn detach_all(&self) {
        self.inner.observers.lock().subscribers.clear();
    }

    pub(crate) fn dispatch(&self, event: ChannelEvent) {
        self.inner.observers.lock().deliver(event);
    }

    /// Lose the sub-channel without closing.
    pub(crate) fn detach(&self) {
        let mut link = self.inner.link.lock();
        if matches!(*link, Link::Attached(_)) {
            *link = Link::Detached;
        }
    }

    /// Close the sub-channel and notify subscribers once.
    pub(crate) fn finish(&self, reason: CloseReason) {
        let mut observers = self.inner.observers.lock();
        let previous = {
            let mut link = self.inner.link.lock();
            if matches!(*link, Link::Closed(_)) {
                return;
            }
            std::mem::replace(&mut *link, Link::Closed(reason))
        };
        if let Link::Attached(sub) = previous {
            sub.close();
        }
        tracing::debug!(channel_id = self.inner.id, ?reason, "channel closed");
        observers.deliver(ChannelEvent::Closed { reason });
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("generation", &self.inner.generation)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// A registered channel observer.
pub struct ChannelSubscription {
    id: u64,
    channel: std::sync::Weak<ChannelInner>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelSubscription {
    /// Next event, or `None` once unsubscribed or detached.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    /// Stop observing.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.channel.upgrade() {
            inner
                .observers
                .lock()
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

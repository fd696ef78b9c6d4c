//! In-memory peer transport.
//!
//! Every transport opened by [`MemoryTransportFactory`] is paired with a
//! [`MemoryRemote`] that plays the remote host: it sees sub-channels the
//! client creates, opens sub-channels toward the client and drives the
//! transport state.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use remote_panes_core::{
    PeerTransport, ReadyState, SubChannel, SubChannelEvent, SubChannelLink, TransportError,
    TransportEvent, TransportFactory, TransportLink, TransportParams, TransportState,
};
use tokio::sync::mpsc;

use crate::protocol::ReplyFrame;

/// One end of an in-memory sub-channel pair.
///
/// Both ends share a single ready state, like the two sides of a data channel.
pub struct MemorySubChannel {
    label: String,
    state: Arc<Mutex<ReadyState>>,
    peer: mpsc::UnboundedSender<SubChannelEvent>,
    local: mpsc::UnboundedSender<SubChannelEvent>,
}

impl MemorySubChannel {
    /// Move from `connecting` to `open`, notifying both ends.
    pub fn accept(&self) {
        {
            let mut state = self.state.lock();
            if *state != ReadyState::Connecting {
                return;
            }
            *state = ReadyState::Open;
        }
        let _ = self.local.send(SubChannelEvent::Open);
        let _ = self.peer.send(SubChannelEvent::Open);
    }

    /// Deliver an event to the other end regardless of state.
    ///
    /// Simulates packets that were already in flight when the channel closed.
    pub fn inject(&self, event: SubChannelEvent) {
        let _ = self.peer.send(event);
    }
}

impl SubChannel for MemorySubChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if *self.state.lock() != ReadyState::Open {
            return Err(TransportError::NotOpen(self.label.clone()));
        }
        self.peer
            .send(SubChannelEvent::Message(data))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closed;
        }
        let _ = self.peer.send(SubChannelEvent::Close);
    }
}

type End = (Arc<MemorySubChannel>, mpsc::UnboundedReceiver<SubChannelEvent>);

fn sub_channel_pair(label: &str) -> (End, End) {
    let state = Arc::new(Mutex::new(ReadyState::Connecting));
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemorySubChannel {
        label: label.to_string(),
        state: Arc::clone(&state),
        peer: b_tx.clone(),
        local: a_tx.clone(),
    };
    let b = MemorySubChannel {
        label: label.to_string(),
        state,
        peer: a_tx,
        local: b_tx,
    };
    ((Arc::new(a), a_rx), (Arc::new(b), b_rx))
}

/// Remote end of a sub-channel.
pub struct RemoteChannel {
    channel: Arc<MemorySubChannel>,
    events: mpsc::UnboundedReceiver<SubChannelEvent>,
}

impl RemoteChannel {
    /// Label the channel was created with.
    #[must_use]
    pub fn label(&self) -> &str {
        self.channel.label()
    }

    /// Shared ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.channel.ready_state()
    }

    /// Open the channel.
    pub fn accept(&self) {
        self.channel.accept();
    }

    /// Handle for sending from another task.
    #[must_use]
    pub fn handle(&self) -> Arc<MemorySubChannel> {
        Arc::clone(&self.channel)
    }

    /// Send raw bytes to the client.
    ///
    /// # Errors
    /// Returns error if the channel is not open.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.channel.send(data.into())
    }

    /// Send an ack or nack to the client.
    ///
    /// # Errors
    /// Returns error if the channel is not open.
    pub fn reply(&self, frame: &ReplyFrame) -> Result<(), TransportError> {
        send_reply(&self.channel, frame)
    }

    /// Deliver an event to the client regardless of state.
    pub fn inject(&self, event: SubChannelEvent) {
        self.channel.inject(event);
    }

    /// Close the channel.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Next message from the client, or `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.events.recv().await? {
                SubChannelEvent::Message(data) => return Some(data),
                SubChannelEvent::Open => {}
                SubChannelEvent::Close => return None,
            }
        }
    }

    /// Next already-delivered message, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.events.try_recv().ok()? {
                SubChannelEvent::Message(data) => return Some(data),
                SubChannelEvent::Open => {}
                SubChannelEvent::Close => return None,
            }
        }
    }
}

/// Send an encoded reply frame on a sub-channel.
///
/// # Errors
/// Returns error if the channel is not open.
pub fn send_reply(channel: &MemorySubChannel, frame: &ReplyFrame) -> Result<(), TransportError> {
    let raw = frame
        .encode()
        .map_err(|e| TransportError::NotSupported(e.to_string()))?;
    channel.send(raw)
}

/// Client side of an in-memory connection.
pub struct MemoryTransport {
    state: Mutex<TransportState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    created: mpsc::UnboundedSender<RemoteChannel>,
    channels: Mutex<Vec<Weak<MemorySubChannel>>>,
}

impl MemoryTransport {
    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    fn track(&self, channel: &Arc<MemorySubChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.push(Arc::downgrade(channel));
    }

    fn is_usable(&self) -> bool {
        !matches!(
            *self.state.lock(),
            TransportState::Closed | TransportState::Failed
        )
    }
}

impl PeerTransport for MemoryTransport {
    fn create_sub_channel(&self, label: &str) -> Result<SubChannelLink, TransportError> {
        if !self.is_usable() {
            return Err(TransportError::Closed);
        }
        let ((local, local_rx), (remote, remote_rx)) = sub_channel_pair(label);
        self.track(&local);
        self.created
            .send(RemoteChannel {
                channel: remote,
                events: remote_rx,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(SubChannelLink {
            channel: local,
            events: local_rx,
        })
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Closed {
                return;
            }
            *state = TransportState::Closed;
        }
        for channel in self.channels.lock().drain(..) {
            if let Some(channel) = channel.upgrade() {
                channel.close();
            }
        }
    }
}

/// Cloneable remote-side control over a transport.
#[derive(Clone)]
pub struct RemoteHandle {
    transport: Arc<MemoryTransport>,
}

impl RemoteHandle {
    /// Open a sub-channel toward the client and move it to `open`.
    ///
    /// # Errors
    /// Returns error if the transport is closed.
    pub fn open_channel(&self, label: &str) -> Result<RemoteChannel, TransportError> {
        let channel = self.announce_channel(label)?;
        channel.accept();
        Ok(channel)
    }

    /// Open a sub-channel toward the client but leave it `connecting`.
    ///
    /// # Errors
    /// Returns error if the transport is closed.
    pub fn announce_channel(&self, label: &str) -> Result<RemoteChannel, TransportError> {
        if !self.transport.is_usable() {
            return Err(TransportError::Closed);
        }
        let ((local, local_rx), (remote, remote_rx)) = sub_channel_pair(label);
        self.transport.track(&local);
        self.transport
            .events
            .send(TransportEvent::SubChannel(SubChannelLink {
                channel: local,
                events: local_rx,
            }))
            .map_err(|_| TransportError::Closed)?;
        Ok(RemoteChannel {
            channel: remote,
            events: remote_rx,
        })
    }

    /// Drive the client-visible transport state.
    pub fn set_state(&self, state: TransportState) {
        self.transport.set_state(state);
    }

    /// Whether the client closed the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.state() == TransportState::Closed
    }
}

/// Remote side of an in-memory connection.
pub struct MemoryRemote {
    params: TransportParams,
    handle: RemoteHandle,
    created: mpsc::UnboundedReceiver<RemoteChannel>,
}

impl MemoryRemote {
    /// Parameters the client opened the transport with.
    #[must_use]
    pub const fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Cloneable handle for opening channels from other tasks.
    #[must_use]
    pub fn handle(&self) -> RemoteHandle {
        self.handle.clone()
    }

    /// Next sub-channel created by the client, still `connecting`.
    pub async fn accept_channel(&mut self) -> Option<RemoteChannel> {
        self.created.recv().await
    }

    /// See [`RemoteHandle::open_channel`].
    ///
    /// # Errors
    /// Returns error if the transport is closed.
    pub fn open_channel(&self, label: &str) -> Result<RemoteChannel, TransportError> {
        self.handle.open_channel(label)
    }

    /// See [`RemoteHandle::announce_channel`].
    ///
    /// # Errors
    /// Returns error if the transport is closed.
    pub fn announce_channel(&self, label: &str) -> Result<RemoteChannel, TransportError> {
        self.handle.announce_channel(label)
    }

    /// See [`RemoteHandle::set_state`].
    pub fn set_state(&self, state: TransportState) {
        self.handle.set_state(state);
    }

    /// See [`RemoteHandle::is_closed`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Factory producing [`MemoryTransport`]s, each paired with a [`MemoryRemote`].
pub struct MemoryTransportFactory {
    remotes: mpsc::UnboundedSender<MemoryRemote>,
    failures: Mutex<VecDeque<TransportError>>,
    opened: AtomicUsize,
}

impl MemoryTransportFactory {
    /// Create a factory and the receiver of remote ends.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let factory = Self {
            remotes,
            failures: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
        };
        (factory, rx)
    }

    /// Make the next `open` fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn open(&self, params: TransportParams) -> Result<TransportLink, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MemoryTransport {
            state: Mutex::new(TransportState::Connecting),
            events: events_tx,
            created: created_tx,
            channels: Mutex::new(Vec::new()),
        });
        let remote = MemoryRemote {
            params,
            handle: RemoteHandle {
                transport: Arc::clone(&transport),
            },
            created: created_rx,
        };
        self.remotes
            .send(remote)
            .map_err(|_| TransportError::Negotiation("no remote is listening".to_string()))?;

        transport.set_state(TransportState::Connected);
        tracing::debug!("memory transport connected");
        Ok(TransportLink {
            transport,
            events: events_rx,
        })
    }
}

//! Session state machine.
//!
//! A [`Session`] is a cheap handle to a single actor task that owns the
//! transport, the control link, every pane channel and all timers. Handles
//! marshal commands to the actor; transport, sub-channel and timer events
//! are forwarded into it by small pump tasks. Events are tagged with the
//! attempt, transport epoch or sub-channel key they belong to, so anything
//! left over from a torn-down attempt is dropped on arrival.

use std::{
    collections::HashMap,
    fmt,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use remote_panes_core::{
    FailureReason, IceServer, IceServerSource, IdentityProvider, PeerTransport, ReadyState,
    SessionConfig, SessionState, StateChange, SubChannel, SubChannelEvent, SubChannelLink,
    TransportEvent, TransportFactory, TransportLink, TransportParams, TransportState,
};
use remote_panes_transport::{ChannelId, ChannelLabel, ControlCommand, Marker, MessageId, ReplyFrame};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    channel::{Channel, ChannelEvent, CloseReason},
    control::{ControlLink, Resolved},
    error::SessionError,
    tasks::{self, TaskGuard},
};

const STATE_CHANGE_CAPACITY: usize = 64;

/// Outcome of a successful connect with a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
    /// The remote accepted the marker; carries the saved layout.
    Restored(String),
    /// The marker was refused; carries the layout fetched afresh.
    Fresh(String),
}

impl Resumption {
    #[must_use]
    pub fn layout(&self) -> &str {
        match self {
            Self::Restored(layout) | Self::Fresh(layout) => layout,
        }
    }

    #[must_use]
    pub const fn is_restored(&self) -> bool {
        matches!(self, Self::Restored(_))
    }
}

/// What a channel open should attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Spawn a new remote process from a shell command line.
    New(String),
    /// Reattach to a remote process that is still running.
    Existing(ChannelId),
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneSize {
    pub cols: u16,
    pub rows: u16,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Connect {
        marker: Option<Marker>,
        reuse: bool,
        reply: Reply<Option<Resumption>>,
    },
    Disconnect {
        reply: Reply<Marker>,
    },
    OpenChannel {
        target: ChannelTarget,
        parent: Option<ChannelId>,
        size: Option<PaneSize>,
        reply: Reply<Channel>,
    },
    Request {
        command: ControlCommand,
        reply: Reply<Value>,
    },
    CloseChannel {
        id: ChannelId,
        key: u64,
    },
    Close,
}

enum Event {
    Opened {
        attempt: u64,
        result: Result<TransportLink, SessionError>,
    },
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    Control {
        attempt: u64,
        event: SubChannelEvent,
    },
    Inbound {
        key: u64,
        event: SubChannelEvent,
    },
    Watchdog {
        attempt: u64,
    },
    OpenTimeout {
        message_id: MessageId,
        generation: u64,
    },
}

/// Who is waiting on a control message.
enum Responder {
    Reply(Reply<Value>),
    Mark(Reply<Marker>),
    Auth { attempt: u64 },
    Restore { attempt: u64 },
    FreshLayout { attempt: u64 },
    OpenChannel,
}

#[derive(Clone)]
struct Prerequisites {
    factory: Arc<dyn TransportFactory>,
    ice_servers: Arc<dyn IceServerSource>,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl Prerequisites {
    async fn open(&self) -> Result<TransportLink, SessionError> {
        let ice_servers = self
            .ice_servers
            .ice_servers()
            .await
            .map_err(|e| SessionError::Prerequisite(e.to_string()))?;
        let (certificate, fingerprint) = match &self.identity {
            Some(identity) => {
                let certificate = identity
                    .certificate()
                    .await
                    .map_err(|e| SessionError::Prerequisite(e.to_string()))?;
                (Some(certificate), Some(identity.fingerprint()))
            }
            None => (None, None),
        };
        self.factory
            .open(TransportParams {
                ice_servers,
                certificate,
                fingerprint,
            })
            .await
            .map_err(|e| SessionError::BadRemoteDescription(e.to_string()))
    }
}

/// Builds a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    prerequisites: Prerequisites,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Where to fetch ICE servers before each full connect.
    #[must_use]
    pub fn ice_servers(mut self, source: Arc<dyn IceServerSource>) -> Self {
        self.prerequisites.ice_servers = source;
        self
    }

    /// Local identity handed to the transport and sent with `auth`.
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.prerequisites.identity = Some(identity);
        self
    }

    /// Spawn the session actor.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn build(self) -> Session {
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (retries_tx, retries_rx) = mpsc::unbounded_channel();
        let initial = StateChange::new(SessionState::New, None);
        let (state_tx, state_rx) = watch::channel(initial);
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let last_marker = Arc::new(Mutex::new(None));

        let actor = Actor {
            control: ControlLink::new(self.config.net.clone(), retries_tx),
            config: self.config,
            prerequisites: self.prerequisites,
            commands: commands_tx.downgrade(),
            events: events_tx,
            state: SessionState::New,
            state_tx,
            changes: changes.clone(),
            attempt: 0,
            connecting: None,
            epoch: 0,
            transport: None,
            control_sub: None,
            generation: 0,
            channels: HashMap::new(),
            pending_opens: HashMap::new(),
            inbound: HashMap::new(),
            next_key: 1,
            last_marker: Arc::clone(&last_marker),
        };
        tokio::spawn(
            actor
                .run(commands_rx, events_rx, retries_rx)
                .instrument(tracing::info_span!("session", %id)),
        );

        Session {
            inner: Arc::new(Shared {
                id,
                commands: commands_tx,
                state: state_rx,
                changes,
                last_marker,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct Shared {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<StateChange>,
    changes: broadcast::Sender<StateChange>,
    last_marker: Arc<Mutex<Option<Marker>>>,
    closed: AtomicBool,
}

/// Handle to one remote session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
}

impl Session {
    /// Start building a session that opens transports through `factory`.
    #[must_use]
    pub fn builder(factory: Arc<dyn TransportFactory>) -> SessionBuilder {
        SessionBuilder {
            config: SessionConfig::default(),
            prerequisites: Prerequisites {
                factory,
                ice_servers: Arc::new(Vec::<IceServer>::new()),
                identity: None,
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().state
    }

    /// Current state with the reason for the last transition.
    #[must_use]
    pub fn status(&self) -> StateChange {
        *self.inner.state.borrow()
    }

    /// Receiver that always holds the latest state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<StateChange> {
        self.inner.state.clone()
    }

    /// Every state transition from now on.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }

    /// [`state_changes`](Self::state_changes) as a stream. Lagged
    /// transitions are skipped.
    pub fn state_stream(&self) -> impl Stream<Item = StateChange> + use<> {
        BroadcastStream::new(self.state_changes()).filter_map(Result::ok)
    }

    /// Marker stored by the last successful [`disconnect`](Self::disconnect).
    #[must_use]
    pub fn last_marker(&self) -> Option<Marker> {
        *self.inner.last_marker.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Open a new transport and control sub-channel.
    ///
    /// With a marker the remote is asked to restore; the result says whether
    /// it did.
    ///
    /// # Errors
    /// Returns error if the attempt fails or the session is not in a
    /// connectable state.
    pub async fn connect(&self, marker: Option<Marker>) -> Result<Option<Resumption>, SessionError> {
        self.call(|reply| Command::Connect {
            marker,
            reuse: false,
            reply,
        })
        .await
    }

    /// Like [`connect`](Self::connect), but keeps the transport if it is
    /// still connected and only recreates the control sub-channel.
    ///
    /// # Errors
    /// Returns error if the attempt fails or the session is not in a
    /// connectable state.
    pub async fn reconnect(&self, marker: Option<Marker>) -> Result<Option<Resumption>, SessionError> {
        self.call(|reply| Command::Connect {
            marker,
            reuse: true,
            reply,
        })
        .await
    }

    /// Disengage: obtain a marker, close every channel and the transport.
    /// Remote processes keep running.
    ///
    /// # Errors
    /// Returns [`SessionError::NotConnected`] without a control sub-channel,
    /// or the failure of the `mark` exchange.
    pub async fn disconnect(&self) -> Result<Marker, SessionError> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// Open a pane channel.
    ///
    /// # Errors
    /// Returns error if the remote refuses, the open times out or the
    /// session is torn down first.
    pub async fn open_channel(
        &self,
        target: ChannelTarget,
        parent: Option<ChannelId>,
        size: Option<PaneSize>,
    ) -> Result<Channel, SessionError> {
        self.call(|reply| Command::OpenChannel {
            target,
            parent,
            size,
            reply,
        })
        .await
    }

    /// Fetch the serialized layout.
    ///
    /// # Errors
    /// Returns error if the control exchange fails.
    pub async fn get_payload(&self) -> Result<String, SessionError> {
        let command = ControlCommand::GetPayload;
        let body = self.call(|reply| Command::Request { command, reply }).await?;
        Ok(body_text(body))
    }

    /// Store the serialized layout.
    ///
    /// # Errors
    /// Returns error if the control exchange fails.
    pub async fn set_payload(&self, payload: impl Into<String>) -> Result<(), SessionError> {
        let command = ControlCommand::SetPayload {
            payload: payload.into(),
        };
        self.call(|reply| Command::Request { command, reply }).await?;
        Ok(())
    }

    /// Close the session. Outstanding operations fail with
    /// [`SessionError::Cancelled`]. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.commands.send(Command::Close);
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        if self.is_closed() {
            return Err(SessionError::InvalidState(SessionState::Closed));
        }
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(make(reply))
            .map_err(|_| SessionError::InvalidState(SessionState::Closed))?;
        rx.await.map_err(|_| SessionError::Cancelled)?
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.status())
            .finish()
    }
}

struct Connecting {
    reply: Reply<Option<Resumption>>,
    marker: Option<Marker>,
    awaiting_auth: bool,
    awaiting_restore: bool,
    resumption: Option<Resumption>,
    _watchdog: TaskGuard,
}

struct ActiveTransport {
    transport: Arc<dyn PeerTransport>,
    epoch: u64,
    _pump: TaskGuard,
}

struct ControlSub {
    channel: Arc<dyn SubChannel>,
    attempt: u64,
    _pump: TaskGuard,
}

struct PendingOpen {
    reply: Reply<Channel>,
    generation: u64,
    _timeout: TaskGuard,
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Awaiting,
    Bound { channel_id: ChannelId, generation: u64 },
}

struct Inbound {
    channel: Arc<dyn SubChannel>,
    binding: Binding,
    _pump: TaskGuard,
}

struct Actor {
    config: SessionConfig,
    prerequisites: Prerequisites,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<Event>,
    control: ControlLink<Responder>,
    state: SessionState,
    state_tx: watch::Sender<StateChange>,
    changes: broadcast::Sender<StateChange>,
    attempt: u64,
    connecting: Option<Connecting>,
    epoch: u64,
    transport: Option<ActiveTransport>,
    control_sub: Option<ControlSub>,
    generation: u64,
    channels: HashMap<ChannelId, Channel>,
    pending_opens: HashMap<MessageId, PendingOpen>,
    inbound: HashMap<u64, Inbound>,
    next_key: u64,
    last_marker: Arc<Mutex<Option<Marker>>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut retries: mpsc::UnboundedReceiver<MessageId>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                Some(id) = retries.recv() => {
                    if let Some(resolved) = self.control.on_retry(id) {
                        self.route(resolved);
                    }
                }
            }
        }
        tracing::debug!("session actor stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect {
                marker,
                reuse,
                reply,
            } => self.start_attempt(marker, reuse, reply),
            Command::Disconnect { reply } => self.disconnect(reply),
            Command::OpenChannel {
                target,
                parent,
                size,
                reply,
            } => self.open_channel(target, parent, size, reply),
            Command::Request { command, reply } => self.request(command, reply),
            Command::CloseChannel { id, key } => self.close_channel(id, key),
            Command::Close => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { attempt, result } => self.on_opened(attempt, result),
            Event::Transport { epoch, event } => self.on_transport(epoch, event),
            Event::Control { attempt, event } => self.on_control(attempt, event),
            Event::Inbound { key, event } => self.on_inbound_event(key, event),
            Event::Watchdog { attempt } => {
                if self.is_connecting(attempt) {
                    tracing::warn!(attempt, "connect attempt timed out");
                    self.fail(SessionError::Timeout);
                }
            }
            Event::OpenTimeout {
                message_id,
                generation,
            } => {
                let expired = self
                    .pending_opens
                    .get(&message_id)
                    .is_some_and(|open| open.generation == generation);
                if let Some(open) = expired.then(|| self.pending_opens.remove(&message_id)).flatten() {
                    tracing::warn!(message_id, "channel open timed out");
                    let _ = open.reply.send(Err(SessionError::Timeout));
                }
            }
        }
    }

    fn is_connecting(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.connecting.is_some()
    }

    fn set_state(&mut self, state: SessionState, reason: Option<FailureReason>) {
        self.state = state;
        let change = StateChange::new(state, reason);
        tracing::info!(%change, "session state changed");
        self.state_tx.send_replace(change);
        let _ = self.changes.send(change);
    }

    // Connect

    fn start_attempt(&mut self, marker: Option<Marker>, reuse: bool, reply: Reply<Option<Resumption>>) {
        if !self.state.can_reconnect() {
            let _ = reply.send(Err(SessionError::InvalidState(self.state)));
            return;
        }
        self.attempt += 1;
        let attempt = self.attempt;
        tracing::info!(attempt, ?marker, reuse, "connecting");

        self.drop_control();
        let watchdog = tasks::after(
            self.config.net.connect_timeout(),
            &self.events,
            Event::Watchdog { attempt },
        );
        self.connecting = Some(Connecting {
            reply,
            marker,
            awaiting_auth: false,
            awaiting_restore: false,
            resumption: None,
            _watchdog: watchdog,
        });
        self.set_state(SessionState::Connecting, None);

        let reusable = reuse
            && self
                .transport
                .as_ref()
                .is_some_and(|t| t.transport.state() == TransportState::Connected);
        if reusable {
            tracing::debug!(attempt, "reusing connected transport");
            self.open_control();
            return;
        }

        self.drop_transport();
        let prerequisites = self.prerequisites.clone();
        let events = self.events.clone();
        tokio::spawn(
            async move {
                let result = prerequisites.open().await;
                let _ = events.send(Event::Opened { attempt, result });
            }
            .in_current_span(),
        );
    }

    fn on_opened(&mut self, attempt: u64, result: Result<TransportLink, SessionError>) {
        if !self.is_connecting(attempt) {
            if let Ok(link) = result {
                tracing::debug!(attempt, "closing transport of abandoned attempt");
                link.transport.close();
            }
            return;
        }
        match result {
            Ok(link) => {
                self.epoch += 1;
                let epoch = self.epoch;
                let pump = tasks::forward(link.events, &self.events, move |event| Event::Transport {
                    epoch,
                    event,
                });
                self.transport = Some(ActiveTransport {
                    transport: link.transport,
                    epoch,
                    _pump: pump,
                });
                self.open_control();
            }
            Err(error) => self.fail(error),
        }
    }

    fn open_control(&mut self) {
        let Some(active) = &self.transport else {
            self.fail(SessionError::TransportLost);
            return;
        };
        match active.transport.create_sub_channel(&self.config.control_label) {
            Ok(SubChannelLink { channel, events }) => {
                let attempt = self.attempt;
                let pump = tasks::forward(events, &self.events, move |event| Event::Control {
                    attempt,
                    event,
                });
                let open = channel.ready_state() == ReadyState::Open;
                self.control_sub = Some(ControlSub {
                    channel,
                    attempt,
                    _pump: pump,
                });
                if open {
                    self.on_control_open();
                }
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_control(&mut self, attempt: u64, event: SubChannelEvent) {
        if self.control_sub.as_ref().is_none_or(|c| c.attempt != attempt) {
            return;
        }
        match event {
            SubChannelEvent::Open => self.on_control_open(),
            SubChannelEvent::Message(raw) => match ReplyFrame::decode(&raw) {
                Ok(frame) => {
                    if let Some(resolved) = self.control.on_reply(frame) {
                        self.route(resolved);
                    }
                }
                Err(e) => tracing::warn!("malformed control reply: {e}"),
            },
            SubChannelEvent::Close => {
                tracing::warn!(attempt, "control sub-channel closed");
                self.drop_control();
                match self.state {
                    SessionState::Connected => {
                        self.detach_channels();
                        self.set_state(SessionState::Disconnected, Some(FailureReason::DataChannelLost));
                    }
                    SessionState::Connecting => self.fail(SessionError::DataChannelLost),
                    _ => {}
                }
            }
        }
    }

    fn on_control_open(&mut self) {
        let Some(sub) = self.control_sub.as_ref().map(|c| Arc::clone(&c.channel)) else {
            return;
        };
        if self.control.is_open() {
            return;
        }
        let attempt = self.attempt;
        tracing::debug!(attempt, "control sub-channel open");

        let token = self.config.auth_token.clone();
        let mut marker = None;
        if let Some(connecting) = &mut self.connecting {
            marker = connecting.marker;
            connecting.awaiting_restore = marker.is_some();
            connecting.awaiting_auth = token.is_some();
        }

        let mut failed = Vec::new();
        if let Some(marker) = marker {
            if let Err(resolved) = self
                .control
                .send_urgent(ControlCommand::Restore { marker }, Responder::Restore { attempt })
            {
                failed.push(resolved);
            }
        }
        if let Some(token) = token {
            let fingerprint = self.prerequisites.identity.as_ref().map(|i| i.fingerprint());
            if let Err(resolved) = self.control.send_urgent(
                ControlCommand::Auth { token, fingerprint },
                Responder::Auth { attempt },
            ) {
                failed.push(resolved);
            }
        }
        failed.extend(self.control.attach(sub));
        for resolved in failed {
            self.route(resolved);
        }
        self.check_connected();
    }

    fn check_connected(&mut self) {
        let ready = self.control.is_open()
            && self
                .connecting
                .as_ref()
                .is_some_and(|c| !c.awaiting_auth && !c.awaiting_restore);
        if !ready {
            return;
        }
        if let Some(connecting) = self.connecting.take() {
            self.set_state(SessionState::Connected, None);
            let _ = connecting.reply.send(Ok(connecting.resumption));
        }
    }

    // Control replies

    fn route(&mut self, resolved: Resolved<Responder>) {
        let Resolved {
            id,
            responder,
            outcome,
            ..
        } = resolved;
        match responder {
            Responder::Reply(reply) => {
                let _ = reply.send(outcome);
            }
            Responder::Mark(reply) => self.on_mark(reply, outcome),
            Responder::Auth { attempt } => self.on_auth(attempt, outcome),
            Responder::Restore { attempt } => self.on_restore(attempt, outcome),
            Responder::FreshLayout { attempt } => self.on_fresh_layout(attempt, outcome),
            Responder::OpenChannel => self.on_open_reply(id, outcome),
        }
    }

    fn on_auth(&mut self, attempt: u64, outcome: Result<Value, SessionError>) {
        if !self.is_connecting(attempt) {
            return;
        }
        match outcome {
            Ok(_) => {
                tracing::debug!(attempt, "authenticated");
                if let Some(connecting) = &mut self.connecting {
                    connecting.awaiting_auth = false;
                }
                self.check_connected();
            }
            Err(SessionError::Rejected { body, .. }) => {
                self.fail(SessionError::Unauthorized(body_text(body)));
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_restore(&mut self, attempt: u64, outcome: Result<Value, SessionError>) {
        if !self.is_connecting(attempt) {
            return;
        }
        match outcome {
            Ok(body) => {
                tracing::info!(attempt, "session restored");
                *self.last_marker.lock() = None;
                if let Some(connecting) = &mut self.connecting {
                    connecting.resumption = Some(Resumption::Restored(body_text(body)));
                    connecting.awaiting_restore = false;
                }
                self.check_connected();
            }
            Err(SessionError::Rejected { .. }) => {
                tracing::info!(attempt, "marker refused, fetching fresh layout");
                *self.last_marker.lock() = None;
                if let Err(resolved) = self
                    .control
                    .send(ControlCommand::GetPayload, Responder::FreshLayout { attempt })
                {
                    self.route(resolved);
                }
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_fresh_layout(&mut self, attempt: u64, outcome: Result<Value, SessionError>) {
        if !self.is_connecting(attempt) {
            return;
        }
        match outcome {
            Ok(body) => {
                if let Some(connecting) = &mut self.connecting {
                    connecting.resumption = Some(Resumption::Fresh(body_text(body)));
                    connecting.awaiting_restore = false;
                }
                self.check_connected();
            }
            Err(error) => self.fail(error),
        }
    }

    // Disengage

    fn disconnect(&mut self, reply: Reply<Marker>) {
        if self.state != SessionState::Connected || !self.control.is_open() {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }
        if let Err(resolved) = self.control.send(ControlCommand::Mark, Responder::Mark(reply)) {
            self.route(resolved);
        }
    }

    fn on_mark(&mut self, reply: Reply<Marker>, outcome: Result<Value, SessionError>) {
        let marker = match outcome.and_then(|body| parse_marker(&body)) {
            Ok(marker) => marker,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        tracing::info!(marker, generation = self.generation + 1, "disengaging");
        *self.last_marker.lock() = Some(marker);
        self.generation += 1;
        self.attempt += 1;

        for (_, channel) in self.channels.drain() {
            channel.finish(CloseReason::Disengaged);
        }
        for (_, inbound) in self.inbound.drain() {
            inbound.channel.close();
        }
        self.reject_opens(&SessionError::Cancelled);
        for resolved in self.control.fail_all(&SessionError::Cancelled) {
            self.route(resolved);
        }
        self.drop_control();
        self.drop_transport();
        self.set_state(SessionState::Disconnected, None);
        let _ = reply.send(Ok(marker));
    }

    // Channels

    fn open_channel(
        &mut self,
        target: ChannelTarget,
        parent: Option<ChannelId>,
        size: Option<PaneSize>,
        reply: Reply<Channel>,
    ) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }
        let cols = size.map(|s| s.cols);
        let rows = size.map(|s| s.rows);
        let command = match target {
            ChannelTarget::New(line) => match shlex::split(&line) {
                Some(argv) if !argv.is_empty() => ControlCommand::AddPane {
                    command: argv,
                    parent,
                    cols,
                    rows,
                },
                _ => {
                    let _ = reply.send(Err(SessionError::NotSupported(format!(
                        "cannot parse command line {line:?}"
                    ))));
                    return;
                }
            },
            ChannelTarget::Existing(id) => ControlCommand::ReconnectPane { id, cols, rows },
        };

        match self.control.send(command, Responder::OpenChannel) {
            Ok(message_id) => {
                let generation = self.generation;
                let timeout = tasks::after(
                    self.config.net.timeout(),
                    &self.events,
                    Event::OpenTimeout {
                        message_id,
                        generation,
                    },
                );
                self.pending_opens.insert(
                    message_id,
                    PendingOpen {
                        reply,
                        generation,
                        _timeout: timeout,
                    },
                );
            }
            Err(resolved) => {
                let _ = reply.send(Err(failure(resolved.outcome)));
            }
        }
    }

    fn on_open_reply(&mut self, message_id: MessageId, outcome: Result<Value, SessionError>) {
        match outcome {
            Ok(body) => tracing::debug!(message_id, %body, "channel open acknowledged"),
            Err(error) => {
                if let Some(open) = self.pending_opens.remove(&message_id) {
                    tracing::debug!(message_id, %error, "channel open failed");
                    let _ = open.reply.send(Err(error));
                }
            }
        }
    }

    fn request(&mut self, command: ControlCommand, reply: Reply<Value>) {
        if !matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }
        if let Err(resolved) = self.control.send(command, Responder::Reply(reply)) {
            self.route(resolved);
        }
    }

    fn close_channel(&mut self, id: ChannelId, key: u64) {
        if !self.channels.get(&id).is_some_and(|c| c.key() == key) {
            return;
        }
        if let Some(channel) = self.channels.remove(&id) {
            self.inbound.remove(&key);
            channel.finish(CloseReason::Requested);
        }
    }

    fn on_transport(&mut self, epoch: u64, event: TransportEvent) {
        if self.transport.as_ref().is_none_or(|t| t.epoch != epoch) {
            tracing::trace!(epoch, "dropping event from old transport");
            return;
        }
        match event {
            TransportEvent::SubChannel(link) => self.on_inbound(link),
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "transport state changed");
                match state {
                    TransportState::Disconnected if self.state == SessionState::Connected => {
                        self.detach_channels();
                        self.drop_control();
                        self.set_state(SessionState::Disconnected, Some(FailureReason::TransportLost));
                    }
                    TransportState::Failed | TransportState::Closed => {
                        if matches!(
                            self.state,
                            SessionState::Connecting | SessionState::Connected | SessionState::Disconnected
                        ) {
                            self.fail(SessionError::TransportLost);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn on_inbound(&mut self, link: SubChannelLink) {
        let key = self.next_key;
        self.next_key += 1;
        let SubChannelLink { channel, events } = link;
        tracing::debug!(key, label = channel.label(), "inbound sub-channel");
        let pump = tasks::forward(events, &self.events, move |event| Event::Inbound { key, event });
        let open = channel.ready_state() == ReadyState::Open;
        self.inbound.insert(
            key,
            Inbound {
                channel,
                binding: Binding::Awaiting,
                _pump: pump,
            },
        );
        if open {
            self.bind(key);
        }
    }

    fn on_inbound_event(&mut self, key: u64, event: SubChannelEvent) {
        let Some(binding) = self.inbound.get(&key).map(|i| i.binding) else {
            tracing::trace!(key, "event for released sub-channel");
            return;
        };
        match (event, binding) {
            (SubChannelEvent::Open, Binding::Awaiting) => self.bind(key),
            (SubChannelEvent::Open, Binding::Bound { .. }) => {}
            (SubChannelEvent::Message(_), Binding::Awaiting) => {
                tracing::debug!(key, "data before open dropped");
            }
            (
                SubChannelEvent::Message(data),
                Binding::Bound {
                    channel_id,
                    generation,
                },
            ) => {
                if generation != self.generation {
                    tracing::debug!(channel_id, generation, "discarding stale channel data");
                    return;
                }
                if let Some(channel) = self.channels.get(&channel_id).filter(|c| c.key() == key) {
                    channel.dispatch(ChannelEvent::Data(data));
                }
            }
            (SubChannelEvent::Close, binding) => {
                self.inbound.remove(&key);
                let Binding::Bound {
                    channel_id,
                    generation,
                } = binding
                else {
                    return;
                };
                let live = generation == self.generation
                    && self.channels.get(&channel_id).is_some_and(|c| c.key() == key);
                if let Some(channel) = live.then(|| self.channels.remove(&channel_id)).flatten() {
                    channel.finish(CloseReason::Remote);
                }
            }
        }
    }

    /// Correlate an open inbound sub-channel with its pending channel open.
    fn bind(&mut self, key: u64) {
        let Some(sub) = self.inbound.get(&key).map(|i| Arc::clone(&i.channel)) else {
            return;
        };
        let label = match sub.label().parse::<ChannelLabel>() {
            Ok(label) => label,
            Err(e) => {
                tracing::error!(label = sub.label(), "protocol desync: {e}");
                self.fail(SessionError::Internal(e.to_string()));
                return;
            }
        };
        let Some(open) = self.pending_opens.remove(&label.message_id) else {
            tracing::warn!(%label, "no pending open for sub-channel, closing it");
            self.inbound.remove(&key);
            sub.close();
            return;
        };
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let generation = self.generation;
        if open.generation != generation {
            self.inbound.remove(&key);
            sub.close();
            let _ = open.reply.send(Err(SessionError::Cancelled));
            return;
        }
        if let Some(inbound) = self.inbound.get_mut(&key) {
            inbound.binding = Binding::Bound {
                channel_id: label.channel_id,
                generation,
            };
        }
        let channel = Channel::new(label.channel_id, generation, key, sub, commands);
        if let Some(previous) = self.channels.insert(label.channel_id, channel.clone()) {
            tracing::debug!(channel_id = label.channel_id, "closing replaced channel");
            self.inbound.remove(&previous.key());
            previous.finish(CloseReason::Replaced);
        }
        tracing::info!(
            message_id = label.message_id,
            channel_id = label.channel_id,
            generation,
            "channel open"
        );
        let _ = open.reply.send(Ok(channel));
    }

    // Teardown

    fn reject_opens(&mut self, error: &SessionError) {
        for (_, open) in self.pending_opens.drain() {
            let _ = open.reply.send(Err(error.clone()));
        }
    }

    /// Mark every channel disconnected and release its sub-channel. The
    /// remote processes survive and can be reattached.
    fn detach_channels(&mut self) {
        for (_, channel) in self.channels.drain() {
            channel.detach();
        }
        for (_, inbound) in self.inbound.drain() {
            inbound.channel.close();
        }
    }

    fn drop_control(&mut self) {
        if let Some(control) = self.control_sub.take() {
            control.channel.close();
        }
        self.control.detach();
    }

    fn drop_transport(&mut self) {
        if let Some(active) = self.transport.take() {
            active.transport.close();
        }
    }

    /// Fail the current attempt or connection and tear everything down.
    fn fail(&mut self, error: SessionError) {
        tracing::warn!(attempt = self.attempt, %error, "session failed");
        let connecting = self.connecting.take();
        self.attempt += 1;
        for resolved in self.control.fail_all(&error) {
            self.route(resolved);
        }
        self.reject_opens(&error);
        self.detach_channels();
        self.drop_control();
        self.drop_transport();
        self.set_state(SessionState::Failed, Some(error.reason()));
        if let Some(connecting) = connecting {
            let _ = connecting.reply.send(Err(error));
        }
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        tracing::info!("closing session");
        self.attempt += 1;
        if let Some(connecting) = self.connecting.take() {
            let _ = connecting.reply.send(Err(SessionError::Cancelled));
        }
        for resolved in self.control.fail_all(&SessionError::Cancelled) {
            self.route(resolved);
        }
        self.reject_opens(&SessionError::Cancelled);
        for (_, channel) in self.channels.drain() {
            channel.finish(CloseReason::SessionClosed);
        }
        for (_, inbound) in self.inbound.drain() {
            inbound.channel.close();
        }
        self.drop_control();
        self.drop_transport();
        self.set_state(SessionState::Closed, None);
    }
}

fn failure(outcome: Result<Value, SessionError>) -> SessionError {
    outcome
        .err()
        .unwrap_or_else(|| SessionError::Internal("control message resolved without reply".to_string()))
}

/// Layouts and refusal reasons arrive as JSON strings; anything else is kept
/// in its JSON form.
fn body_text(body: Value) -> String {
    match body {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Markers are non-negative integers, possibly sent as decimal strings.
/// `-1` and other negatives mean the remote has no restore point.
fn parse_marker(body: &Value) -> Result<Marker, SessionError> {
    let marker = match body {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    marker.filter(|m| *m >= 0).ok_or_else(|| SessionError::BadMarker(body.to_string()))
}

//! Simulated remote host speaking the control protocol over [`memory`](crate::memory).
//!
//! Every pane is an echo process: bytes written to its channel come straight
//! back. Output produced while a pane has no open channel is buffered and
//! replayed when the pane is reattached.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use remote_panes_core::{ReadyState, SubChannel, config::DEFAULT_CONTROL_LABEL};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    memory::{MemoryRemote, MemorySubChannel, RemoteChannel, RemoteHandle, send_reply},
    protocol::{ChannelId, ChannelLabel, ControlCommand, Envelope, Marker, MessageId, ReplyFrame},
};

/// Host behaviour.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Token required by `auth`. `None` accepts any token.
    pub token: Option<String>,
    /// Layout returned by `get_payload` until a client stores one.
    pub layout: String,
    /// Label of the control sub-channel.
    pub control_label: String,
    /// Command kinds the host receives but never answers.
    pub silent: HashSet<&'static str>,
    /// Refuse every `restore`, as if the host restarted.
    pub reject_restore: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            token: None,
            layout: "{}".to_string(),
            control_label: DEFAULT_CONTROL_LABEL.to_string(),
            silent: HashSet::new(),
            reject_restore: false,
        }
    }
}

impl HostOptions {
    /// Never answer `kind`.
    #[must_use]
    pub fn silent(mut self, kind: &'static str) -> Self {
        self.silent.insert(kind);
        self
    }
}

struct Pane {
    command: Vec<String>,
    size: Option<(u16, u16)>,
    output: Option<Arc<MemorySubChannel>>,
    backlog: Vec<Bytes>,
}

impl Pane {
    fn emit(&mut self, data: Bytes) {
        if let Some(output) = &self.output {
            if output.ready_state() == ReadyState::Open && output.send(data.clone()).is_ok() {
                return;
            }
        }
        self.backlog.push(data);
    }

    fn attach(&mut self, output: Arc<MemorySubChannel>) {
        for data in self.backlog.drain(..) {
            if output.send(data).is_err() {
                break;
            }
        }
        self.output = Some(output);
    }
}

#[derive(Default)]
struct HostState {
    next_channel: ChannelId,
    next_marker: Marker,
    markers: HashSet<Marker>,
    layout: String,
    panes: HashMap<ChannelId, Pane>,
    received: Vec<&'static str>,
}

/// A simulated remote host.
pub struct LoopbackHost {
    state: Arc<Mutex<HostState>>,
    task: JoinHandle<()>,
}

impl LoopbackHost {
    /// Serve every remote produced by a memory transport factory.
    #[must_use]
    pub fn spawn(mut remotes: mpsc::UnboundedReceiver<MemoryRemote>, options: HostOptions) -> Self {
        let state = Arc::new(Mutex::new(HostState {
            next_channel: 1,
            next_marker: 1,
            layout: options.layout.clone(),
            ..HostState::default()
        }));
        let options = Arc::new(options);

        let host_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Some(remote) = remotes.recv().await {
                tokio::spawn(serve_peer(
                    remote,
                    Arc::clone(&host_state),
                    Arc::clone(&options),
                ));
            }
        });

        Self { state, task }
    }

    /// Write process output into a pane.
    ///
    /// Returns false if the pane does not exist.
    pub fn write(&self, id: ChannelId, data: impl Into<Bytes>) -> bool {
        let mut state = self.state.lock();
        state.panes.get_mut(&id).is_some_and(|pane| {
            pane.emit(data.into());
            true
        })
    }

    /// Ids of live panes, sorted.
    #[must_use]
    pub fn panes(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.state.lock().panes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Command and last known size of a pane.
    #[must_use]
    pub fn pane(&self, id: ChannelId) -> Option<(Vec<String>, Option<(u16, u16)>)> {
        self.state
            .lock()
            .panes
            .get(&id)
            .map(|pane| (pane.command.clone(), pane.size))
    }

    /// Kinds of every command received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<&'static str> {
        self.state.lock().received.clone()
    }

    /// Current stored layout.
    #[must_use]
    pub fn layout(&self) -> String {
        self.state.lock().layout.clone()
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_peer(mut remote: MemoryRemote, state: Arc<Mutex<HostState>>, options: Arc<HostOptions>) {
    let peer = remote.handle();
    while let Some(channel) = remote.accept_channel().await {
        if channel.label() == options.control_label {
            channel.accept();
            tokio::spawn(serve_control(
                channel,
                peer.clone(),
                Arc::clone(&state),
                Arc::clone(&options),
            ));
        } else {
            tracing::warn!(label = channel.label(), "host refusing client-initiated channel");
            channel.close();
        }
    }
}

async fn serve_control(
    mut control: RemoteChannel,
    peer: RemoteHandle,
    state: Arc<Mutex<HostState>>,
    options: Arc<HostOptions>,
) {
    let responder = control.handle();
    while let Some(raw) = control.recv().await {
        let envelope = match Envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("host dropping malformed control frame: {e}");
                continue;
            }
        };
        let kind = envelope.command.kind();
        state.lock().received.push(kind);
        if options.silent.contains(kind) {
            tracing::debug!(message_id = envelope.message_id, kind, "host ignoring command");
            continue;
        }
        handle_command(envelope, &responder, &peer, &state, &options);
    }
}

fn handle_command(
    envelope: Envelope,
    responder: &MemorySubChannel,
    peer: &RemoteHandle,
    state: &Arc<Mutex<HostState>>,
    options: &HostOptions,
) {
    let Envelope {
        message_id,
        command,
        ..
    } = envelope;
    let reply = |frame: ReplyFrame| {
        if let Err(e) = send_reply(responder, &frame) {
            tracing::debug!(message_id, "host reply lost: {e}");
        }
    };

    match command {
        ControlCommand::Auth { token, .. } => {
            let accepted = options.token.as_ref().is_none_or(|expected| *expected == token);
            if accepted {
                reply(ReplyFrame::ack(message_id, Value::Null));
            } else {
                reply(ReplyFrame::nack(message_id, "unauthorized"));
            }
        }
        ControlCommand::AddPane {
            command,
            cols,
            rows,
            ..
        } => {
            let id = {
                let mut guard = state.lock();
                let id = guard.next_channel;
                guard.next_channel += 1;
                guard.panes.insert(
                    id,
                    Pane {
                        command,
                        size: cols.zip(rows),
                        output: None,
                        backlog: Vec::new(),
                    },
                );
                id
            };
            reply(ReplyFrame::ack(message_id, id));
            open_pane_channel(message_id, id, peer, state);
        }
        ControlCommand::ReconnectPane { id, cols, rows } => {
            let known = {
                let mut guard = state.lock();
                guard.panes.get_mut(&id).is_some_and(|pane| {
                    if let Some(size) = cols.zip(rows) {
                        pane.size = Some(size);
                    }
                    true
                })
            };
            if known {
                reply(ReplyFrame::ack(message_id, id));
                open_pane_channel(message_id, id, peer, state);
            } else {
                reply(ReplyFrame::nack(message_id, format!("no pane {id}")));
            }
        }
        ControlCommand::Resize { id, cols, rows } => {
            let known = state.lock().panes.get_mut(&id).is_some_and(|pane| {
                pane.size = Some((cols, rows));
                true
            });
            if known {
                reply(ReplyFrame::ack(message_id, Value::Null));
            } else {
                reply(ReplyFrame::nack(message_id, format!("no pane {id}")));
            }
        }
        ControlCommand::GetPayload => {
            let layout = state.lock().layout.clone();
            reply(ReplyFrame::ack(message_id, layout));
        }
        ControlCommand::SetPayload { payload } => {
            state.lock().layout = payload;
            reply(ReplyFrame::ack(message_id, Value::Null));
        }
        ControlCommand::Mark => {
            let marker = {
                let mut guard = state.lock();
                let marker = guard.next_marker;
                guard.next_marker += 1;
                guard.markers.insert(marker);
                for pane in guard.panes.values_mut() {
                    pane.output = None;
                }
                marker
            };
            reply(ReplyFrame::ack(message_id, marker));
        }
        ControlCommand::Restore { marker } => {
            let layout = {
                let mut guard = state.lock();
                (!options.reject_restore && guard.markers.remove(&marker))
                    .then(|| guard.layout.clone())
            };
            match layout {
                Some(layout) => reply(ReplyFrame::ack(message_id, layout)),
                None => reply(ReplyFrame::nack(message_id, "bad marker")),
            }
        }
    }
}

fn open_pane_channel(
    message_id: MessageId,
    id: ChannelId,
    peer: &RemoteHandle,
    state: &Arc<Mutex<HostState>>,
) {
    let label = ChannelLabel::new(message_id, id).to_string();
    let channel = match peer.open_channel(&label) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(%label, "host could not open pane channel: {e}");
            return;
        }
    };
    let output = channel.handle();
    if let Some(pane) = state.lock().panes.get_mut(&id) {
        pane.attach(Arc::clone(&output));
    }
    tokio::spawn(echo(channel, id, output, Arc::clone(state)));
}

async fn echo(
    mut channel: RemoteChannel,
    id: ChannelId,
    output: Arc<MemorySubChannel>,
    state: Arc<Mutex<HostState>>,
) {
    while let Some(data) = channel.recv().await {
        if let Some(pane) = state.lock().panes.get_mut(&id) {
            pane.emit(data);
        }
    }
    let mut guard = state.lock();
    if let Some(pane) = guard.panes.get_mut(&id) {
        if pane.output.as_ref().is_some_and(|o| Arc::ptr_eq(o, &output)) {
            pane.output = None;
        }
    }
}

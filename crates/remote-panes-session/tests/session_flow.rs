//! Session scenarios against a scripted remote.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use remote_panes_core::{
    Certificate, FailureReason, IceServer, IceServerSource, IdentityProvider, ReadyState,
    SessionConfig, SessionState, StateChange, SubChannelEvent, TransportError, TransportState,
};
use remote_panes_session::{
    Channel, ChannelEvent, ChannelTarget, CloseReason, PaneSize, Resumption, Session, SessionError,
};
use remote_panes_transport::{
    ControlCommand, Envelope, MemoryRemote, MemoryTransportFactory, RemoteChannel, ReplyFrame,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_test::assert_err;

fn config(timeout_ms: u64) -> SessionConfig {
    SessionConfig::default().with_net(Duration::from_millis(timeout_ms), 3)
}

/// Let every task run until idle. Time is paused, so this only advances the
/// clock once nothing else can make progress.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

struct Fixture {
    session: Session,
    factory: Arc<MemoryTransportFactory>,
    remotes: mpsc::UnboundedReceiver<MemoryRemote>,
}

impl Fixture {
    fn new(config: SessionConfig) -> Self {
        let (factory, remotes) = MemoryTransportFactory::new();
        let factory = Arc::new(factory);
        let session = Session::builder(factory.clone()).config(config).build();
        Self {
            session,
            factory,
            remotes,
        }
    }

    /// Connect with the remote accepting the control channel straight away.
    async fn connected(config: SessionConfig) -> (Self, MemoryRemote, RemoteChannel) {
        let mut fx = Self::new(config);
        let session = fx.session.clone();
        let connecting = tokio::spawn(async move { session.connect(None).await });
        let (remote, control) = fx.accept().await;
        assert_eq!(connecting.await.unwrap(), Ok(None));
        (fx, remote, control)
    }

    async fn accept(&mut self) -> (MemoryRemote, RemoteChannel) {
        let mut remote = self.remotes.recv().await.unwrap();
        let control = remote.accept_channel().await.unwrap();
        assert_eq!(control.label(), "%");
        control.accept();
        (remote, control)
    }

    fn open(&self, command: &str) -> JoinHandle<Result<Channel, SessionError>> {
        let session = self.session.clone();
        let target = ChannelTarget::New(command.to_string());
        tokio::spawn(async move { session.open_channel(target, None, None).await })
    }
}

async fn next_request(control: &mut RemoteChannel) -> Envelope {
    Envelope::decode(&control.recv().await.unwrap()).unwrap()
}

fn status(state: SessionState, reason: Option<FailureReason>) -> StateChange {
    StateChange::new(state, reason)
}

#[tokio::test(start_paused = true)]
async fn test_open_channel_end_to_end() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    assert_eq!(fx.session.state(), SessionState::Connected);

    for expected in 1..=2 {
        let session = fx.session.clone();
        let payload = tokio::spawn(async move { session.get_payload().await });
        let request = next_request(&mut control).await;
        assert_eq!(request.message_id, expected);
        assert_eq!(request.command, ControlCommand::GetPayload);
        control.reply(&ReplyFrame::ack(expected, "{}")).unwrap();
        assert_eq!(payload.await.unwrap(), Ok("{}".to_string()));
    }

    let session = fx.session.clone();
    let opening = tokio::spawn(async move {
        let size = PaneSize { cols: 80, rows: 24 };
        session
            .open_channel(ChannelTarget::New("bash -l".into()), None, Some(size))
            .await
    });
    let request = next_request(&mut control).await;
    assert_eq!(request.message_id, 3);
    assert_eq!(
        request.command,
        ControlCommand::AddPane {
            command: vec!["bash".into(), "-l".into()],
            parent: None,
            cols: Some(80),
            rows: Some(24),
        }
    );
    control.reply(&ReplyFrame::ack(3, 7)).unwrap();
    let mut pane = remote.open_channel("3:7").unwrap();

    let channel = opening.await.unwrap().unwrap();
    assert_eq!(channel.id(), 7);
    assert_eq!(channel.ready_state(), ReadyState::Open);

    let mut events = channel.subscribe();
    pane.send("hello").unwrap();
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Data(Bytes::from_static(b"hello")))
    );
    channel.send("ls\n").unwrap();
    assert_eq!(pane.recv().await.unwrap(), Bytes::from_static(b"ls\n"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_opens_correlate_out_of_order() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;

    let first = fx.open("vim");
    let first_id = next_request(&mut control).await.message_id;
    let second = fx.open("htop");
    let second_id = next_request(&mut control).await.message_id;

    let _late = remote.open_channel(&format!("{second_id}:20")).unwrap();
    let _early = remote.open_channel(&format!("{first_id}:10")).unwrap();
    control.reply(&ReplyFrame::ack(second_id, 20)).unwrap();
    control.reply(&ReplyFrame::ack(first_id, 10)).unwrap();

    assert_eq!(first.await.unwrap().unwrap().id(), 10);
    assert_eq!(second.await.unwrap().unwrap().id(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flush_after_auth_and_restore() {
    let mut fx = Fixture::new(SessionConfig::default().with_auth_token("secret"));
    let session = fx.session.clone();
    let connecting = tokio::spawn(async move { session.connect(Some(42)).await });

    let mut remote = fx.remotes.recv().await.unwrap();
    let opening = fx.open("bash");
    settle().await;
    let mut control = remote.accept_channel().await.unwrap();
    control.accept();

    let kinds: Vec<_> = [
        next_request(&mut control).await,
        next_request(&mut control).await,
        next_request(&mut control).await,
    ]
    .into_iter()
    .map(|envelope| (envelope.message_id, envelope.command.kind()))
    .collect();
    assert_eq!(kinds, vec![(3, "auth"), (2, "restore"), (1, "add_pane")]);

    control.reply(&ReplyFrame::ack(3, serde_json::Value::Null)).unwrap();
    settle().await;
    assert_eq!(fx.session.state(), SessionState::Connecting);
    control.reply(&ReplyFrame::ack(2, "{\"panes\":[5]}")).unwrap();
    assert_eq!(
        connecting.await.unwrap(),
        Ok(Some(Resumption::Restored("{\"panes\":[5]}".into())))
    );

    let _pane = remote.open_channel("1:5").unwrap();
    assert_eq!(opening.await.unwrap().unwrap().id(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_bad_label_fails_session() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let mut changes = fx.session.state_changes();

    let opening = fx.open("bash");
    next_request(&mut control).await;
    let _bogus = remote.open_channel("pane-seven").unwrap();

    let error = assert_err!(opening.await.unwrap());
    assert!(matches!(error, SessionError::Internal(_)));
    assert_eq!(
        changes.recv().await.unwrap(),
        status(SessionState::Failed, Some(FailureReason::InternalError))
    );
    assert!(remote.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_channel_is_closed() {
    let (fx, remote, _control) = Fixture::connected(SessionConfig::default()).await;

    let mut stray = remote.open_channel("9:99").unwrap();
    assert!(stray.recv().await.is_none());
    assert_eq!(stray.ready_state(), ReadyState::Closed);
    assert_eq!(fx.session.status(), status(SessionState::Connected, None));
}

#[tokio::test(start_paused = true)]
async fn test_channel_open_times_out() {
    let (fx, _remote, mut control) = Fixture::connected(config(1000)).await;

    let start = Instant::now();
    let opening = fx.open("bash");
    next_request(&mut control).await;

    assert_eq!(opening.await.unwrap().unwrap_err(), SessionError::Timeout);
    assert_eq!(start.elapsed(), Duration::from_millis(1000));
    assert_eq!(fx.session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_add_pane_nack_rejects_open() {
    let (fx, _remote, mut control) = Fixture::connected(SessionConfig::default()).await;

    let opening = fx.open("no-such-binary");
    let request = next_request(&mut control).await;
    control
        .reply(&ReplyFrame::nack(request.message_id, "spawn failed"))
        .unwrap();

    assert_eq!(
        opening.await.unwrap().unwrap_err(),
        SessionError::Rejected {
            command: "add_pane",
            body: "spawn failed".into(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhaust_after_three_transmissions() {
    let (fx, _remote, mut control) = Fixture::connected(config(1000)).await;

    let start = Instant::now();
    let session = fx.session.clone();
    let payload = tokio::spawn(async move { session.get_payload().await });

    assert_eq!(payload.await.unwrap(), Err(SessionError::Timeout));
    assert_eq!(start.elapsed(), Duration::from_millis(3000));

    let mut sent = Vec::new();
    while let Some(raw) = control.try_recv() {
        sent.push(raw);
    }
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|raw| raw == &sent[0]));
    assert_eq!(fx.session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stores_marker_and_ignores_stale_events() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;

    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let pane = remote.open_channel(&format!("{open_id}:5")).unwrap();
    let channel = opening.await.unwrap().unwrap();
    let mut events = channel.subscribe();

    let session = fx.session.clone();
    let disconnecting = tokio::spawn(async move { session.disconnect().await });
    let request = next_request(&mut control).await;
    assert_eq!(request.command, ControlCommand::Mark);
    control.reply(&ReplyFrame::ack(request.message_id, "42")).unwrap();

    assert_eq!(disconnecting.await.unwrap(), Ok(42));
    assert_eq!(fx.session.last_marker(), Some(42));
    assert_eq!(fx.session.status(), status(SessionState::Disconnected, None));
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Closed {
            reason: CloseReason::Disengaged
        })
    );
    assert_eq!(channel.ready_state(), ReadyState::Closed);
    assert!(remote.is_closed());

    pane.inject(SubChannelEvent::Message(Bytes::from_static(b"stale")));
    pane.inject(SubChannelEvent::Close);
    settle().await;
    assert_eq!(events.try_recv(), None);
    assert_eq!(fx.session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_requires_control_channel() {
    let mut fx = Fixture::new(SessionConfig::default());
    assert_eq!(fx.session.disconnect().await, Err(SessionError::NotConnected));

    let session = fx.session.clone();
    let _connecting = tokio::spawn(async move { session.connect(None).await });
    let mut remote = fx.remotes.recv().await.unwrap();
    let _control = remote.accept_channel().await.unwrap();
    assert_eq!(fx.session.state(), SessionState::Connecting);
    assert_eq!(fx.session.disconnect().await, Err(SessionError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_unusable_marker_keeps_session_connected() {
    let (fx, _remote, mut control) = Fixture::connected(SessionConfig::default()).await;

    let session = fx.session.clone();
    let disconnecting = tokio::spawn(async move { session.disconnect().await });
    let request = next_request(&mut control).await;
    control
        .reply(&ReplyFrame::ack(request.message_id, "tomorrow"))
        .unwrap();

    let error = assert_err!(disconnecting.await.unwrap());
    assert!(matches!(error, SessionError::BadMarker(_)));
    assert_eq!(fx.session.state(), SessionState::Connected);
    assert_eq!(fx.session.last_marker(), None);
}

#[tokio::test(start_paused = true)]
async fn test_refused_restore_falls_back_to_fresh_layout() {
    let mut fx = Fixture::new(SessionConfig::default());
    let session = fx.session.clone();
    let connecting = tokio::spawn(async move { session.reconnect(Some(42)).await });
    let (_remote, mut control) = fx.accept().await;

    let restore = next_request(&mut control).await;
    assert_eq!(restore.command, ControlCommand::Restore { marker: 42 });
    control
        .reply(&ReplyFrame::nack(restore.message_id, "unknown marker"))
        .unwrap();

    let fetch = next_request(&mut control).await;
    assert_eq!(fetch.command, ControlCommand::GetPayload);
    control
        .reply(&ReplyFrame::ack(fetch.message_id, "{\"panes\":[]}"))
        .unwrap();

    assert_eq!(
        connecting.await.unwrap(),
        Ok(Some(Resumption::Fresh("{\"panes\":[]}".into())))
    );
    assert_eq!(fx.session.state(), SessionState::Connected);
    assert!(control.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fails_stalled_attempt() {
    let mut fx = Fixture::new(config(1000));
    let start = Instant::now();
    let session = fx.session.clone();
    let connecting = tokio::spawn(async move { session.connect(None).await });
    let mut remote = fx.remotes.recv().await.unwrap();
    let _control = remote.accept_channel().await.unwrap();

    assert_eq!(connecting.await.unwrap(), Err(SessionError::Timeout));
    assert_eq!(start.elapsed(), Duration::from_millis(1000));
    assert_eq!(
        fx.session.status(),
        status(SessionState::Failed, Some(FailureReason::Timeout))
    );
    assert!(remote.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let _pane = remote.open_channel(&format!("{open_id}:1")).unwrap();
    let channel = opening.await.unwrap().unwrap();
    let mut events = channel.subscribe();

    let session = fx.session.clone();
    let payload = tokio::spawn(async move { session.get_payload().await });
    next_request(&mut control).await;

    let mut changes = fx.session.state_changes();
    fx.session.close();
    fx.session.close();

    assert_eq!(payload.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Closed {
            reason: CloseReason::SessionClosed
        })
    );
    assert_eq!(changes.recv().await.unwrap(), status(SessionState::Closed, None));
    settle().await;
    assert!(changes.try_recv().is_err());
    assert!(remote.is_closed());
    assert_eq!(
        fx.session.connect(None).await,
        Err(SessionError::InvalidState(SessionState::Closed))
    );
}

#[tokio::test(start_paused = true)]
async fn test_auth_refusal_is_unauthorized() {
    let mut fx = Fixture::new(SessionConfig::default().with_auth_token("guess"));
    let session = fx.session.clone();
    let connecting = tokio::spawn(async move { session.connect(None).await });
    let (_remote, mut control) = fx.accept().await;

    let auth = next_request(&mut control).await;
    assert_eq!(
        auth.command,
        ControlCommand::Auth {
            token: "guess".into(),
            fingerprint: None,
        }
    );
    control.reply(&ReplyFrame::nack(auth.message_id, "denied")).unwrap();

    assert_eq!(
        connecting.await.unwrap(),
        Err(SessionError::Unauthorized("denied".into()))
    );
    assert_eq!(
        fx.session.status(),
        status(SessionState::Failed, Some(FailureReason::Unauthorized))
    );
}

struct OfflineIce;

#[async_trait]
impl IceServerSource for OfflineIce {
    async fn ice_servers(&self) -> Result<Vec<IceServer>, TransportError> {
        Err(TransportError::IceServers("offline".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_prerequisite_failure() {
    let (factory, _remotes) = MemoryTransportFactory::new();
    let factory = Arc::new(factory);
    let session = Session::builder(factory.clone())
        .ice_servers(Arc::new(OfflineIce))
        .build();

    let error = assert_err!(session.connect(None).await);
    assert!(matches!(error, SessionError::Prerequisite(_)));
    assert_eq!(
        session.status(),
        status(SessionState::Failed, Some(FailureReason::Prerequisite))
    );
    assert_eq!(factory.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_then_reconnect() {
    let mut fx = Fixture::new(SessionConfig::default());
    fx.factory
        .fail_next(TransportError::Negotiation("answer rejected".into()));

    let error = assert_err!(fx.session.connect(None).await);
    assert!(matches!(error, SessionError::BadRemoteDescription(_)));
    assert_eq!(
        fx.session.status(),
        status(SessionState::Failed, Some(FailureReason::BadRemoteDescription))
    );

    let session = fx.session.clone();
    let reconnecting = tokio::spawn(async move { session.reconnect(None).await });
    let _link = fx.accept().await;
    assert_eq!(reconnecting.await.unwrap(), Ok(None));
    assert_eq!(fx.factory.opened(), 2);
}

struct FixedIdentity;

#[async_trait]
impl IdentityProvider for FixedIdentity {
    fn fingerprint(&self) -> String {
        "sha-256 AB:CD".to_string()
    }

    async fn certificate(&self) -> Result<Certificate, TransportError> {
        Ok(Certificate {
            der: vec![0x30, 0x82],
            private_key: vec![1],
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_identity_reaches_transport_and_auth() {
    let (factory, mut remotes) = MemoryTransportFactory::new();
    let session = Session::builder(Arc::new(factory))
        .config(SessionConfig::default().with_auth_token("t"))
        .ice_servers(Arc::new(vec![IceServer::new("stun:stun.example.org")]))
        .identity(Arc::new(FixedIdentity))
        .build();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect(None).await }
    });

    let mut remote = remotes.recv().await.unwrap();
    let params = remote.params().clone();
    assert_eq!(params.fingerprint.as_deref(), Some("sha-256 AB:CD"));
    assert_eq!(params.ice_servers.len(), 1);
    assert!(params.certificate.is_some());

    let mut control = remote.accept_channel().await.unwrap();
    control.accept();
    let auth = next_request(&mut control).await;
    assert_eq!(
        auth.command,
        ControlCommand::Auth {
            token: "t".into(),
            fingerprint: Some("sha-256 AB:CD".into()),
        }
    );
    control.reply(&ReplyFrame::ack(auth.message_id, true)).unwrap();
    assert_eq!(connecting.await.unwrap(), Ok(None));
}

#[tokio::test(start_paused = true)]
async fn test_transport_drop_detaches_channels() {
    let (mut fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let _pane = remote.open_channel(&format!("{open_id}:3")).unwrap();
    let channel = opening.await.unwrap().unwrap();

    remote.set_state(TransportState::Disconnected);
    settle().await;
    assert_eq!(
        fx.session.status(),
        status(SessionState::Disconnected, Some(FailureReason::TransportLost))
    );
    assert_eq!(channel.ready_state(), ReadyState::Disconnected);

    let session = fx.session.clone();
    let reconnecting = tokio::spawn(async move { session.reconnect(None).await });
    let _link = fx.accept().await;
    assert_eq!(reconnecting.await.unwrap(), Ok(None));
    assert_eq!(fx.factory.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_control_channel_reuses_transport() {
    let (fx, mut remote, control) = Fixture::connected(SessionConfig::default()).await;

    control.close();
    settle().await;
    assert_eq!(
        fx.session.status(),
        status(SessionState::Disconnected, Some(FailureReason::DataChannelLost))
    );

    let session = fx.session.clone();
    let reconnecting = tokio::spawn(async move { session.reconnect(None).await });
    let control = remote.accept_channel().await.unwrap();
    control.accept();
    assert_eq!(reconnecting.await.unwrap(), Ok(None));
    assert_eq!(fx.factory.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_control_channel_detaches_panes() {
    let (fx, mut remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let mut old_pane = remote.open_channel(&format!("{open_id}:5")).unwrap();
    let old = opening.await.unwrap().unwrap();

    control.close();
    settle().await;
    assert_eq!(
        fx.session.status(),
        status(SessionState::Disconnected, Some(FailureReason::DataChannelLost))
    );
    assert_eq!(old.ready_state(), ReadyState::Disconnected);
    assert!(old_pane.recv().await.is_none());

    let session = fx.session.clone();
    let reconnecting = tokio::spawn(async move { session.reconnect(None).await });
    let mut control = remote.accept_channel().await.unwrap();
    control.accept();
    assert_eq!(reconnecting.await.unwrap(), Ok(None));

    let session = fx.session.clone();
    let reattaching = tokio::spawn(async move {
        session
            .open_channel(ChannelTarget::Existing(5), None, None)
            .await
    });
    let request = next_request(&mut control).await;
    assert_eq!(
        request.command,
        ControlCommand::ReconnectPane {
            id: 5,
            cols: None,
            rows: None,
        }
    );
    let mut new_pane = remote
        .open_channel(&format!("{}:5", request.message_id))
        .unwrap();
    let new = reattaching.await.unwrap().unwrap();

    assert_eq!(new.ready_state(), ReadyState::Open);
    assert_eq!(old.ready_state(), ReadyState::Disconnected);
    assert_eq!(old.send("stale"), Err(SessionError::NotConnected));
    new.send("ls\n").unwrap();
    assert_eq!(new_pane.recv().await.unwrap(), Bytes::from_static(b"ls\n"));
    assert_eq!(fx.factory.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reattaching_live_channel_closes_previous() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let mut old_pane = remote.open_channel(&format!("{open_id}:5")).unwrap();
    let old = opening.await.unwrap().unwrap();
    let mut events = old.subscribe();

    let session = fx.session.clone();
    let reattaching = tokio::spawn(async move {
        session
            .open_channel(ChannelTarget::Existing(5), None, None)
            .await
    });
    let reopen_id = next_request(&mut control).await.message_id;
    let mut new_pane = remote.open_channel(&format!("{reopen_id}:5")).unwrap();
    let new = reattaching.await.unwrap().unwrap();

    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Closed {
            reason: CloseReason::Replaced
        })
    );
    assert_eq!(old.ready_state(), ReadyState::Closed);
    assert!(old_pane.recv().await.is_none());

    new.send("still here").unwrap();
    assert_eq!(
        new_pane.recv().await.unwrap(),
        Bytes::from_static(b"still here")
    );
    assert_eq!(new.ready_state(), ReadyState::Open);
    assert_eq!(fx.session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_negative_marker_is_refused() {
    let (fx, _remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let session = fx.session.clone();
    let disconnecting = tokio::spawn(async move { session.disconnect().await });
    let mark = next_request(&mut control).await;
    assert_eq!(mark.command, ControlCommand::Mark);
    control.reply(&ReplyFrame::ack(mark.message_id, -1)).unwrap();

    let error = assert_err!(disconnecting.await.unwrap());
    assert!(matches!(error, SessionError::BadMarker(_)));
    assert_eq!(fx.session.last_marker(), None);
    assert_eq!(fx.session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_channel_close_and_resize() {
    let (fx, remote, mut control) = Fixture::connected(SessionConfig::default()).await;
    let opening = fx.open("bash");
    let open_id = next_request(&mut control).await.message_id;
    let mut first = remote.open_channel(&format!("{open_id}:1")).unwrap();
    let channel = opening.await.unwrap().unwrap();

    let resizing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.resize(120, 40).await }
    });
    let request = next_request(&mut control).await;
    assert_eq!(
        request.command,
        ControlCommand::Resize {
            id: 1,
            cols: 120,
            rows: 40,
        }
    );
    control
        .reply(&ReplyFrame::ack(request.message_id, serde_json::Value::Null))
        .unwrap();
    assert_eq!(resizing.await.unwrap(), Ok(()));

    let mut events = channel.subscribe();
    channel.close();
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Closed {
            reason: CloseReason::Requested
        })
    );
    assert!(first.recv().await.is_none());

    let opening = fx.open("top");
    let open_id = next_request(&mut control).await.message_id;
    let second = remote.open_channel(&format!("{open_id}:2")).unwrap();
    let channel = opening.await.unwrap().unwrap();
    let mut events = channel.subscribe();
    second.close();
    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Closed {
            reason: CloseReason::Remote
        })
    );
    assert_eq!(fx.session.state(), SessionState::Connected);
}

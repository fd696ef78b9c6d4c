//! Pane-level orchestration over one session.

use std::collections::BTreeMap;

use futures::future::join_all;
use remote_panes_core::{ReadyState, StateChange};
use remote_panes_transport::{ChannelId, Marker};
use tokio::sync::RwLock;

use crate::{
    channel::Channel,
    error::SessionError,
    session::{ChannelTarget, PaneSize, Resumption, Session},
};

/// Local pane identifier, stable across reattachment.
pub type PaneId = u64;

/// Gate error.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Pane not found: {0}")]
    PaneNotFound(PaneId),
    #[error("No marker to resume from")]
    NoMarker,
}

/// Snapshot of one pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub id: PaneId,
    pub channel_id: ChannelId,
    pub command: String,
    pub size: Option<PaneSize>,
    pub ready_state: ReadyState,
}

struct Pane {
    channel_id: ChannelId,
    command: String,
    size: Option<PaneSize>,
    channel: Channel,
}

#[derive(Default)]
struct PaneRegistry {
    next_id: PaneId,
    panes: BTreeMap<PaneId, Pane>,
}

impl PaneRegistry {
    fn insert(&mut self, command: String, size: Option<PaneSize>, channel: Channel) -> PaneId {
        self.next_id += 1;
        let id = self.next_id;
        self.panes.insert(
            id,
            Pane {
                channel_id: channel.id(),
                command,
                size,
                channel,
            },
        );
        id
    }

    fn snapshot(&self) -> Vec<PaneInfo> {
        self.panes
            .iter()
            .map(|(id, pane)| PaneInfo {
                id: *id,
                channel_id: pane.channel_id,
                command: pane.command.clone(),
                size: pane.size,
                ready_state: pane.channel.ready_state(),
            })
            .collect()
    }
}

/// Owns a [`Session`] and the panes opened through it.
///
/// Panes survive disengage/resume: each keeps its [`PaneId`] and remote
/// channel id while the [`Channel`] behind it is replaced.
pub struct Gate {
    session: Session,
    panes: RwLock<PaneRegistry>,
    marker: RwLock<Option<Marker>>,
    layout: RwLock<Option<String>>,
}

impl Gate {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            panes: RwLock::new(PaneRegistry::default()),
            marker: RwLock::new(None),
            layout: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// State of the session with the reason for its last transition.
    #[must_use]
    pub fn last_status(&self) -> StateChange {
        self.session.status()
    }

    /// Connect, resuming from the stored marker when there is one.
    ///
    /// # Errors
    /// Returns error if the session fails to connect.
    pub async fn connect(&self) -> Result<Option<Resumption>, GateError> {
        if self.marker.read().await.is_some() {
            return self.resume().await.map(Some);
        }
        Ok(self.session.connect(None).await?)
    }

    /// Spawn a remote process in a new pane.
    ///
    /// # Errors
    /// Returns error if the channel cannot be opened.
    pub async fn open_pane(&self, command: &str, size: Option<PaneSize>) -> Result<(PaneId, Channel), GateError> {
        let channel = self
            .session
            .open_channel(ChannelTarget::New(command.to_string()), None, size)
            .await?;
        let id = self
            .panes
            .write()
            .await
            .insert(command.to_string(), size, channel.clone());
        tracing::info!(pane = id, channel_id = channel.id(), command, "pane opened");
        Ok((id, channel))
    }

    /// Current channel of a pane.
    pub async fn pane(&self, id: PaneId) -> Option<Channel> {
        self.panes.read().await.panes.get(&id).map(|p| p.channel.clone())
    }

    /// Snapshot of every pane, ordered by id.
    pub async fn panes(&self) -> Vec<PaneInfo> {
        self.panes.read().await.snapshot()
    }

    /// Resize a pane and remember the size for reattachment.
    ///
    /// # Errors
    /// Returns error if the pane is unknown or the remote refuses.
    pub async fn resize_pane(&self, id: PaneId, size: PaneSize) -> Result<(), GateError> {
        let channel = self.pane(id).await.ok_or(GateError::PaneNotFound(id))?;
        channel.resize(size.cols, size.rows).await?;
        if let Some(pane) = self.panes.write().await.panes.get_mut(&id) {
            pane.size = Some(size);
        }
        Ok(())
    }

    /// Close a pane and forget it.
    ///
    /// # Errors
    /// Returns error if the pane is unknown.
    pub async fn close_pane(&self, id: PaneId) -> Result<(), GateError> {
        let pane = self
            .panes
            .write()
            .await
            .panes
            .remove(&id)
            .ok_or(GateError::PaneNotFound(id))?;
        pane.channel.close();
        Ok(())
    }

    /// Suspend the session, keeping remote processes alive.
    ///
    /// # Errors
    /// Returns error if the session is not connected or `mark` fails.
    pub async fn disengage(&self) -> Result<Marker, GateError> {
        let marker = self.session.disconnect().await?;
        *self.marker.write().await = Some(marker);
        tracing::info!(marker, "gate disengaged");
        Ok(marker)
    }

    /// Reconnect from the stored marker and reattach every known pane.
    ///
    /// Panes the remote no longer knows are dropped.
    ///
    /// # Errors
    /// Returns error if there is no marker or the reconnect fails.
    pub async fn resume(&self) -> Result<Resumption, GateError> {
        let marker = self.marker.write().await.take().ok_or(GateError::NoMarker)?;
        let resumption = match self.session.reconnect(Some(marker)).await {
            Ok(Some(resumption)) => resumption,
            Ok(None) => {
                return Err(SessionError::Internal("restore finished without a layout".to_string()).into());
            }
            Err(error) => {
                *self.marker.write().await = Some(marker);
                return Err(error.into());
            }
        };
        *self.layout.write().await = Some(resumption.layout().to_string());
        self.reattach().await;
        Ok(resumption)
    }

    /// Last layout received from the remote.
    pub async fn layout(&self) -> Option<String> {
        self.layout.read().await.clone()
    }

    /// Push a layout to the remote.
    ///
    /// # Errors
    /// Returns error if the control exchange fails.
    pub async fn save_layout(&self, layout: impl Into<String>) -> Result<(), GateError> {
        let layout = layout.into();
        self.session.set_payload(layout.clone()).await?;
        *self.layout.write().await = Some(layout);
        Ok(())
    }

    /// Close the session and every pane channel.
    pub fn close(&self) {
        self.session.close();
    }

    async fn reattach(&self) {
        let targets: Vec<_> = self
            .panes
            .read()
            .await
            .panes
            .iter()
            .map(|(id, pane)| (*id, pane.channel_id, pane.size))
            .collect();
        let opens = targets.into_iter().map(|(id, channel_id, size)| async move {
            let result = self
                .session
                .open_channel(ChannelTarget::Existing(channel_id), None, size)
                .await;
            (id, result)
        });
        let results = join_all(opens).await;

        let mut registry = self.panes.write().await;
        for (id, result) in results {
            match result {
                Ok(channel) => {
                    if let Some(pane) = registry.panes.get_mut(&id) {
                        tracing::debug!(pane = id, channel_id = channel.id(), "pane reattached");
                        pane.channel = channel;
                    }
                }
                Err(error) => {
                    tracing::warn!(pane = id, %error, "pane could not be reattached");
                    registry.panes.remove(&id);
                }
            }
        }
    }
}

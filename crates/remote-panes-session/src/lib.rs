//! Session orchestration for remote panes.
//!
//! Provides:
//! - `Session` - Connection lifecycle, disengage/restore, channel opens
//! - `ControlLink` - Reliable control messages with bounded retry
//! - `Channel` - Pane byte streams with observers
//! - `Gate` - Pane registry that survives disengage/resume

pub mod channel;
pub mod control;
pub mod error;
pub mod gate;
pub mod session;

mod tasks;

pub use channel::{Channel, ChannelEvent, ChannelSubscription, CloseReason};
pub use control::{ControlLink, Resolved};
pub use error::SessionError;
pub use gate::{Gate, GateError, PaneId, PaneInfo};
pub use session::{ChannelTarget, PaneSize, Resumption, Session, SessionBuilder};

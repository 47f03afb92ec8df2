use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// Frame-lock traffic between the master and one client.
    SyncConnection,
    /// Application packages, acknowledged one by one.
    DataTransfer,
    /// Headerless text or raw commands from an outside tool.
    ExternalControl,
}

impl ConnectionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncConnection => "sync",
            Self::DataTransfer => "data_transfer",
            Self::ExternalControl => "external_control",
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the link this process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Listens and accepts, re-listening after every session.
    Server,
    /// Dials once, retrying until the server is up.
    Client,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// How external-control traffic is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Line-oriented text, `\r\n` separated, each line answered with `OK`.
    #[default]
    Ascii,
    /// Every received chunk is delivered unchanged.
    Raw,
}

/// Receives decoded frame-lock payloads.
pub trait SyncHandler: Send + Sync {
    /// A non-empty sync payload arrived on `connection_id`.
    fn decode(&self, payload: &[u8], connection_id: usize);

    /// The connection's session started or ended.
    fn status_changed(&self, _connected: bool, _connection_id: usize) {}
}

/// Receives data-transfer packages and their acknowledgements.
pub trait DataTransferHandler: Send + Sync {
    /// A package arrived; an acknowledgement is sent once this returns.
    fn received(&self, payload: &[u8], package_id: i32, connection_id: usize);

    /// The peer acknowledged `package_id`.
    fn acknowledged(&self, package_id: i32, connection_id: usize);

    fn status_changed(&self, _connected: bool, _connection_id: usize) {}
}

/// Receives external-control commands.
pub trait ControlHandler: Send + Sync {
    /// One command line (ASCII mode) or one received chunk (raw mode).
    fn command(&self, command: &[u8], connection_id: usize);

    fn status_changed(&self, _connected: bool, _connection_id: usize) {}
}

/// The callbacks attached to one connection, tagged by role.
#[derive(Clone)]
pub enum RoleHandler {
    Sync(Arc<dyn SyncHandler>),
    DataTransfer(Arc<dyn DataTransferHandler>),
    Control(Arc<dyn ControlHandler>),
}

impl RoleHandler {
    /// The role this handler serves.
    pub fn role(&self) -> ConnectionRole {
        match self {
            Self::Sync(_) => ConnectionRole::SyncConnection,
            Self::DataTransfer(_) => ConnectionRole::DataTransfer,
            Self::Control(_) => ConnectionRole::ExternalControl,
        }
    }

    pub(crate) fn status_changed(&self, connected: bool, connection_id: usize) {
        match self {
            Self::Sync(handler) => handler.status_changed(connected, connection_id),
            Self::DataTransfer(handler) => handler.status_changed(connected, connection_id),
            Self::Control(handler) => handler.status_changed(connected, connection_id),
        }
    }
}

impl fmt::Debug for RoleHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RoleHandler").field(&self.role()).finish()
    }
}

/// Per-role handlers a manager wires into the connections it creates.
#[derive(Clone, Default)]
pub struct Handlers {
    pub sync: Option<Arc<dyn SyncHandler>>,
    pub data_transfer: Option<Arc<dyn DataTransferHandler>>,
    pub control: Option<Arc<dyn ControlHandler>>,
}

impl Handlers {
    /// The handler for a connection of `role`, if one is registered.
    pub fn for_role(&self, role: ConnectionRole) -> Option<RoleHandler> {
        match role {
            ConnectionRole::SyncConnection => self.sync.clone().map(RoleHandler::Sync),
            ConnectionRole::DataTransfer => {
                self.data_transfer.clone().map(RoleHandler::DataTransfer)
            }
            ConnectionRole::ExternalControl => self.control.clone().map(RoleHandler::Control),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("sync", &self.sync.is_some())
            .field("data_transfer", &self.data_transfer.is_some())
            .field("control", &self.control.is_some())
            .finish()
    }
}

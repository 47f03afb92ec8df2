use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clustersync_frame::{CompressionLevel, FrameConfig, DEFAULT_MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::connection::StatusListener;
use crate::error::Result;
use crate::framelock::{LockMode, SyncSignal};
use crate::role::{ConnectionRole, ControlMode, RoleHandler};
use crate::topology::Topology;

/// Loopback address used by local modes and the external control listener.
pub const LOCALHOST: &str = "127.0.0.1";

/// Where this process sits in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Master reachable from other machines.
    Server,
    /// Client dialing the master address from the topology.
    Client,
    /// Master for a cluster running on one machine.
    LocalServer,
    /// Client dialing the master over loopback.
    LocalClient,
}

impl NetworkMode {
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server | Self::LocalServer)
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::LocalServer | Self::LocalClient)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::LocalServer => "local_server",
            Self::LocalClient => "local_client",
        })
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Firm or loose frame lock for every sync connection in this process.
    pub lock_mode: LockMode,
    /// Longest a frame-lock stage waits before giving up. Default: 60 s.
    pub sync_timeout: Duration,
    /// Log "waiting" once per second while a frame-lock stage blocks.
    pub print_sync_message: bool,
    /// DEFLATE level for data transfer, `None` to send uncompressed.
    pub compression: Option<u32>,
    /// Pause between client dial attempts. Default: 1 s.
    pub dial_retry_interval: Duration,
    /// Time given to peers to read the disconnect sentinel on close. Default: 250 ms.
    pub shutdown_grace: Duration,
    /// Initial receive buffer size for sync connections. Default: 1 KiB.
    pub sync_buffer_size: usize,
    /// Leave Nagle's algorithm on for data-transfer sockets.
    pub nagle_for_data_transfer: bool,
    /// Interpretation of external-control traffic.
    pub control_mode: ControlMode,
    /// Largest accepted payload (wire or inflated). Default: 256 MiB.
    pub max_payload_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Firm,
            sync_timeout: Duration::from_secs(60),
            print_sync_message: false,
            compression: None,
            dial_retry_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(250),
            sync_buffer_size: 1024,
            nagle_for_data_transfer: false,
            control_mode: ControlMode::Ascii,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl ManagerConfig {
    /// Defaults with the lock mode and control mode taken from a topology.
    pub fn from_topology(topology: &Topology) -> Self {
        Self {
            lock_mode: if topology.firm_sync {
                LockMode::Firm
            } else {
                LockMode::Loose
            },
            control_mode: topology.control_mode,
            ..Self::default()
        }
    }

    /// Validated compression level, if compression is enabled.
    pub fn compression_level(&self) -> Result<Option<CompressionLevel>> {
        self.compression
            .map(CompressionLevel::new)
            .transpose()
            .map_err(Into::into)
    }

    /// Reader/writer settings for a connection of `role`.
    pub fn frame_config(&self, role: ConnectionRole) -> FrameConfig {
        let initial_buffer_size = match role {
            ConnectionRole::SyncConnection => self.sync_buffer_size,
            // grown on demand from the first package header
            ConnectionRole::DataTransfer => 0,
            ConnectionRole::ExternalControl => self.sync_buffer_size,
        };
        FrameConfig {
            max_payload_size: self.max_payload_size,
            initial_buffer_size,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Everything a [`Connection`](crate::Connection) needs besides its endpoint.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub lock_mode: LockMode,
    pub control_mode: ControlMode,
    pub dial_retry_interval: Duration,
    pub nagle: bool,
    pub frame: FrameConfig,
    pub handler: Option<RoleHandler>,
    pub listener: Option<Weak<dyn StatusListener>>,
    pub signal: Arc<SyncSignal>,
    /// Set when the owner is shutting down; stops an in-progress dial.
    pub cancel: Arc<AtomicBool>,
}

impl ConnectionOptions {
    /// Options for a connection of `role` derived from manager settings.
    pub fn from_config(config: &ManagerConfig, role: ConnectionRole) -> Self {
        Self {
            lock_mode: config.lock_mode,
            control_mode: config.control_mode,
            dial_retry_interval: config.dial_retry_interval,
            nagle: role == ConnectionRole::DataTransfer && config.nagle_for_data_transfer,
            frame: config.frame_config(role),
            handler: None,
            listener: None,
            signal: Arc::new(SyncSignal::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_handler(mut self, handler: Option<RoleHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_listener(mut self, listener: Weak<dyn StatusListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_signal(mut self, signal: Arc<SyncSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default(), ConnectionRole::SyncConnection)
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("lock_mode", &self.lock_mode)
            .field("control_mode", &self.control_mode)
            .field("dial_retry_interval", &self.dial_retry_interval)
            .field("nagle", &self.nagle)
            .field("frame", &self.frame)
            .field("handler", &self.handler)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.lock_mode, LockMode::Firm);
        assert_eq!(config.sync_timeout, Duration::from_secs(60));
        assert_eq!(config.dial_retry_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.compression_level().expect("no level is valid"), None);
    }

    #[test]
    fn bad_compression_level_rejected() {
        let config = ManagerConfig {
            compression: Some(12),
            ..ManagerConfig::default()
        };
        assert!(matches!(
            config.compression_level(),
            Err(NodeError::Compression(_))
        ));
    }

    #[test]
    fn nagle_only_applies_to_data_transfer() {
        let config = ManagerConfig {
            nagle_for_data_transfer: true,
            ..ManagerConfig::default()
        };
        assert!(ConnectionOptions::from_config(&config, ConnectionRole::DataTransfer).nagle);
        assert!(!ConnectionOptions::from_config(&config, ConnectionRole::SyncConnection).nagle);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"lock_mode":"loose","print_sync_message":true}"#)
                .expect("partial config should parse");
        assert_eq!(config.lock_mode, LockMode::Loose);
        assert!(config.print_sync_message);
        assert_eq!(config.sync_buffer_size, 1024);
    }

    #[test]
    fn mode_classification() {
        assert!(NetworkMode::LocalServer.is_server());
        assert!(NetworkMode::LocalServer.is_local());
        assert!(!NetworkMode::Client.is_server());
        assert!(NetworkMode::LocalClient.is_local());
    }
}

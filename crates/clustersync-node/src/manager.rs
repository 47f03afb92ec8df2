use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use clustersync_frame::{
    frame_payload, CompressionLevel, FrameError, Header, Result as FrameResult,
};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionOptions, ManagerConfig, NetworkMode};
use crate::connection::{Connection, StatusListener};
use crate::error::{NodeError, Result};
use crate::external::GREETING;
use crate::framelock::{wait_for_peers, SyncOutcome, SyncSignal};
use crate::lock;
use crate::role::{ConnectionRole, Handlers, Side};
use crate::topology::Topology;

#[derive(Debug, Default)]
struct ClusterStatus {
    active: usize,
    active_sync: usize,
    active_data_transfer: usize,
    all_nodes_connected: bool,
    running: bool,
}

struct ManagerShared {
    mode: NetworkMode,
    config: ManagerConfig,
    connections: RwLock<Vec<Arc<Connection>>>,
    handlers: RwLock<Handlers>,
    status: Mutex<ClusterStatus>,
    compression: Mutex<Option<CompressionLevel>>,
    signal: Arc<SyncSignal>,
    cancel: Arc<AtomicBool>,
    closed: AtomicBool,
}

/// Owns every connection of one node and runs the frame-lock protocol.
///
/// Several managers can live in one process; nothing here is global.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    /// Create an empty manager.
    ///
    /// Fails if the configured compression level is invalid.
    pub fn new(mode: NetworkMode, config: ManagerConfig) -> Result<Self> {
        let compression = config.compression_level()?;
        info!(%mode, lock_mode = ?config.lock_mode, "connection manager created");
        Ok(Self {
            shared: Arc::new(ManagerShared {
                mode,
                config,
                connections: RwLock::new(Vec::new()),
                handlers: RwLock::new(Handlers::default()),
                status: Mutex::new(ClusterStatus {
                    running: true,
                    ..ClusterStatus::default()
                }),
                compression: Mutex::new(compression),
                signal: Arc::new(SyncSignal::new()),
                cancel: Arc::new(AtomicBool::new(false)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Replace the handlers wired into connections added from now on.
    pub fn set_handlers(&self, handlers: Handlers) {
        *self.shared.write_handlers() = handlers;
    }

    /// Open and start every connection `this_node` needs in `topology`.
    pub fn init(&self, topology: &Topology, this_node: usize, handlers: Handlers) -> Result<()> {
        topology.validate()?;
        let plan = topology.plan(this_node, self.shared.mode)?;

        for planned in &plan {
            if let Some(existing) = self
                .shared
                .snapshot()
                .iter()
                .find(|conn| conn.port() == planned.port)
            {
                return Err(NodeError::Config(format!(
                    "port {} is already used by connection {}",
                    planned.port,
                    existing.id()
                )));
            }
        }

        self.set_handlers(handlers);
        for planned in plan {
            self.add_connection(planned.port, &planned.address, planned.role)?;
        }

        info!(
            node = this_node,
            connections = self.connection_count(),
            lock_mode = ?self.shared.config.lock_mode,
            "cluster networking initialised"
        );
        Ok(())
    }

    /// Create, register and start one connection.
    ///
    /// Returns the connection's index in insertion order. A client blocks
    /// here until the server accepts the dial.
    pub fn add_connection(&self, port: u16, address: &str, role: ConnectionRole) -> Result<usize> {
        if port == 0 {
            return Err(NodeError::Config(format!(
                "no port provided for connection to {address}"
            )));
        }
        if address.trim().is_empty() {
            return Err(NodeError::Config(format!(
                "empty address for connection to port {port}"
            )));
        }

        let side = if self.is_server() {
            Side::Server
        } else {
            Side::Client
        };
        let listener: Weak<ManagerShared> = Arc::downgrade(&self.shared);
        let listener: Weak<dyn StatusListener> = listener;
        let handler = self.shared.read_handlers().for_role(role);
        let options = ConnectionOptions::from_config(&self.shared.config, role)
            .with_handler(handler)
            .with_listener(listener)
            .with_signal(Arc::clone(&self.shared.signal))
            .with_cancel(Arc::clone(&self.shared.cancel));

        debug!(%role, %side, address, port, "initiating network connection");
        let connection = Connection::open(role, side, address, port, options)?;

        let index = {
            let mut connections = self.shared.write_connections();
            connections.push(Arc::clone(&connection));
            connections.len() - 1
        };

        connection.start()?;
        if self.is_server() {
            // a cluster with no client nodes is complete right away
            self.shared.recount();
        }
        Ok(index)
    }

    /// Send this node's part of the frame to its sync peers.
    ///
    /// Server: stamps `payload` with each connection's next frame number and
    /// returns the (min, max) loop time observed on the previous frame.
    /// Client: sends the zero-payload ready message; `payload` is unused.
    pub fn broadcast_to_sync_connections(&self, payload: &[u8]) -> Option<(Duration, Duration)> {
        let sync = self.shared.sync_connections();
        if sync.is_empty() {
            return None;
        }

        if !self.is_server() {
            for conn in sync.iter().filter(|conn| conn.is_connected()) {
                if let Err(err) = conn.push_client_message() {
                    warn!(connection = conn.id(), error = %err, "failed to acknowledge frame");
                }
            }
            return None;
        }

        let mut times: Option<(Duration, Duration)> = None;
        for conn in sync.iter().filter(|conn| conn.is_connected()) {
            let loop_time = conn.loop_time();
            times = Some(match times {
                None => (loop_time, loop_time),
                Some((min, max)) => (min.min(loop_time), max.max(loop_time)),
            });
            if let Err(err) = conn.send_frame(payload) {
                warn!(connection = conn.id(), error = %err, "failed to send frame");
            }
        }
        times
    }

    /// Client side: block until the master's current frame has arrived.
    pub fn frame_lock_pre_stage(&self) -> SyncOutcome {
        if self.is_server() {
            return SyncOutcome::Synced;
        }
        let print = self.shared.config.print_sync_message;
        wait_for_peers(
            &self.shared.signal,
            "pre",
            self.shared.config.sync_timeout,
            || {
                if !self.is_running() {
                    Some(SyncOutcome::Stopped)
                } else if self.is_sync_complete() {
                    Some(SyncOutcome::Synced)
                } else {
                    None
                }
            },
            |waited| {
                if print {
                    info!(waited_ms = waited.as_millis() as u64, "waiting for master");
                }
            },
        )
    }

    /// Server side: block until every connected client answered this frame.
    pub fn frame_lock_post_stage(&self) -> SyncOutcome {
        if !self.is_server() {
            return SyncOutcome::Synced;
        }
        let print = self.shared.config.print_sync_message;
        wait_for_peers(
            &self.shared.signal,
            "post",
            self.shared.config.sync_timeout,
            || {
                if !self.is_running() {
                    Some(SyncOutcome::Stopped)
                } else if self.active_connection_count() == 0 || self.is_sync_complete() {
                    Some(SyncOutcome::Synced)
                } else {
                    None
                }
            },
            |waited| {
                if !print {
                    return;
                }
                for conn in self.shared.sync_connections() {
                    if conn.is_connected() && !conn.is_updated() {
                        let frames = conn.frame_state();
                        info!(
                            connection = conn.id(),
                            send = frames.send_current,
                            recv = frames.recv_current,
                            waited_ms = waited.as_millis() as u64,
                            "waiting for node"
                        );
                    }
                }
            },
        )
    }

    /// Whether every active sync connection has caught up.
    pub fn is_sync_complete(&self) -> bool {
        let updated = self
            .shared
            .sync_connections()
            .iter()
            .filter(|conn| conn.is_updated())
            .count();
        updated == self.active_sync_connection_count()
    }

    /// Send a package to every connected data-transfer peer.
    ///
    /// Returns `Ok(false)` if compression failed and nothing was sent.
    pub fn transfer_data(&self, payload: &[u8], package_id: i32) -> Result<bool> {
        self.transfer_data_framed_by(payload, package_id, frame_payload)
    }

    fn transfer_data_framed_by<F>(&self, payload: &[u8], package_id: i32, framer: F) -> Result<bool>
    where
        F: FnOnce(&[u8], i32, Option<CompressionLevel>) -> FrameResult<Bytes>,
    {
        let Some(framed) = self.frame_package(payload, package_id, framer)? else {
            return Ok(false);
        };
        for conn in self.shared.data_transfer_connections() {
            if !conn.is_connected() {
                continue;
            }
            if let Err(err) = conn.send(&framed) {
                warn!(connection = conn.id(), package = package_id, error = %err, "data transfer failed");
            }
        }
        Ok(true)
    }

    /// Send a package to the data-transfer peer at `index`.
    pub fn transfer_data_to(&self, payload: &[u8], package_id: i32, index: usize) -> Result<bool> {
        let conn = self
            .shared
            .data_transfer_connections()
            .get(index)
            .cloned()
            .ok_or_else(|| NodeError::Config(format!("no data transfer connection {index}")))?;
        if !conn.is_connected() {
            return Err(NodeError::NotConnected(conn.id()));
        }

        let Some(framed) = self.frame_package(payload, package_id, frame_payload)? else {
            return Ok(false);
        };
        conn.send(&framed)?;
        Ok(true)
    }

    /// Write raw bytes to the external control peer.
    pub fn send_to_external_control(&self, bytes: &[u8]) -> Result<()> {
        let conn = self
            .external_control_connection()
            .ok_or_else(|| NodeError::Config("no external control connection".to_string()))?;
        conn.send(bytes)
    }

    /// Enable or disable compression for data transfer.
    pub fn set_data_transfer_compression(&self, enabled: bool, level: CompressionLevel) {
        *lock(&self.shared.compression) = enabled.then_some(level);
    }

    /// Broadcast the disconnect sentinel, then stop every connection.
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing network connections");

        lock(&self.shared.status).running = false;
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.signal.notify();

        let connections = self.shared.snapshot();
        for conn in &connections {
            conn.init_shutdown();
        }
        if !connections.is_empty() {
            thread::sleep(self.shared.config.shutdown_grace);
        }
        for conn in &connections {
            conn.close(false);
        }
        info!(connections = connections.len(), "network connections closed");
    }

    pub fn mode(&self) -> NetworkMode {
        self.shared.mode
    }

    pub fn is_server(&self) -> bool {
        self.shared.mode.is_server()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.status).running
    }

    pub fn all_nodes_connected(&self) -> bool {
        lock(&self.shared.status).all_nodes_connected
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn connection_count(&self) -> usize {
        self.shared.read_connections().len()
    }

    pub fn sync_connection_count(&self) -> usize {
        self.shared.sync_connections().len()
    }

    pub fn data_transfer_connection_count(&self) -> usize {
        self.shared.data_transfer_connections().len()
    }

    pub fn active_connection_count(&self) -> usize {
        lock(&self.shared.status).active
    }

    pub fn active_sync_connection_count(&self) -> usize {
        lock(&self.shared.status).active_sync
    }

    pub fn active_data_transfer_connection_count(&self) -> usize {
        lock(&self.shared.status).active_data_transfer
    }

    /// Connection by insertion index.
    pub fn connection(&self, index: usize) -> Option<Arc<Connection>> {
        self.shared.read_connections().get(index).cloned()
    }

    /// Sync connection by index among sync connections.
    pub fn sync_connection(&self, index: usize) -> Option<Arc<Connection>> {
        self.shared.sync_connections().get(index).cloned()
    }

    pub fn external_control_connection(&self) -> Option<Arc<Connection>> {
        self.shared
            .read_connections()
            .iter()
            .find(|conn| conn.role() == ConnectionRole::ExternalControl)
            .cloned()
    }

    fn frame_package<F>(&self, payload: &[u8], package_id: i32, framer: F) -> Result<Option<Bytes>>
    where
        F: FnOnce(&[u8], i32, Option<CompressionLevel>) -> FrameResult<Bytes>,
    {
        let level = *lock(&self.shared.compression);
        match framer(payload, package_id, level) {
            Ok(framed) => Ok(Some(framed)),
            Err(FrameError::Compression(err)) => {
                error!(package = package_id, error = %err, "failed to compress data transfer package");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("mode", &self.shared.mode)
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ManagerShared {
    fn read_connections(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_connections(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_handlers(&self) -> std::sync::RwLockReadGuard<'_, Handlers> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.read_connections().clone()
    }

    fn with_role(&self, role: ConnectionRole) -> Vec<Arc<Connection>> {
        self.read_connections()
            .iter()
            .filter(|conn| conn.role() == role)
            .cloned()
            .collect()
    }

    fn sync_connections(&self) -> Vec<Arc<Connection>> {
        self.with_role(ConnectionRole::SyncConnection)
    }

    fn data_transfer_connections(&self) -> Vec<Arc<Connection>> {
        self.with_role(ConnectionRole::DataTransfer)
    }

    /// Recount active connections. Returns true when the cluster just became
    /// complete.
    fn recount(&self) -> bool {
        let connections = self.snapshot();
        let mut active = 0;
        let mut active_sync = 0;
        let mut active_data_transfer = 0;
        let mut total_sync = 0;
        let mut total_data_transfer = 0;

        for conn in &connections {
            let connected = conn.is_connected();
            match conn.role() {
                ConnectionRole::SyncConnection => {
                    total_sync += 1;
                    active_sync += usize::from(connected);
                }
                ConnectionRole::DataTransfer => {
                    total_data_transfer += 1;
                    active_data_transfer += usize::from(connected);
                }
                ConnectionRole::ExternalControl => {}
            }
            active += usize::from(connected);
        }

        info!(active, total = connections.len(), "number of active connections");
        debug!(active_sync, total_sync, "connected sync nodes");
        debug!(active_data_transfer, total_data_transfer, "connected data transfer nodes");

        let mut status = lock(&self.status);
        status.active = active;
        status.active_sync = active_sync;
        status.active_data_transfer = active_data_transfer;

        if !self.mode.is_server() {
            return false;
        }
        let complete = active_sync == total_sync && active_data_transfer == total_data_transfer;
        let newly_complete = complete && !status.all_nodes_connected;
        status.all_nodes_connected = complete;
        newly_complete
    }

    fn broadcast_cluster_connected(&self) {
        info!("all nodes connected");
        let connected = Header::connected();
        for conn in self.snapshot() {
            if conn.role() == ConnectionRole::ExternalControl || !conn.is_connected() {
                continue;
            }
            if let Err(err) = conn.send_header(&connected) {
                warn!(connection = conn.id(), error = %err, "failed to announce cluster connected");
            }
        }
    }
}

impl StatusListener for ManagerShared {
    fn connection_status_changed(&self, connection: &Connection) {
        let connected = connection.is_connected();
        info!(
            connection = connection.id(),
            role = %connection.role(),
            connected,
            "connection status changed"
        );

        if self.recount() {
            self.broadcast_cluster_connected();
        }

        if !self.mode.is_server()
            && connection.role() == ConnectionRole::SyncConnection
            && !connected
        {
            let mut status = lock(&self.status);
            if status.active_sync == 0 && status.running {
                warn!(connection = connection.id(), "lost the last sync link, stopping");
                status.running = false;
            }
        }

        if self.mode.is_server() && connection.role() == ConnectionRole::ExternalControl && connected
        {
            if let Err(err) = connection.send(GREETING) {
                warn!(connection = connection.id(), error = %err, "failed to greet external control peer");
            }
        }

        self.signal.notify();
    }

    fn cluster_connected(&self) {
        if self.mode.is_server() {
            return;
        }
        let total_data_transfer = self.data_transfer_connections().len();
        let mut status = lock(&self.status);
        status.all_nodes_connected =
            status.active_sync == 1 && status.active_data_transfer == total_data_transfer;
        debug!(all_nodes_connected = status.all_nodes_connected, "cluster connected message received");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use clustersync_frame::CompressionError;

    use crate::role::{DataTransferHandler, SyncHandler};
    use crate::topology::NodeAddress;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .expect("ephemeral bind should succeed")
            .local_addr()
            .expect("local addr should be available")
            .port()
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            sync_timeout: Duration::from_secs(5),
            dial_retry_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(50),
            ..ManagerConfig::default()
        }
    }

    fn manager(mode: NetworkMode) -> ConnectionManager {
        ConnectionManager::new(mode, test_config()).expect("manager should build")
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        packages: Mutex<Vec<(Vec<u8>, i32)>>,
        acks: Mutex<Vec<i32>>,
        statuses: Mutex<Vec<bool>>,
    }

    impl SyncHandler for Recorder {
        fn decode(&self, payload: &[u8], _connection_id: usize) {
            lock(&self.frames).push(payload.to_vec());
        }

        fn status_changed(&self, connected: bool, _connection_id: usize) {
            lock(&self.statuses).push(connected);
        }
    }

    impl DataTransferHandler for Recorder {
        fn received(&self, payload: &[u8], package_id: i32, _connection_id: usize) {
            lock(&self.packages).push((payload.to_vec(), package_id));
        }

        fn acknowledged(&self, package_id: i32, _connection_id: usize) {
            lock(&self.acks).push(package_id);
        }
    }

    fn sync_handlers(recorder: &Arc<Recorder>) -> Handlers {
        Handlers {
            sync: Some(recorder.clone()),
            ..Handlers::default()
        }
    }

    fn data_handlers(recorder: &Arc<Recorder>) -> Handlers {
        Handlers {
            data_transfer: Some(recorder.clone()),
            ..Handlers::default()
        }
    }

    #[test]
    fn missing_port_or_address_is_config_error() {
        let server = manager(NetworkMode::LocalServer);
        assert!(matches!(
            server.add_connection(0, "127.0.0.1", ConnectionRole::SyncConnection),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            server.add_connection(free_port(), "", ConnectionRole::SyncConnection),
            Err(NodeError::Config(_))
        ));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn server_without_clients_is_complete_immediately() {
        let control_port = free_port();
        let topology = Topology {
            master_address: "127.0.0.1".to_string(),
            external_control_port: Some(control_port),
            control_mode: Default::default(),
            firm_sync: true,
            nodes: vec![NodeAddress {
                address: "127.0.0.1".to_string(),
                sync_port: free_port(),
                data_transfer_port: None,
            }],
        };

        let server = manager(NetworkMode::LocalServer);
        server
            .init(&topology, 0, Handlers::default())
            .expect("init should succeed");

        assert_eq!(server.connection_count(), 1);
        assert!(server.external_control_connection().is_some());
        assert!(server.all_nodes_connected());
        assert!(server.is_sync_complete());
        assert_eq!(server.frame_lock_post_stage(), SyncOutcome::Synced);
    }

    #[test]
    fn client_waits_for_late_server() {
        let port = free_port();
        let client_thread = thread::spawn(move || {
            let client = manager(NetworkMode::LocalClient);
            client
                .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
                .expect("client should eventually connect");
            client
        });

        thread::sleep(Duration::from_millis(300));
        let server = manager(NetworkMode::LocalServer);
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind");

        let client = client_thread.join().expect("client thread should finish");
        wait_until("server saw client", || server.all_nodes_connected());
        assert_eq!(client.active_sync_connection_count(), 1);
    }

    #[test]
    fn close_cancels_pending_dial() {
        let port = free_port();
        let client = Arc::new(manager(NetworkMode::LocalClient));

        let dialing = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection))
        };
        thread::sleep(Duration::from_millis(150));
        client.close();

        let result = dialing.join().expect("dial thread should finish");
        assert!(matches!(result, Err(NodeError::Dial { .. })));
        assert!(!client.is_running());
    }

    #[test]
    fn frame_lock_excludes_disconnected_client() {
        let (p1, p2) = (free_port(), free_port());
        let server = manager(NetworkMode::LocalServer);
        server
            .add_connection(p1, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind p1");
        server
            .add_connection(p2, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind p2");
        assert!(!server.all_nodes_connected());

        let first = Arc::new(Recorder::default());
        let client1 = manager(NetworkMode::LocalClient);
        client1.set_handlers(sync_handlers(&first));
        client1
            .add_connection(p1, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("client1 should connect");
        let client2 = manager(NetworkMode::LocalClient);
        client2
            .add_connection(p2, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("client2 should connect");

        wait_until("cluster complete", || {
            server.all_nodes_connected() && client1.all_nodes_connected()
        });

        for frame in 1..=41 {
            let payload = format!("frame {frame}");
            server.broadcast_to_sync_connections(payload.as_bytes());
            for client in [&client1, &client2] {
                assert_eq!(client.frame_lock_pre_stage(), SyncOutcome::Synced);
                client.broadcast_to_sync_connections(&[]);
            }
            assert_eq!(server.frame_lock_post_stage(), SyncOutcome::Synced);
        }

        server.broadcast_to_sync_connections(b"frame 42");
        assert_eq!(client1.frame_lock_pre_stage(), SyncOutcome::Synced);
        assert_eq!(
            lock(&first.frames).last().map(Vec::as_slice),
            Some(&b"frame 42"[..])
        );
        client1.broadcast_to_sync_connections(&[]);

        let to_first = server.sync_connection(0).expect("first sync connection");
        wait_until("first client acknowledged", || to_first.is_updated());
        assert_eq!(to_first.frame_state().recv_current, 42);
        assert!(!server.is_sync_complete());

        client2.close();
        wait_until("second client excluded", || {
            server.active_sync_connection_count() == 1
        });
        assert!(server.is_sync_complete());
        assert_eq!(server.frame_lock_post_stage(), SyncOutcome::Synced);
        assert!(!server.all_nodes_connected());
    }

    #[test]
    fn compressed_transfer_is_acknowledged() {
        let port = free_port();
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());

        let server = manager(NetworkMode::LocalServer);
        server.set_handlers(data_handlers(&sender));
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::DataTransfer)
            .expect("server should bind");
        server.set_data_transfer_compression(true, CompressionLevel::BEST_SPEED);

        let client = manager(NetworkMode::LocalClient);
        client.set_handlers(data_handlers(&receiver));
        client
            .add_connection(port, "127.0.0.1", ConnectionRole::DataTransfer)
            .expect("client should connect");
        wait_until("data link up", || {
            server.active_data_transfer_connection_count() == 1
        });

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        assert!(server.transfer_data(&payload, 7).expect("transfer should succeed"));

        wait_until("ack delivered", || lock(&sender.acks).as_slice() == [7]);
        let packages = lock(&receiver.packages);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].1, 7);
        assert_eq!(packages[0].0, payload);
    }

    fn data_link(sender: &Arc<Recorder>, receiver: &Arc<Recorder>) -> (ConnectionManager, ConnectionManager) {
        let port = free_port();
        let server = manager(NetworkMode::LocalServer);
        server.set_handlers(data_handlers(sender));
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::DataTransfer)
            .expect("server should bind");

        let client = manager(NetworkMode::LocalClient);
        client.set_handlers(data_handlers(receiver));
        client
            .add_connection(port, "127.0.0.1", ConnectionRole::DataTransfer)
            .expect("client should connect");
        wait_until("data link up", || {
            server.active_data_transfer_connection_count() == 1
        });
        (server, client)
    }

    #[test]
    fn failed_compression_skips_the_package() {
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());
        let (server, _client) = data_link(&sender, &receiver);
        server.set_data_transfer_compression(true, CompressionLevel::BEST_SPEED);

        let sent = server
            .transfer_data_framed_by(b"lost", 3, |_, _, _| {
                Err(CompressionError::BufferTooSmall { available: 0 }.into())
            })
            .expect("compression failure is not an error");
        assert!(!sent);

        // a later package arrives alone, so nothing was written for package 3
        assert!(server.transfer_data(b"kept", 4).expect("transfer should succeed"));
        wait_until("ack delivered", || lock(&sender.acks).as_slice() == [4]);
        assert_eq!(lock(&receiver.packages).as_slice(), [(b"kept".to_vec(), 4)]);
    }

    #[test]
    fn other_framing_errors_propagate() {
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());
        let (server, _client) = data_link(&sender, &receiver);

        let result = server.transfer_data_framed_by(b"x", 5, |_, _, _| {
            Err(FrameError::PayloadTooLarge { size: 1, max: 0 })
        });
        assert!(matches!(
            result,
            Err(NodeError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn large_incompressible_transfer_is_acknowledged() {
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());
        let (server, _client) = data_link(&sender, &receiver);
        server.set_data_transfer_compression(true, CompressionLevel::BEST_SPEED);

        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let payload: Vec<u8> = (0..2 * 1024 * 1024)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        assert!(server.transfer_data(&payload, 11).expect("transfer should succeed"));

        wait_until("ack delivered", || lock(&sender.acks).as_slice() == [11]);
        let packages = lock(&receiver.packages);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].1, 11);
        assert!(packages[0].0 == payload);
    }

    #[test]
    fn addressed_transfer_checks_index() {
        let server = manager(NetworkMode::LocalServer);
        server
            .add_connection(free_port(), "127.0.0.1", ConnectionRole::DataTransfer)
            .expect("server should bind");

        assert!(matches!(
            server.transfer_data_to(b"x", 1, 5),
            Err(NodeError::Config(_))
        ));
        assert!(matches!(
            server.transfer_data_to(b"x", 1, 0),
            Err(NodeError::NotConnected(_))
        ));
        assert!(matches!(
            server.send_to_external_control(b"hello"),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn server_close_stops_client() {
        let port = free_port();
        let recorder = Arc::new(Recorder::default());

        let server = manager(NetworkMode::LocalServer);
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind");

        let client = manager(NetworkMode::LocalClient);
        client.set_handlers(sync_handlers(&recorder));
        client
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("client should connect");
        wait_until("client connected", || client.active_sync_connection_count() == 1);

        server.close();
        wait_until("client stopped", || !client.is_running());

        assert_eq!(lock(&recorder.statuses).as_slice(), [true, false]);
        assert!(lock(&recorder.frames).is_empty());
        assert_eq!(client.frame_lock_pre_stage(), SyncOutcome::Stopped);
    }

    #[test]
    fn pre_stage_times_out_without_master_frames() {
        let port = free_port();
        let config = ManagerConfig {
            sync_timeout: Duration::from_millis(200),
            print_sync_message: true,
            ..test_config()
        };

        let server = manager(NetworkMode::LocalServer);
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind");
        let client =
            ConnectionManager::new(NetworkMode::LocalClient, config).expect("manager should build");
        client
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("client should connect");
        wait_until("client connected", || client.active_sync_connection_count() == 1);

        let started = Instant::now();
        assert_eq!(client.frame_lock_pre_stage(), SyncOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(client.is_running());
    }

    #[test]
    fn loose_server_never_waits() {
        let port = free_port();
        let config = ManagerConfig {
            lock_mode: crate::framelock::LockMode::Loose,
            ..test_config()
        };
        let server =
            ConnectionManager::new(NetworkMode::LocalServer, config).expect("manager should build");
        server
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("server should bind");
        let client = manager(NetworkMode::LocalClient);
        client
            .add_connection(port, "127.0.0.1", ConnectionRole::SyncConnection)
            .expect("client should connect");
        wait_until("server connected", || server.active_sync_connection_count() == 1);

        server.broadcast_to_sync_connections(b"go");
        assert!(server.is_sync_complete());
        assert_eq!(server.frame_lock_post_stage(), SyncOutcome::Synced);
    }
}

use std::fmt;
use std::net::Shutdown;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clustersync_frame::{FrameError, Header, Message, MessageReader, MessageWriter};
use clustersync_transport::{NodeStream, TcpEndpoint, TransportError};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionOptions;
use crate::error::{NodeError, Result};
use crate::external::{AsciiCommandParser, REPLY_OK};
use crate::framelock::FrameState;
use crate::lock;
use crate::role::{ConnectionRole, ControlMode, RoleHandler, Side};

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(0);

/// Observer of connection lifecycle events, typically the owning manager.
pub trait StatusListener: Send + Sync {
    /// A session on `connection` started or ended.
    fn connection_status_changed(&self, connection: &Connection);

    /// The master announced that every node is connected.
    fn cluster_connected(&self);
}

#[derive(Debug)]
struct ConnectionState {
    connected: bool,
    should_terminate: bool,
    session_active: bool,
    frames: FrameState,
    recv_capacity: usize,
    requested_capacity: usize,
}

/// One duplex link to a peer node.
///
/// A server connection listens on its port and serves one session at a time,
/// re-listening whenever a session ends. A client connection dials once (with
/// unbounded retry) and serves a single session.
pub struct Connection {
    id: usize,
    role: ConnectionRole,
    side: Side,
    address: String,
    port: u16,
    endpoint: Option<TcpEndpoint>,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    session_cond: Condvar,
    writer: Mutex<Option<MessageWriter<NodeStream>>>,
    stream: Mutex<Option<NodeStream>>,
    pending: Mutex<Option<NodeStream>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Bind (server) or dial (client) the endpoint.
    ///
    /// A server that cannot bind fails with [`NodeError::Bind`]. A client
    /// retries every `dial_retry_interval` until the server accepts, and only
    /// gives up with [`NodeError::Dial`] once `options.cancel` is set.
    pub fn open(
        role: ConnectionRole,
        side: Side,
        address: &str,
        port: u16,
        options: ConnectionOptions,
    ) -> Result<Arc<Self>> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let (endpoint, pending, port) = match side {
            Side::Server => {
                let endpoint =
                    TcpEndpoint::bind(TcpEndpoint::ANY_ADDRESS, port).map_err(
                        |source| {
                            error!(connection = id, %role, port, error = %source, "failed to bind");
                            NodeError::Bind {
                                id,
                                role,
                                port,
                                source,
                            }
                        },
                    )?;
                let bound = endpoint.port();
                (Some(endpoint), None, bound)
            }
            Side::Client => {
                let stream = dial(id, role, address, port, &options)?;
                (None, Some(stream), port)
            }
        };

        Ok(Arc::new(Self {
            id,
            role,
            side,
            address: address.to_string(),
            port,
            endpoint,
            state: Mutex::new(ConnectionState {
                connected: false,
                should_terminate: false,
                session_active: false,
                frames: FrameState::new(),
                recv_capacity: options.frame.initial_buffer_size,
                requested_capacity: 0,
            }),
            options,
            session_cond: Condvar::new(),
            writer: Mutex::new(None),
            stream: Mutex::new(None),
            pending: Mutex::new(pending),
            worker: Mutex::new(None),
        }))
    }

    /// Spawn the background threads.
    ///
    /// Client: one receive thread. Server: an acceptor thread that runs one
    /// receive thread per session.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let conn = Arc::clone(self);
        let spawned = match self.side {
            Side::Server => thread::Builder::new()
                .name(format!("clustersync-accept-{}", self.id))
                .spawn(move || conn.accept_loop()),
            Side::Client => {
                let stream = lock(&self.pending)
                    .take()
                    .ok_or(NodeError::NotConnected(self.id))?;
                thread::Builder::new()
                    .name(format!("clustersync-recv-{}", self.id))
                    .spawn(move || conn.run_session(stream))
            }
        };

        let handle = spawned.map_err(TransportError::Io)?;
        *lock(&self.worker) = Some(handle);
        debug!(connection = self.id, role = %self.role, side = %self.side, "connection started");
        Ok(())
    }

    /// Write pre-framed bytes to the peer (blocking, fully draining).
    ///
    /// An unrecoverable write error marks the connection disconnected and
    /// shuts the stream down so the receive thread ends the session.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.with_writer(|writer| writer.send_raw(bytes))
    }

    /// Write a header-only message.
    pub fn send_header(&self, header: &Header) -> Result<()> {
        self.with_writer(|writer| writer.send_header(header))
    }

    /// Stamp `payload` with the next frame number and send it.
    pub fn send_frame(&self, payload: &[u8]) -> Result<i32> {
        let frame = self.iterate_frame_counter();
        self.with_writer(|writer| writer.send_payload(payload, frame, None))?;
        Ok(frame)
    }

    /// Advance the send counter, clear `updated` and record the send time.
    pub fn iterate_frame_counter(&self) -> i32 {
        lock(&self.state).frames.iterate()
    }

    /// Acknowledge the master's frame with a zero-payload ready message.
    pub fn push_client_message(&self) -> Result<()> {
        let frame = self.iterate_frame_counter();
        self.send_header(&Header::client_ready(frame))
    }

    /// Whether the peer has caught up with this node's current frame.
    pub fn is_updated(&self) -> bool {
        let state = lock(&self.state);
        state.connected && state.frames.is_updated(self.side, self.options.lock_mode)
    }

    /// Ask the receive thread to grow its buffer before the next read.
    ///
    /// Ignored by data-transfer connections, which size from each header.
    pub fn request_buffer_capacity(&self, capacity: usize) {
        let mut state = lock(&self.state);
        state.requested_capacity = state.requested_capacity.max(capacity);
    }

    /// Current receive buffer capacity watermark.
    pub fn buffer_capacity(&self) -> usize {
        lock(&self.state).recv_capacity
    }

    /// Send the disconnect sentinel and begin tearing the connection down.
    pub fn init_shutdown(&self) {
        let was_connected = {
            let mut state = lock(&self.state);
            state.should_terminate = true;
            state.connected
        };

        if was_connected && self.role != ConnectionRole::ExternalControl {
            if let Some(writer) = lock(&self.writer).as_mut() {
                if let Err(err) = writer.send_disconnect() {
                    debug!(connection = self.id, role = %self.role, error = %err, "failed to send disconnect sentinel");
                }
            }
        }

        self.session_cond.notify_all();

        // keep reading until the peer hangs up on the sentinel
        let how = if was_connected {
            Shutdown::Write
        } else {
            Shutdown::Both
        };
        self.shutdown_stream(how);

        if let Some(endpoint) = &self.endpoint {
            endpoint.wake();
        }
    }

    /// Stop the background threads.
    ///
    /// Graceful close joins them; forced close abandons them.
    pub fn close(&self, forced: bool) {
        lock(&self.state).should_terminate = true;
        self.session_cond.notify_all();
        self.shutdown_stream(Shutdown::Both);
        if let Some(endpoint) = &self.endpoint {
            endpoint.wake();
        }

        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        if forced {
            debug!(connection = self.id, role = %self.role, "abandoning connection threads");
            return;
        }
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(connection = self.id, role = %self.role, "connection thread panicked");
        }
        debug!(connection = self.id, role = %self.role, "connection closed");
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_server(&self) -> bool {
        self.side == Side::Server
    }

    /// Peer address (client) or the address this listener serves (server).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Bound port (server) or dialed port (client).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn is_terminating(&self) -> bool {
        lock(&self.state).should_terminate
    }

    /// Snapshot of the frame counters.
    pub fn frame_state(&self) -> FrameState {
        lock(&self.state).frames.clone()
    }

    /// Time between the last send and the peer's reply.
    pub fn loop_time(&self) -> Duration {
        lock(&self.state).frames.loop_time()
    }

    fn with_writer<T>(
        &self,
        op: impl FnOnce(&mut MessageWriter<NodeStream>) -> clustersync_frame::Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return Err(NodeError::NotConnected(self.id));
        };

        match op(writer) {
            Ok(value) => Ok(value),
            Err(source) => {
                *guard = None;
                drop(guard);
                error!(connection = self.id, role = %self.role, error = %source, "send failed, dropping connection");
                lock(&self.state).connected = false;
                self.shutdown_stream(Shutdown::Both);
                Err(NodeError::Send {
                    id: self.id,
                    role: self.role,
                    source,
                })
            }
        }
    }

    fn shutdown_stream(&self, how: Shutdown) {
        if let Some(stream) = lock(&self.stream).as_ref() {
            if let Err(err) = stream.shutdown(how) {
                debug!(connection = self.id, error = %err, "stream shutdown failed");
            }
        }
    }

    fn accept_loop(self: Arc<Self>) {
        let mut session: Option<JoinHandle<()>> = None;

        loop {
            if let Some(handle) = session.take() {
                if handle.join().is_err() {
                    warn!(connection = self.id, role = %self.role, "session thread panicked");
                }
            }
            if self.is_terminating() {
                break;
            }

            lock(&self.state).session_active = true;
            let conn = Arc::clone(&self);
            let spawned = thread::Builder::new()
                .name(format!("clustersync-recv-{}", self.id))
                .spawn(move || conn.serve_session());
            match spawned {
                Ok(handle) => session = Some(handle),
                Err(err) => {
                    error!(connection = self.id, role = %self.role, error = %err, "failed to spawn session thread");
                    lock(&self.state).session_active = false;
                    break;
                }
            }

            let state = lock(&self.state);
            let _state = self
                .session_cond
                .wait_while(state, |state| state.session_active && !state.should_terminate)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(handle) = session.take() {
            let _ = handle.join();
        }
        debug!(connection = self.id, role = %self.role, "acceptor stopped");
    }

    fn serve_session(self: Arc<Self>) {
        if let Some(endpoint) = &self.endpoint {
            debug!(connection = self.id, role = %self.role, port = self.port, "waiting for peer");
            match endpoint.accept() {
                Ok(stream) if self.is_terminating() => {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                Ok(stream) => self.run_session(stream),
                Err(err) => {
                    if !self.is_terminating() {
                        error!(connection = self.id, role = %self.role, error = %err, "accept failed");
                        thread::sleep(self.options.dial_retry_interval);
                    }
                }
            }
        }

        lock(&self.state).session_active = false;
        self.session_cond.notify_all();
    }

    fn run_session(&self, stream: NodeStream) {
        if let Err(err) = self.configure_socket(&stream) {
            warn!(connection = self.id, role = %self.role, error = %err, "failed to set socket options");
        }

        let handles = stream
            .try_clone()
            .and_then(|reader| stream.try_clone().map(|shutdown| (reader, shutdown)));
        let (reader_stream, shutdown_handle) = match handles {
            Ok(handles) => handles,
            Err(err) => {
                error!(connection = self.id, role = %self.role, error = %err, "failed to clone stream");
                return;
            }
        };

        let reader = match MessageReader::with_config_stream(reader_stream, self.options.frame.clone()) {
            Ok(reader) => reader,
            Err(err) => {
                error!(connection = self.id, role = %self.role, error = %err, "failed to configure reader");
                return;
            }
        };
        let writer = match MessageWriter::with_config_stream(stream, self.options.frame.clone()) {
            Ok(writer) => writer,
            Err(err) => {
                error!(connection = self.id, role = %self.role, error = %err, "failed to configure writer");
                return;
            }
        };

        *lock(&self.writer) = Some(writer);
        *lock(&self.stream) = Some(shutdown_handle);
        {
            let mut state = lock(&self.state);
            if state.should_terminate {
                drop(state);
                self.teardown_stream();
                return;
            }
            state.connected = true;
        }
        info!(connection = self.id, role = %self.role, side = %self.side, port = self.port, "connection established");
        self.notify_status(true);

        match self.receive_loop(reader) {
            Ok(()) => info!(connection = self.id, role = %self.role, "connection closed by peer"),
            Err(err) if self.is_terminating() => {
                debug!(connection = self.id, role = %self.role, error = %err, "session ended during shutdown");
            }
            Err(err) => error!(connection = self.id, role = %self.role, error = %err, "connection lost"),
        }

        self.teardown_stream();
        lock(&self.state).connected = false;
        self.notify_status(false);
    }

    fn configure_socket(&self, stream: &NodeStream) -> clustersync_transport::Result<()> {
        stream.set_nodelay(!self.options.nagle)?;
        if self.role != ConnectionRole::SyncConnection {
            stream.set_keepalive(true)?;
        }
        Ok(())
    }

    fn teardown_stream(&self) {
        lock(&self.writer).take();
        if let Some(stream) = lock(&self.stream).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn notify_status(&self, connected: bool) {
        if let Some(handler) = &self.options.handler {
            handler.status_changed(connected, self.id);
        }
        if let Some(listener) = self.options.listener.as_ref().and_then(|l| l.upgrade()) {
            listener.connection_status_changed(self);
        }
        self.options.signal.notify();
    }

    fn cluster_connected(&self) {
        debug!(connection = self.id, role = %self.role, "cluster connected");
        if let Some(listener) = self.options.listener.as_ref().and_then(|l| l.upgrade()) {
            listener.cluster_connected();
        }
        self.options.signal.notify();
    }

    fn receive_loop(&self, mut reader: MessageReader<NodeStream>) -> Result<()> {
        if self.role == ConnectionRole::ExternalControl {
            return self.receive_control(&mut reader);
        }

        loop {
            self.honour_capacity_request(&mut reader);

            let message = match reader.read_message() {
                Ok(message) => message,
                Err(FrameError::ConnectionClosed) => return Ok(()),
                Err(FrameError::Compression(err)) => {
                    // payload was consumed, the stream is still aligned
                    warn!(connection = self.id, role = %self.role, error = %err, "dropping undecodable payload");
                    continue;
                }
                Err(source) => {
                    return Err(NodeError::Receive {
                        id: self.id,
                        role: self.role,
                        source,
                    })
                }
            };

            let flow = match self.role {
                ConnectionRole::SyncConnection => self.dispatch_sync(message)?,
                _ => self.dispatch_data_transfer(message)?,
            };

            lock(&self.state).recv_capacity = reader.payload_capacity();
            if flow.is_break() {
                return Ok(());
            }
        }
    }

    fn honour_capacity_request(&self, reader: &mut MessageReader<NodeStream>) {
        if self.role == ConnectionRole::DataTransfer {
            return;
        }
        let requested = lock(&self.state).requested_capacity;
        if requested <= reader.payload_capacity() {
            return;
        }
        match reader.reserve(requested) {
            Ok(_) => {
                debug!(connection = self.id, capacity = requested, "receive buffer grown on request");
                lock(&self.state).recv_capacity = reader.payload_capacity();
            }
            Err(err) => warn!(connection = self.id, error = %err, "failed to grow receive buffer"),
        }
    }

    fn dispatch_sync(&self, message: Message<'_>) -> Result<ControlFlow<()>> {
        match message {
            Message::Data { id, payload, .. } => {
                if id < 0 {
                    error!(connection = self.id, frame = id, "negative frame number");
                    return Err(NodeError::Protocol {
                        id: self.id,
                        role: self.role,
                        detail: format!("negative frame number {id}"),
                    });
                }
                lock(&self.state).frames.stamp_received(id);
                if !payload.is_empty() {
                    if let Some(RoleHandler::Sync(handler)) = &self.options.handler {
                        handler.decode(payload, self.id);
                    }
                }
                self.options.signal.notify();
            }
            Message::Connected => self.cluster_connected(),
            Message::Disconnect => {
                info!(connection = self.id, role = %self.role, "peer sent disconnect");
                if self.side == Side::Client {
                    lock(&self.state).should_terminate = true;
                }
                return Ok(ControlFlow::Break(()));
            }
            Message::Ack { .. } | Message::Noop => {}
        }
        Ok(ControlFlow::Continue(()))
    }

    fn dispatch_data_transfer(&self, message: Message<'_>) -> Result<ControlFlow<()>> {
        match message {
            Message::Data { id, payload, .. } => {
                if payload.is_empty() {
                    return Ok(ControlFlow::Continue(()));
                }
                if let Some(RoleHandler::DataTransfer(handler)) = &self.options.handler {
                    handler.received(payload, id, self.id);
                }
                self.send_header(&Header::ack(id))?;
            }
            Message::Ack { id } => {
                if let Some(RoleHandler::DataTransfer(handler)) = &self.options.handler {
                    handler.acknowledged(id, self.id);
                }
            }
            Message::Connected => self.cluster_connected(),
            Message::Disconnect => {
                info!(connection = self.id, role = %self.role, "peer sent disconnect");
                return Ok(ControlFlow::Break(()));
            }
            Message::Noop => {}
        }
        Ok(ControlFlow::Continue(()))
    }

    fn receive_control(&self, reader: &mut MessageReader<NodeStream>) -> Result<()> {
        let mut parser = AsciiCommandParser::with_limit(self.options.frame.max_payload_size);

        loop {
            self.honour_capacity_request(reader);

            let chunk = match reader.read_chunk() {
                Ok(chunk) => chunk,
                Err(FrameError::ConnectionClosed) => return Ok(()),
                Err(source) => {
                    return Err(NodeError::Receive {
                        id: self.id,
                        role: self.role,
                        source,
                    })
                }
            };

            if self.options.control_mode == ControlMode::Raw {
                if let Some(RoleHandler::Control(handler)) = &self.options.handler {
                    handler.command(chunk, self.id);
                }
                continue;
            }

            let parsed = parser.feed(chunk);
            for command in parsed.commands {
                debug!(connection = self.id, command = %command, "external control command");
                if let Some(RoleHandler::Control(handler)) = &self.options.handler {
                    handler.command(command.as_bytes(), self.id);
                }
                self.send(REPLY_OK)?;
            }
            if parsed.overflow {
                warn!(
                    connection = self.id,
                    limit = self.options.frame.max_payload_size,
                    "unterminated external control input, closing session"
                );
                return Ok(());
            }
            if parsed.close {
                info!(connection = self.id, "external control peer logged out");
                return Ok(());
            }
        }
    }
}

fn dial(
    id: usize,
    role: ConnectionRole,
    address: &str,
    port: u16,
    options: &ConnectionOptions,
) -> Result<NodeStream> {
    let mut attempt: u64 = 0;
    loop {
        if options.cancel.load(Ordering::Acquire) {
            return Err(NodeError::Dial {
                id,
                role,
                address: address.to_string(),
                port,
                source: TransportError::Shutdown,
            });
        }

        attempt += 1;
        match TcpEndpoint::connect(address, port) {
            Ok(stream) => {
                debug!(connection = id, %role, address, port, attempt, "dial succeeded");
                return Ok(stream);
            }
            Err(err) => {
                info!(
                    connection = id,
                    %role,
                    address,
                    port,
                    attempt,
                    error = %err,
                    "server not reachable, retrying"
                );
                thread::sleep(options.dial_retry_interval);
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("side", &self.side)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

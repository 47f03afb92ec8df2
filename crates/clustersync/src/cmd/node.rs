use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clustersync_node::{
    ConnectionManager, ControlHandler, DataTransferHandler, Handlers, ManagerConfig, LockMode,
    SyncHandler, SyncOutcome, Topology,
};
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, NodeArgs};
use crate::exit::{io_error, node_error, CliError, CliResult, CONFIG_INVALID, SUCCESS, USAGE};
use crate::output::{print_run_summary, OutputFormat};

const CONNECT_POLL: Duration = Duration::from_millis(50);

/// Frame number decoded from the master's sync payload.
#[derive(Debug, Default)]
struct DemoState {
    last_frame: AtomicU64,
}

impl SyncHandler for DemoState {
    fn decode(&self, payload: &[u8], connection_id: usize) {
        let Some(bytes) = payload.get(..8).and_then(|b| <[u8; 8]>::try_from(b).ok()) else {
            warn!(connection = connection_id, size = payload.len(), "short sync payload");
            return;
        };
        let frame = u64::from_le_bytes(bytes);
        self.last_frame.store(frame, Ordering::Release);
        debug!(connection = connection_id, frame, "decoded frame state");
    }

    fn status_changed(&self, connected: bool, connection_id: usize) {
        info!(connection = connection_id, connected, "sync link status");
    }
}

#[derive(Debug, Default)]
struct DemoTransfer;

impl DataTransferHandler for DemoTransfer {
    fn received(&self, payload: &[u8], package_id: i32, connection_id: usize) {
        info!(
            connection = connection_id,
            package = package_id,
            size = payload.len(),
            "data package received"
        );
    }

    fn acknowledged(&self, package_id: i32, connection_id: usize) {
        debug!(connection = connection_id, package = package_id, "data package acknowledged");
    }
}

#[derive(Debug, Default)]
struct DemoControl;

impl ControlHandler for DemoControl {
    fn command(&self, command: &[u8], connection_id: usize) {
        info!(
            connection = connection_id,
            command = %String::from_utf8_lossy(command),
            "external control command"
        );
    }
}

pub fn run(args: NodeArgs, format: OutputFormat) -> CliResult<i32> {
    if !(args.fps.is_finite() && args.fps > 0.0) {
        return Err(CliError::new(USAGE, "--fps must be a positive number"));
    }
    let period = Duration::from_secs_f64(1.0 / args.fps);
    let connect_timeout = parse_duration(&args.connect_timeout)?;

    let topology = Topology::load(&args.role.topology).map_err(|err| {
        node_error(
            &format!("failed to load topology {}", args.role.topology.display()),
            err,
        )
    })?;
    let config = resolve_config(&args, &topology)?;
    let mode = args.role.mode();

    let manager = Arc::new(
        ConnectionManager::new(mode, config).map_err(|err| node_error("invalid settings", err))?,
    );
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), manager.clone())?;

    let state = Arc::new(DemoState::default());
    let handlers = Handlers {
        sync: Some(state.clone()),
        data_transfer: Some(Arc::new(DemoTransfer)),
        control: Some(Arc::new(DemoControl)),
    };
    if let Err(err) = manager.init(&topology, args.role.node, handlers) {
        if !running.load(Ordering::SeqCst) {
            info!("interrupted while connecting");
            return Ok(SUCCESS);
        }
        return Err(node_error("failed to start cluster networking", err));
    }

    if manager.is_server() {
        wait_for_cluster(&manager, &running, connect_timeout);
    }

    let started = Instant::now();
    let mut frames = 0u64;
    let mut timeouts = 0u64;
    let mut stopped = false;

    while running.load(Ordering::SeqCst) && args.frames.is_none_or(|limit| frames < limit) {
        let frame_start = Instant::now();

        if manager.is_server() {
            let number = frames + 1;
            if let Some((min, max)) = manager.broadcast_to_sync_connections(&number.to_le_bytes()) {
                debug!(
                    frame = number,
                    min_loop_ms = min.as_secs_f64() * 1000.0,
                    max_loop_ms = max.as_secs_f64() * 1000.0,
                    "frame sent"
                );
            }
            if let Some(every) = args.transfer_every.filter(|n| *n > 0) {
                if number % every == 0 {
                    let package = format!("state after frame {number}");
                    let id = (number / every) as i32;
                    match manager.transfer_data(package.as_bytes(), id) {
                        Ok(true) => {}
                        Ok(false) => warn!(package = id, "data package not sent"),
                        Err(err) => warn!(package = id, error = %err, "data transfer failed"),
                    }
                }
            }
        } else {
            match manager.frame_lock_pre_stage() {
                SyncOutcome::Synced => {}
                SyncOutcome::TimedOut => timeouts += 1,
                SyncOutcome::Stopped => {
                    stopped = true;
                    break;
                }
            }
        }

        // stand-in for rendering
        if let Some(rest) = period.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }

        if manager.is_server() {
            match manager.frame_lock_post_stage() {
                SyncOutcome::Synced => {}
                SyncOutcome::TimedOut => timeouts += 1,
                SyncOutcome::Stopped => {
                    stopped = true;
                    break;
                }
            }
        } else {
            manager.broadcast_to_sync_connections(&[]);
            debug!(frame = state.last_frame.load(Ordering::Acquire), "frame shown");
        }
        frames += 1;
    }

    manager.close();
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(frames, timeouts, stopped, elapsed_ms, "render loop finished");
    print_run_summary(frames, timeouts, stopped, elapsed_ms, format);
    Ok(SUCCESS)
}

fn resolve_config(args: &NodeArgs, topology: &Topology) -> CliResult<ManagerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
            serde_json::from_str(&text).map_err(|err| {
                CliError::new(
                    CONFIG_INVALID,
                    format!("invalid settings in {}: {err}", path.display()),
                )
            })?
        }
        None => ManagerConfig::from_topology(topology),
    };

    if args.loose {
        config.lock_mode = LockMode::Loose;
    }
    if let Some(timeout) = &args.sync_timeout {
        config.sync_timeout = parse_duration(timeout)?;
    }
    if args.print_sync_message {
        config.print_sync_message = true;
    }
    if args.compression.is_some() {
        config.compression = args.compression;
    }
    Ok(config)
}

fn wait_for_cluster(manager: &ConnectionManager, running: &AtomicBool, timeout: Duration) {
    if manager.sync_connection_count() == 0 {
        return;
    }
    info!(nodes = manager.sync_connection_count(), "waiting for cluster nodes");
    let deadline = Instant::now() + timeout;
    while running.load(Ordering::SeqCst) && !manager.all_nodes_connected() {
        if Instant::now() >= deadline {
            warn!(
                connected = manager.active_sync_connection_count(),
                expected = manager.sync_connection_count(),
                "starting without every node"
            );
            return;
        }
        thread::sleep(CONNECT_POLL);
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, manager: Arc<ConnectionManager>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        manager.close();
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

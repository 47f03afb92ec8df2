use clustersync_frame::{compress_bound, HEADER_SIZE};
use clustersync_node::{LockMode, ManagerConfig, FRAME_COUNTER_MODULUS};
use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

/// Wire and frame-lock parameters a peer must agree on.
#[derive(Debug, Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    header_size: usize,
    byte_order: &'static str,
    frame_counter_modulus: i32,
    default_lock_mode: LockMode,
    default_sync_timeout_ms: u64,
    default_max_payload: usize,
    /// Worst-case compressed size of a 1 MiB package.
    compress_bound_1mib: usize,
}

impl BuildInfo {
    fn current() -> Self {
        let defaults = ManagerConfig::default();
        Self {
            name: "clustersync",
            version: env!("CARGO_PKG_VERSION"),
            target: option_env!("CLUSTERSYNC_BUILD_TARGET").unwrap_or("unknown"),
            header_size: HEADER_SIZE,
            byte_order: "little-endian",
            frame_counter_modulus: FRAME_COUNTER_MODULUS,
            default_lock_mode: defaults.lock_mode,
            default_sync_timeout_ms: u64::try_from(defaults.sync_timeout.as_millis())
                .unwrap_or(u64::MAX),
            default_max_payload: defaults.max_payload_size,
            compress_bound_1mib: compress_bound(1024 * 1024),
        }
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("clustersync {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let info = BuildInfo::current();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("name: {}", info.name);
            println!("version: {}", info.version);
            println!("target: {}", info.target);
            println!("header: {} bytes, {}", info.header_size, info.byte_order);
            println!("frame_counter_modulus: {}", info.frame_counter_modulus);
            println!(
                "defaults: lock={:?} sync_timeout={}ms max_payload={}",
                info.default_lock_mode, info.default_sync_timeout_ms, info.default_max_payload
            );
            println!("compress_bound(1 MiB): {}", info.compress_bound_1mib);
        }
    }

    Ok(SUCCESS)
}

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use clustersync_node::NetworkMode;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod control;
pub mod node;
pub mod topology;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a cluster and run a frame-locked demo render loop.
    Node(NodeArgs),
    /// Print the connections a node opens for a topology.
    Topology(TopologyArgs),
    /// Send one command to a master's external control port.
    Control(ControlArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Node(args) => node::run(args, format),
        Command::Topology(args) => topology::run(args, format),
        Command::Control(args) => control::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

/// Which node of the topology this process is, and how it connects.
#[derive(Args, Debug)]
pub struct RoleArgs {
    /// Topology file (JSON).
    #[arg(long, short = 't', value_name = "FILE")]
    pub topology: PathBuf,
    /// Index of this node in the topology.
    #[arg(long, short = 'n', default_value = "0")]
    pub node: usize,
    /// Run as a client dialing the master instead of as the master.
    #[arg(long)]
    pub client: bool,
    /// Use loopback addresses, for clusters on one machine.
    #[arg(long)]
    pub local: bool,
}

impl RoleArgs {
    pub fn mode(&self) -> NetworkMode {
        match (self.client, self.local) {
            (false, false) => NetworkMode::Server,
            (true, false) => NetworkMode::Client,
            (false, true) => NetworkMode::LocalServer,
            (true, true) => NetworkMode::LocalClient,
        }
    }
}

#[derive(Args, Debug)]
pub struct NodeArgs {
    #[command(flatten)]
    pub role: RoleArgs,
    /// Manager settings file (JSON); flags below override it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Stop after K frames. Default: run until Ctrl-C or the master leaves.
    #[arg(long, value_name = "K")]
    pub frames: Option<u64>,
    /// Target frame rate of the demo loop.
    #[arg(long, default_value = "60")]
    pub fps: f64,
    /// Loose frame lock: the master never waits for clients.
    #[arg(long)]
    pub loose: bool,
    /// Longest a frame-lock stage may block (e.g. 60s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub sync_timeout: Option<String>,
    /// Log while a frame-lock stage is waiting.
    #[arg(long)]
    pub print_sync_message: bool,
    /// DEFLATE level (0-9) for data transfer.
    #[arg(long, value_name = "LEVEL")]
    pub compression: Option<u32>,
    /// Master: send a data-transfer package every N frames.
    #[arg(long, value_name = "N")]
    pub transfer_every: Option<u64>,
    /// Master: how long to wait for every client before starting the loop.
    #[arg(long, default_value = "30s", value_name = "DURATION")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct TopologyArgs {
    #[command(flatten)]
    pub role: RoleArgs,
}

#[derive(Args, Debug)]
pub struct ControlArgs {
    /// Master address.
    pub address: String,
    /// External control port.
    pub port: u16,
    /// Command line to send.
    #[arg(long)]
    pub data: String,
    /// How long to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build target and the wire and frame-lock defaults.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration(" ").is_err());
    }

    #[test]
    fn role_flags_select_mode() {
        let role = RoleArgs {
            topology: PathBuf::from("cluster.json"),
            node: 1,
            client: true,
            local: true,
        };
        assert_eq!(role.mode(), NetworkMode::LocalClient);
    }
}

mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "clustersync", version, about = "Frame-locked cluster synchronization CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_subcommand() {
        let cli = Cli::try_parse_from([
            "clustersync",
            "node",
            "--topology",
            "cluster.json",
            "--node",
            "2",
            "--client",
            "--local",
            "--frames",
            "10",
            "--loose",
        ])
        .expect("node args should parse");

        let Command::Node(args) = cli.command else {
            panic!("expected node command");
        };
        assert_eq!(args.role.node, 2);
        assert_eq!(args.frames, Some(10));
        assert!(args.loose);
        assert_eq!(args.role.mode(), clustersync_node::NetworkMode::LocalClient);
    }

    #[test]
    fn node_requires_topology() {
        let err = Cli::try_parse_from(["clustersync", "node", "--node", "1"])
            .expect_err("missing topology should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn control_requires_data() {
        let err = Cli::try_parse_from(["clustersync", "control", "127.0.0.1", "20500"])
            .expect_err("missing data should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "clustersync",
            "topology",
            "--topology",
            "cluster.json",
            "--format",
            "json",
            "--log-level",
            "debug",
        ])
        .expect("global flags should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.log_level, LogLevel::Debug));
    }
}

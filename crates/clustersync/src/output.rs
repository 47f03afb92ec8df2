use std::io::IsTerminal;

use clap::ValueEnum;
use clustersync_node::{PlannedConnection, Topology};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    node: usize,
    mode: &'a str,
    address: &'a str,
    connections: &'a [PlannedConnection],
}

/// Print the connections one node opens.
pub fn print_plan(
    topology: &Topology,
    node: usize,
    mode: &str,
    plan: &[PlannedConnection],
    format: OutputFormat,
) {
    let address = topology
        .nodes
        .get(node)
        .map(|n| n.address.as_str())
        .unwrap_or_default();
    match format {
        OutputFormat::Json => {
            let out = PlanOutput {
                node,
                mode,
                address,
                connections: plan,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ROLE", "SIDE", "ADDRESS", "PORT", "PEER NODE"]);
            for conn in plan {
                table.add_row(vec![
                    conn.role.to_string(),
                    conn.side.to_string(),
                    conn.address.clone(),
                    conn.port.to_string(),
                    peer_label(conn.node),
                ]);
            }
            println!("node {node} ({address}) as {mode}");
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("node={node} address={address} mode={mode}");
            for conn in plan {
                println!(
                    "  role={} side={} address={} port={} peer={}",
                    conn.role,
                    conn.side,
                    conn.address,
                    conn.port,
                    peer_label(conn.node)
                );
            }
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    frames: u64,
    timeouts: u64,
    stopped: bool,
    elapsed_ms: u64,
}

/// Print the result of a render loop.
pub fn print_run_summary(frames: u64, timeouts: u64, stopped: bool, elapsed_ms: u64, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = RunSummary {
                frames,
                timeouts,
                stopped,
                elapsed_ms,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FRAMES", "TIMEOUTS", "STOPPED", "ELAPSED MS"])
                .add_row(vec![
                    frames.to_string(),
                    timeouts.to_string(),
                    stopped.to_string(),
                    elapsed_ms.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("frames={frames} timeouts={timeouts} stopped={stopped} elapsed_ms={elapsed_ms}");
        }
    }
}

fn peer_label(node: Option<usize>) -> String {
    node.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

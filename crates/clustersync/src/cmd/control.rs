use clustersync_node::send_command;
use serde::Serialize;

use crate::cmd::{parse_duration, ControlArgs};
use crate::exit::{node_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct ControlOutput<'a> {
    address: &'a str,
    port: u16,
    command: &'a str,
    reply: &'a str,
    accepted: bool,
}

pub fn run(args: ControlArgs, format: OutputFormat) -> CliResult<i32> {
    if args.port == 0 {
        return Err(CliError::new(USAGE, "port must be nonzero"));
    }
    let timeout = parse_duration(&args.timeout)?;

    let reply = send_command(&args.address, args.port, &args.data, timeout)
        .map_err(|err| node_error("control command failed", err))?;
    let accepted = reply.contains("OK\r\n");

    match format {
        OutputFormat::Json => {
            let out = ControlOutput {
                address: &args.address,
                port: args.port,
                command: args.data.trim_end(),
                reply: &reply,
                accepted,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            for line in reply.lines() {
                println!("{line}");
            }
        }
    }

    if accepted {
        Ok(SUCCESS)
    } else {
        Err(CliError::new(FAILURE, "master closed the session without accepting the command"))
    }
}

use clustersync_node::Topology;

use crate::cmd::TopologyArgs;
use crate::exit::{node_error, CliResult, SUCCESS};
use crate::output::{print_plan, OutputFormat};

pub fn run(args: TopologyArgs, format: OutputFormat) -> CliResult<i32> {
    let path = &args.role.topology;
    let topology = Topology::load(path)
        .map_err(|err| node_error(&format!("failed to load topology {}", path.display()), err))?;

    let mode = args.role.mode();
    let plan = topology
        .plan(args.role.node, mode)
        .map_err(|err| node_error("failed to plan connections", err))?;

    print_plan(&topology, args.role.node, &mode.to_string(), &plan, format);
    Ok(SUCCESS)
}

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{NetworkMode, LOCALHOST};
use crate::error::{NodeError, Result};
use crate::role::{ConnectionRole, ControlMode, Side};

/// One node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub address: String,
    /// Port the master listens on for this node's sync connection.
    pub sync_port: u16,
    /// Port for this node's data-transfer connection, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_transfer_port: Option<u16>,
}

/// Cluster layout shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub master_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_control_port: Option<u16>,
    #[serde(default)]
    pub control_mode: ControlMode,
    #[serde(default)]
    pub firm_sync: bool,
    pub nodes: Vec<NodeAddress>,
}

/// A connection a node will open for a given topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedConnection {
    pub role: ConnectionRole,
    pub side: Side,
    pub address: String,
    pub port: u16,
    /// Index of the remote node, `None` for the external control listener.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<usize>,
}

impl Topology {
    /// Parse and validate a JSON topology.
    pub fn from_json(text: &str) -> Result<Self> {
        let topology: Self = serde_json::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Read, parse and validate a JSON topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Reject empty clusters, missing addresses, port 0 and port reuse.
    ///
    /// The master binds every sync, data-transfer and control port on one
    /// machine, so all of them must be distinct.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(NodeError::Config("topology declares no nodes".to_string()));
        }

        let mut owners: HashMap<u16, String> = HashMap::new();
        let mut claim = |port: u16, owner: String| -> Result<()> {
            if port == 0 {
                return Err(NodeError::Config(format!("no port provided for {owner}")));
            }
            if let Some(previous) = owners.insert(port, owner.clone()) {
                return Err(NodeError::Config(format!(
                    "port {port} is already used by {previous} (also claimed by {owner})"
                )));
            }
            Ok(())
        };

        for (index, node) in self.nodes.iter().enumerate() {
            if node.address.trim().is_empty() {
                return Err(NodeError::Config(format!("node {index} has no address")));
            }
            claim(node.sync_port, format!("node {index} sync"))?;
            if let Some(port) = node.data_transfer_port {
                claim(port, format!("node {index} data transfer"))?;
            }
        }
        if let Some(port) = self.external_control_port {
            claim(port, "external control".to_string())?;
        }
        Ok(())
    }

    /// The connections `this_node` opens in `mode`, in the order they are added.
    ///
    /// A client dials the master's sync port for itself (plus its
    /// data-transfer port). The master listens on every other node's ports,
    /// then on the external control port.
    pub fn plan(&self, this_node: usize, mode: NetworkMode) -> Result<Vec<PlannedConnection>> {
        let Some(me) = self.nodes.get(this_node) else {
            return Err(NodeError::Config(format!(
                "node index {this_node} out of range ({} nodes)",
                self.nodes.len()
            )));
        };

        let remote = if mode.is_local() {
            LOCALHOST.to_string()
        } else if self.master_address.trim().is_empty() {
            return Err(NodeError::Config(
                "no address information for master available".to_string(),
            ));
        } else {
            self.master_address.clone()
        };

        let mut planned = Vec::new();
        if !mode.is_server() {
            planned.push(PlannedConnection {
                role: ConnectionRole::SyncConnection,
                side: Side::Client,
                address: remote.clone(),
                port: me.sync_port,
                node: Some(this_node),
            });
            if let Some(port) = me.data_transfer_port {
                planned.push(PlannedConnection {
                    role: ConnectionRole::DataTransfer,
                    side: Side::Client,
                    address: remote,
                    port,
                    node: Some(this_node),
                });
            }
            return Ok(planned);
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if index == this_node {
                continue;
            }
            planned.push(PlannedConnection {
                role: ConnectionRole::SyncConnection,
                side: Side::Server,
                address: remote.clone(),
                port: node.sync_port,
                node: Some(index),
            });
            if let Some(port) = node.data_transfer_port {
                planned.push(PlannedConnection {
                    role: ConnectionRole::DataTransfer,
                    side: Side::Server,
                    address: remote.clone(),
                    port,
                    node: Some(index),
                });
            }
        }
        if let Some(port) = self.external_control_port {
            planned.push(PlannedConnection {
                role: ConnectionRole::ExternalControl,
                side: Side::Server,
                address: LOCALHOST.to_string(),
                port,
                node: None,
            });
        }
        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"{
        "master_address": "10.0.0.1",
        "external_control_port": 20500,
        "control_mode": "ascii",
        "firm_sync": true,
        "nodes": [
            { "address": "10.0.0.1", "sync_port": 20401, "data_transfer_port": 20501 },
            { "address": "10.0.0.2", "sync_port": 20402, "data_transfer_port": 20502 },
            { "address": "10.0.0.3", "sync_port": 20403 }
        ]
    }"#;

    #[test]
    fn parse_topology() {
        let topology = Topology::from_json(THREE_NODES).expect("topology should parse");
        assert_eq!(topology.nodes.len(), 3);
        assert!(topology.firm_sync);
        assert_eq!(topology.nodes[2].data_transfer_port, None);
    }

    #[test]
    fn server_plan_skips_itself() {
        let topology = Topology::from_json(THREE_NODES).expect("topology should parse");
        let plan = topology
            .plan(0, NetworkMode::Server)
            .expect("server plan should build");

        let summary: Vec<_> = plan.iter().map(|c| (c.role, c.port)).collect();
        assert_eq!(
            summary,
            vec![
                (ConnectionRole::SyncConnection, 20402),
                (ConnectionRole::DataTransfer, 20502),
                (ConnectionRole::SyncConnection, 20403),
                (ConnectionRole::ExternalControl, 20500),
            ]
        );
        assert!(plan.iter().all(|c| c.side == Side::Server));
        assert_eq!(plan[3].address, LOCALHOST);
    }

    #[test]
    fn client_plan_dials_master() {
        let topology = Topology::from_json(THREE_NODES).expect("topology should parse");
        let plan = topology
            .plan(1, NetworkMode::Client)
            .expect("client plan should build");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].address, "10.0.0.1");
        assert_eq!(plan[0].port, 20402);
        assert_eq!(plan[1].role, ConnectionRole::DataTransfer);

        let local = topology
            .plan(2, NetworkMode::LocalClient)
            .expect("local plan should build");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].address, LOCALHOST);
    }

    #[test]
    fn port_reuse_rejected() {
        let text = THREE_NODES.replace("20502", "20401");
        let err = Topology::from_json(&text).expect_err("reused port should fail");
        assert!(matches!(err, NodeError::Config(msg) if msg.contains("20401")));
    }

    #[test]
    fn missing_address_rejected() {
        let text = THREE_NODES.replace("10.0.0.3", " ");
        assert!(matches!(
            Topology::from_json(&text),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn zero_port_rejected() {
        let text = THREE_NODES.replace("20403", "0");
        assert!(matches!(
            Topology::from_json(&text),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn node_index_out_of_range() {
        let topology = Topology::from_json(THREE_NODES).expect("topology should parse");
        assert!(matches!(
            topology.plan(3, NetworkMode::Server),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn remote_mode_needs_master_address() {
        let text = THREE_NODES.replace("\"master_address\": \"10.0.0.1\"", "\"master_address\": \"\"");
        let topology = Topology::from_json(&text).expect("topology should parse");
        assert!(topology.plan(1, NetworkMode::Client).is_err());
        assert!(topology.plan(1, NetworkMode::LocalClient).is_ok());
    }

    #[test]
    fn malformed_json_is_json_error() {
        assert!(matches!(
            Topology::from_json("{ nodes: "),
            Err(NodeError::Json(_))
        ));
    }
}

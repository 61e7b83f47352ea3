//! Serializable snapshot of a running instance.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use trapsync_messager::Stats;
use trapsync_node::NodeInfo;

/// One accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub remote: SocketAddr,
    pub authed: bool,
    pub delay: Duration,
    pub stats: Stats,
}

/// The accept side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Bound address, once serving.
    pub listen: Option<SocketAddr>,
    pub clients: Vec<ClientInfo>,
}

/// Everything [`TrapSync::status`](crate::TrapSync::status) reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    pub nodes: Vec<NodeInfo>,
    pub server: ServerInfo,
}

impl Status {
    /// Number of nodes with an authenticated session.
    pub fn connected_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.connected).count()
    }

    /// Pretty JSON, for logs and CLI output.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

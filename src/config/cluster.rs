//! Cluster Configuration
//!
//! Configuration types for static-peer message relay between nodes.

use std::net::SocketAddr;

use serde::Deserialize;

/// Cluster configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Node identifier (taken from the hostname if not set)
    pub node_id: Option<String>,

    /// Address for peer-to-peer message relay to bind to.
    /// Required when clustering is enabled.
    pub peer_addr: Option<SocketAddr>,

    /// Peers to dial, as "host:port" relay addresses
    pub peers: Vec<String>,
}

impl ClusterConfig {
    /// Get the node ID, falling back to the hostname and then the relay port
    pub fn get_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            return id.clone();
        }
        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(_) => format!(
                "node-{}",
                self.peer_addr.map(|addr| addr.port()).unwrap_or_default()
            ),
        }
    }
}

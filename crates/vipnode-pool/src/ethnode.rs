//! Control interface of the Ethereum node a host or client agent drives.
//!
//! Concrete adapters translate these operations to a node family's admin
//! API (for geth: `admin_addPeer`, `admin_removePeer`,
//! `admin_addTrustedPeer`, `admin_removeTrustedPeer`, `admin_peers`).

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Node software family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Treated like geth where a choice has to be made.
    #[default]
    Unknown,
    Geth,
    Parity,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Unknown => "unknown",
            NodeKind::Geth => "geth",
            NodeKind::Parity => "parity",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "geth" => NodeKind::Geth,
            "parity" => NodeKind::Parity,
            _ => NodeKind::Unknown,
        })
    }
}

/// A peer as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Peer management on a running Ethereum node.
#[async_trait]
pub trait EthNode: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// The node's own enode URI.
    async fn enode(&self) -> Result<String>;

    async fn connect_peer(&self, uri: &str) -> Result<()>;

    async fn disconnect_peer(&self, node_id: &str) -> Result<()>;

    /// Let `node_id` connect even when the node is at its peer limit.
    async fn add_trusted_peer(&self, node_id: &str) -> Result<()>;

    async fn remove_trusted_peer(&self, node_id: &str) -> Result<()>;

    async fn peers(&self) -> Result<Vec<PeerInfo>>;
}

//! Host and client agents: the node-side halves of the pool protocol.

use crate::error::{PoolError, Result};
use crate::ethnode::EthNode;
use crate::pool::{UpdateResponse, NAMESPACE};
use crate::pretty::abbrev;
use crate::remote::RemotePool;
use crate::store::Node;
use std::sync::Arc;
use tracing::{info, warn};
use vipnode_jsonrpc::{Context, Dispatcher, Methods};

async fn report_peers(node: &dyn EthNode, ctx: &Context, pool: &RemotePool) -> Result<UpdateResponse> {
    let peers: Vec<String> = node.peers().await?.into_iter().map(|p| p.id).collect();
    let resp = pool.update(ctx, &peers).await?;
    if !resp.invalid_peers.is_empty() {
        warn!("Pool reported {} invalid peers", resp.invalid_peers.len());
    }
    Ok(resp)
}

/// Serves a full node to the pool's clients.
pub struct HostAgent {
    node: Arc<dyn EthNode>,
    payout: String,
}

impl HostAgent {
    pub fn new(node: Arc<dyn EthNode>, payout: impl Into<String>) -> Self {
        Self {
            node,
            payout: payout.into(),
        }
    }

    /// The callbacks the pool issues to this host.
    pub fn methods(&self) -> Methods {
        let node = Arc::clone(&self.node);
        Methods::new().add("whitelist", move |_cx, (node_id,): (String,)| {
            let node = Arc::clone(&node);
            async move {
                node.add_trusted_peer(&node_id).await?;
                info!("Whitelisted client {}", abbrev(&node_id));
                Ok::<_, PoolError>(())
            }
        })
    }

    /// Register the pool callbacks on the dispatcher of the pool connection.
    pub fn register(&self, dispatcher: &mut Dispatcher) -> Result<()> {
        dispatcher.register(NAMESPACE, self.methods())?;
        Ok(())
    }

    /// Announce the node to the pool as a host.
    pub async fn start(&self, ctx: &Context, pool: &RemotePool) -> Result<()> {
        let uri = self.node.enode().await?;
        pool.host(ctx, self.node.kind().as_str(), &self.payout, &uri)
            .await?;
        info!("Hosting {} node {}", self.node.kind(), abbrev(pool.node_id()));
        Ok(())
    }

    pub async fn update(&self, ctx: &Context, pool: &RemotePool) -> Result<UpdateResponse> {
        report_peers(self.node.as_ref(), ctx, pool).await
    }
}

/// Gets a node admitted to the pool's hosts.
pub struct ClientAgent {
    node: Arc<dyn EthNode>,
}

impl ClientAgent {
    pub fn new(node: Arc<dyn EthNode>) -> Self {
        Self { node }
    }

    /// Ask the pool for hosts and connect the node to each of them.
    pub async fn connect(&self, ctx: &Context, pool: &RemotePool) -> Result<Vec<Node>> {
        let hosts = pool.connect(ctx, self.node.kind().as_str()).await?;
        for host in &hosts {
            self.node.connect_peer(&host.uri).await?;
        }
        info!("Connected to {} hosts", hosts.len());
        Ok(hosts)
    }

    pub async fn update(&self, ctx: &Context, pool: &RemotePool) -> Result<UpdateResponse> {
        report_peers(self.node.as_ref(), ctx, pool).await
    }
}

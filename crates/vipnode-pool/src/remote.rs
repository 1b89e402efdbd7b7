//! Signed client of a pool.

use crate::error::Result;
use crate::pool::UpdateResponse;
use crate::request::{node_id, Request};
use crate::store::Node;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use vipnode_jsonrpc::{call_typed, Context, Service};

/// Proxies pool operations over any [`Service`], signing every request.
pub struct RemotePool {
    service: Arc<dyn Service>,
    key: SigningKey,
    node_id: String,
    nonce: AtomicI64,
}

impl RemotePool {
    pub fn new(service: Arc<dyn Service>, key: SigningKey) -> Self {
        // Seeded from the clock so a restarted node never reuses a nonce.
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            service,
            node_id: node_id(&key),
            key,
            nonce: AtomicI64::new(seed),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn next_nonce(&self) -> i64 {
        self.nonce.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn signed_call<R: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: &str,
        extra_args: Vec<Value>,
    ) -> Result<R> {
        let req = Request {
            method: method.to_string(),
            node_id: self.node_id.clone(),
            nonce: self.next_nonce(),
            extra_args,
        };
        let args = req.signed_args(&self.key)?;
        Ok(call_typed(self.service.as_ref(), ctx, &req.method, args).await?)
    }

    pub async fn host(&self, ctx: &Context, kind: &str, payout: &str, uri: &str) -> Result<()> {
        self.signed_call(
            ctx,
            "vipnode_host",
            vec![Value::from(kind), Value::from(payout), Value::from(uri)],
        )
        .await
    }

    pub async fn connect(&self, ctx: &Context, kind: &str) -> Result<Vec<Node>> {
        self.signed_call(ctx, "vipnode_connect", vec![Value::from(kind)])
            .await
    }

    pub async fn update(&self, ctx: &Context, peers: &[String]) -> Result<UpdateResponse> {
        let peers = serde_json::to_value(peers)?;
        self.signed_call(ctx, "vipnode_update", vec![peers]).await
    }

    pub async fn disconnect(&self, ctx: &Context) -> Result<()> {
        self.signed_call(ctx, "vipnode_disconnect", vec![]).await
    }

    pub async fn withdraw(&self, ctx: &Context) -> Result<()> {
        self.signed_call(ctx, "vipnode_withdraw", vec![]).await
    }

    pub async fn ping(&self, ctx: &Context) -> Result<String> {
        Ok(call_typed(self.service.as_ref(), ctx, "vipnode_ping", ()).await?)
    }
}

impl std::fmt::Debug for RemotePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePool")
            .field("node_id", &self.node_id)
            .field("nonce", &self.nonce.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::PayPerInterval;
    use crate::config::PoolConfig;
    use crate::error::PoolError;
    use crate::pool::VipnodePool;
    use crate::store::{MemoryStore, Store};
    use vipnode_jsonrpc::{Dispatcher, Loopback};

    fn remote_pool(seed: u8) -> (Arc<VipnodePool>, RemotePool) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(PayPerInterval::with_defaults(Arc::clone(&store)));
        let pool = Arc::new(VipnodePool::new(store, ledger, PoolConfig::default()));

        let mut dispatcher = Dispatcher::new();
        pool.register(&mut dispatcher).unwrap();
        let service = Arc::new(Loopback::new(Arc::new(dispatcher)));
        let remote = RemotePool::new(service, SigningKey::from_bytes(&[seed; 32]));
        (pool, remote)
    }

    #[test]
    fn test_nonces_increase() {
        let (_pool, remote) = remote_pool(1);
        let first = remote.next_nonce();
        assert!(remote.next_nonce() > first);
    }

    #[tokio::test]
    async fn test_ping() {
        let (_pool, remote) = remote_pool(2);
        let pong = remote.ping(&Context::background()).await.unwrap();
        assert_eq!(pong, "pong");
    }

    #[tokio::test]
    async fn test_domain_errors_keep_their_code() {
        let (_pool, remote) = remote_pool(3);
        let ctx = Context::background();

        let err = remote.connect(&ctx, "geth").await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32002));
        assert!(err.to_string().contains("no host nodes available"));

        let err = remote.withdraw(&ctx).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32004));

        let err = remote.update(&ctx, &[]).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32005));
    }

    #[tokio::test]
    async fn test_host_registers_node() {
        let (pool, remote) = remote_pool(4);
        let uri = format!("enode://{}@127.0.0.1:30303", remote.node_id());

        remote
            .host(&Context::background(), "geth", "0xpayout", &uri)
            .await
            .unwrap();

        let node = pool.store().get_node(remote.node_id()).unwrap();
        assert!(node.is_host);
        assert_eq!(node.uri, uri);
        assert_eq!(pool.remote_hosts_len(), 1);

        remote.disconnect(&Context::background()).await.unwrap();
        assert_eq!(pool.remote_hosts_len(), 0);
        assert!(pool.store().get_node(remote.node_id()).is_ok());
    }

    #[tokio::test]
    async fn test_update_reports_balance() {
        let (pool, remote) = remote_pool(5);
        pool.store()
            .set_node(&Node::client(remote.node_id(), "geth"), None)
            .unwrap();

        let resp = remote.update(&Context::background(), &[]).await.unwrap();
        assert_eq!(resp.balance.map(|b| b.credit), Some(0));
        assert!(resp.invalid_peers.is_empty());
    }

    #[test]
    fn test_error_type_is_pool_error() {
        let err: PoolError = vipnode_jsonrpc::RpcError::Closed.into();
        assert!(matches!(err, PoolError::Rpc(_)));
    }
}

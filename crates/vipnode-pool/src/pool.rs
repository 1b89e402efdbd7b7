//! The pool service: signed admission of hosts and clients.

use crate::balance::BalanceManager;
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::pretty::abbrev;
use crate::request;
use crate::store::{Balance, Node, NodeId, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;
use vipnode_jsonrpc::{CallContext, Dispatcher, Methods, RpcError, Service};

/// Namespace the pool's operations are registered under.
pub const NAMESPACE: &str = "vipnode";

/// Callback the pool issues to a host to admit a client.
pub const WHITELIST_METHOD: &str = "vipnode_whitelist";

/// Result of an `update` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
    #[serde(default)]
    pub invalid_peers: Vec<NodeId>,
}

/// Check that an `enode://<nodeID>@host:port` URI names `node_id`.
pub fn check_node_uri(node_id: &str, uri: &str) -> Result<()> {
    let mismatch = || PoolError::IdentityMismatch {
        node_id: abbrev(node_id),
        uri: uri.to_string(),
    };
    let parsed = Url::parse(uri).map_err(|_| mismatch())?;
    if parsed.username() != node_id {
        return Err(mismatch());
    }
    Ok(())
}

/// Pool service with balance tracking.
///
/// The store and ledger are injected; the map of live host services is
/// owned by the pool instance.
pub struct VipnodePool {
    store: Arc<dyn Store>,
    balance: Arc<dyn BalanceManager>,
    config: PoolConfig,
    remote_hosts: Mutex<HashMap<NodeId, Arc<dyn Service>>>,
}

impl VipnodePool {
    pub fn new(store: Arc<dyn Store>, balance: Arc<dyn BalanceManager>, config: PoolConfig) -> Self {
        Self {
            store,
            balance,
            config,
            remote_hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of hosts the pool can currently call back into.
    pub fn remote_hosts_len(&self) -> usize {
        self.lock_hosts().len()
    }

    fn lock_hosts(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<dyn Service>>> {
        self.remote_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget every host whose session has gone away.
    fn evict_closed_hosts(&self) {
        let mut hosts = self.lock_hosts();
        let before = hosts.len();
        hosts.retain(|_, service| !service.is_closed());
        let evicted = before - hosts.len();
        if evicted > 0 {
            debug!("Evicted {} closed host services", evicted);
        }
    }

    /// Authenticate a request. The nonce is consumed before the signature
    /// is checked, so a nonce can never be tried twice.
    fn verify(&self, sig: &str, method: &str, node_id: &str, nonce: i64, args: &[Value]) -> Result<()> {
        self.store.check_and_save_nonce(node_id, nonce)?;
        request::verify(sig, method, node_id, nonce, args)
    }

    /// Register a full node as a host of this pool.
    ///
    /// The service the call arrived through is kept so the pool can later
    /// ask the host to whitelist clients.
    #[allow(clippy::too_many_arguments)]
    pub async fn host(
        &self,
        cx: &CallContext,
        sig: &str,
        node_id: &str,
        nonce: i64,
        kind: &str,
        payout: &str,
        uri: &str,
    ) -> Result<()> {
        let args = [Value::from(kind), Value::from(payout), Value::from(uri)];
        self.verify(sig, "vipnode_host", node_id, nonce, &args)?;
        check_node_uri(node_id, uri)?;

        info!("New {:?} host: {:?}", kind, uri);

        let node = Node::host(node_id, kind, uri);
        self.store.set_node(&node, Some(payout))?;
        self.evict_closed_hosts();
        self.lock_hosts().insert(node.id, cx.service());
        Ok(())
    }

    /// Find hosts for a client and ask them to whitelist it.
    pub async fn connect(
        &self,
        cx: &CallContext,
        sig: &str,
        node_id: &str,
        nonce: i64,
        kind: &str,
    ) -> Result<Vec<Node>> {
        self.verify(sig, "vipnode_connect", node_id, nonce, &[Value::from(kind)])?;
        self.evict_closed_hosts();

        let candidates = self
            .store
            .active_hosts(kind, self.config.num_request_hosts)?;
        if candidates.is_empty() {
            info!(
                "New {:?} client: {} (no active hosts found)",
                kind,
                abbrev(node_id)
            );
            return Err(PoolError::NoHosts { tried: 0 });
        }

        if self.config.skip_whitelist {
            info!(
                "New {:?} client: {} ({} hosts found, skipping whitelist)",
                kind,
                abbrev(node_id),
                candidates.len()
            );
            return Ok(candidates);
        }

        let mut errors = Vec::new();
        let mut remotes = Vec::with_capacity(candidates.len());
        {
            let mut hosts = self.lock_hosts();
            for node in &candidates {
                let entry = hosts
                    .get(&node.id)
                    .map(|service| (service.is_closed(), Arc::clone(service)));
                match entry {
                    Some((false, service)) => remotes.push((node.clone(), service)),
                    Some((true, _)) => {
                        debug!("Evicting closed host service {}", abbrev(&node.id));
                        hosts.remove(&node.id);
                        errors.push(missing_remote(&node.id));
                    }
                    None => errors.push(missing_remote(&node.id)),
                }
            }
        }

        self.store.set_node(&Node::client(node_id, kind), None)?;

        let call_ctx = cx.context().with_timeout(self.config.whitelist_timeout);
        let mut whitelists = JoinSet::new();
        let num_remotes = remotes.len();
        let mut unanswered: HashSet<NodeId> =
            remotes.iter().map(|(node, _)| node.id.clone()).collect();
        for (node, service) in remotes {
            let ctx = call_ctx.clone();
            let client = node_id.to_string();
            whitelists.spawn(async move {
                let outcome = service
                    .call(&ctx, WHITELIST_METHOD, vec![Value::from(client)])
                    .await;
                (node, outcome)
            });
        }

        let mut accepted = Vec::with_capacity(num_remotes);
        loop {
            let joined = tokio::select! {
                joined = whitelists.join_next() => joined,
                _ = call_ctx.done() => None,
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((node, outcome)) => {
                    unanswered.remove(&node.id);
                    match outcome {
                        Ok(_) => accepted.push(node),
                        Err(err) => errors.push(format!("host {}: {}", abbrev(&node.id), err)),
                    }
                }
                Err(err) => errors.push(format!("whitelist task failed: {}", err)),
            }
        }
        // Whatever is still running past the deadline is abandoned.
        whitelists.abort_all();
        let mut unanswered: Vec<_> = unanswered.into_iter().collect();
        unanswered.sort();
        for id in unanswered {
            errors.push(format!("host {}: {}", abbrev(&id), RpcError::Cancelled));
        }

        if errors.is_empty() {
            info!(
                "New {:?} client: {} ({} hosts found, {} accepted)",
                kind,
                abbrev(node_id),
                num_remotes,
                accepted.len()
            );
        } else {
            warn!(
                "New {:?} client: {} ({} hosts found, {} accepted) {}",
                kind,
                abbrev(node_id),
                num_remotes,
                accepted.len(),
                PoolError::ConnectFailed {
                    errors: errors.clone()
                }
            );
        }

        if !accepted.is_empty() {
            return Ok(accepted);
        }
        if !errors.is_empty() {
            return Err(PoolError::ConnectFailed { errors });
        }
        Err(PoolError::NoHosts {
            tried: candidates.len(),
        })
    }

    /// Report a node's current peers and settle its balance.
    pub async fn update(
        &self,
        sig: &str,
        node_id: &str,
        nonce: i64,
        peers: Vec<String>,
    ) -> Result<UpdateResponse> {
        let args = [serde_json::to_value(&peers)?];
        self.verify(sig, "vipnode_update", node_id, nonce, &args)?;

        let before_update = self.store.get_node(node_id)?;
        let invalid_peers = self.store.update_node_peers(node_id, &peers)?;
        let valid_peers = self.store.node_peers(node_id)?;
        let balance = self.balance.on_update(&before_update, &valid_peers)?;

        info!(
            "{} update {}: {} peers, {} active, {} invalid. Balance: {}",
            if before_update.is_host { "Host" } else { "Client" },
            abbrev(node_id),
            peers.len(),
            valid_peers.len(),
            invalid_peers.len(),
            balance.credit
        );

        Ok(UpdateResponse {
            balance: Some(balance),
            invalid_peers,
        })
    }

    /// Stop calling back into the node. Its record and balance are kept.
    pub async fn disconnect(&self, sig: &str, node_id: &str, nonce: i64) -> Result<()> {
        self.verify(sig, "vipnode_disconnect", node_id, nonce, &[])?;
        if self.lock_hosts().remove(node_id).is_some() {
            info!("Host disconnected: {}", abbrev(node_id));
        }
        Ok(())
    }

    /// Schedule a balance withdrawal. Settlement is not supported.
    pub async fn withdraw(&self, sig: &str, node_id: &str, nonce: i64) -> Result<()> {
        self.verify(sig, "vipnode_withdraw", node_id, nonce, &[])?;
        Err(PoolError::NotImplemented {
            feature: "withdraw".to_string(),
        })
    }

    pub fn ping(&self) -> &'static str {
        "pong"
    }

    /// The pool's operations as a method table.
    pub fn methods(self: &Arc<Self>) -> Methods {
        let host = Arc::clone(self);
        let connect = Arc::clone(self);
        let update = Arc::clone(self);
        let disconnect = Arc::clone(self);
        let withdraw = Arc::clone(self);
        let ping = Arc::clone(self);

        Methods::new()
            .add(
                "host",
                move |cx, (sig, node_id, nonce, kind, payout, uri): (String, String, i64, String, String, String)| {
                    let pool = Arc::clone(&host);
                    async move {
                        pool.host(&cx, &sig, &node_id, nonce, &kind, &payout, &uri)
                            .await
                    }
                },
            )
            .add(
                "connect",
                move |cx, (sig, node_id, nonce, kind): (String, String, i64, String)| {
                    let pool = Arc::clone(&connect);
                    async move { pool.connect(&cx, &sig, &node_id, nonce, &kind).await }
                },
            )
            .add(
                "update",
                move |_cx, (sig, node_id, nonce, peers): (String, String, i64, Vec<String>)| {
                    let pool = Arc::clone(&update);
                    async move { pool.update(&sig, &node_id, nonce, peers).await }
                },
            )
            .add(
                "disconnect",
                move |_cx, (sig, node_id, nonce): (String, String, i64)| {
                    let pool = Arc::clone(&disconnect);
                    async move { pool.disconnect(&sig, &node_id, nonce).await }
                },
            )
            .add(
                "withdraw",
                move |_cx, (sig, node_id, nonce): (String, String, i64)| {
                    let pool = Arc::clone(&withdraw);
                    async move { pool.withdraw(&sig, &node_id, nonce).await }
                },
            )
            .add("ping", move |_cx, (): ()| {
                let pool = Arc::clone(&ping);
                async move { Ok::<_, PoolError>(pool.ping()) }
            })
    }

    /// Register the pool's operations on `dispatcher` under [`NAMESPACE`].
    pub fn register(self: &Arc<Self>, dispatcher: &mut Dispatcher) -> Result<()> {
        dispatcher.register(NAMESPACE, self.methods())?;
        Ok(())
    }
}

fn missing_remote(node_id: &str) -> String {
    format!("missing remote service for candidate host: {:?}", node_id)
}

impl std::fmt::Debug for VipnodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipnodePool")
            .field("config", &self.config)
            .field("remote_hosts", &self.remote_hosts_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::PayPerInterval;
    use crate::request::{node_id, Request};
    use crate::store::MemoryStore;
    use ed25519_dalek::SigningKey;
    use serde_json::json;
    use vipnode_jsonrpc::{Context, Loopback};

    fn pool() -> Arc<VipnodePool> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(PayPerInterval::with_defaults(Arc::clone(&store)));
        Arc::new(VipnodePool::new(store, ledger, PoolConfig::default()))
    }

    fn call_context() -> CallContext {
        let loopback = Loopback::new(Arc::new(Dispatcher::new()));
        CallContext::new(Context::background(), Arc::new(loopback))
    }

    fn signed(key: &SigningKey, method: &str, nonce: i64, extra: Vec<Value>) -> Vec<Value> {
        Request {
            method: method.to_string(),
            node_id: node_id(key),
            nonce,
            extra_args: extra,
        }
        .signed_args(key)
        .unwrap()
    }

    fn sig_of(args: &[Value]) -> String {
        args[0].as_str().unwrap().to_string()
    }

    #[test]
    fn test_check_node_uri() {
        let id = "ab".repeat(32);
        check_node_uri(&id, &format!("enode://{}@127.0.0.1:30303", id)).unwrap();

        for uri in [
            format!("enode://{}@127.0.0.1:30303", "cd".repeat(32)),
            "enode://127.0.0.1:30303".to_string(),
            "not a uri".to_string(),
        ] {
            let err = check_node_uri(&id, &uri).unwrap_err();
            assert!(matches!(err, PoolError::IdentityMismatch { .. }));
        }
    }

    #[tokio::test]
    async fn test_host_rejects_mismatched_uri() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let uri = format!("enode://{}@127.0.0.1:30303", "cd".repeat(32));
        let args = signed(
            &key,
            "vipnode_host",
            1,
            vec![json!("geth"), json!("payout"), json!(uri)],
        );

        let err = pool
            .host(&call_context(), &sig_of(&args), &node_id(&key), 1, "geth", "payout", &uri)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::IdentityMismatch { .. }));
        assert_eq!(pool.remote_hosts_len(), 0);
    }

    #[tokio::test]
    async fn test_replayed_nonce_is_rejected() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[2u8; 32]);
        let id = node_id(&key);
        let args = signed(&key, "vipnode_disconnect", 7, vec![]);

        pool.disconnect(&sig_of(&args), &id, 7).await.unwrap();
        let err = pool.disconnect(&sig_of(&args), &id, 7).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidNonce { .. }));
    }

    #[tokio::test]
    async fn test_bad_signature_still_consumes_nonce() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let id = node_id(&key);
        let good = signed(&key, "vipnode_disconnect", 5, vec![]);
        let forged = signed(&key, "vipnode_withdraw", 5, vec![]);

        let err = pool.disconnect(&sig_of(&forged), &id, 5).await.unwrap_err();
        assert!(matches!(err, PoolError::Signature { .. }));

        let err = pool.disconnect(&sig_of(&good), &id, 5).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidNonce { .. }));
    }

    #[tokio::test]
    async fn test_connect_without_hosts() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[4u8; 32]);
        let args = signed(&key, "vipnode_connect", 1, vec![json!("geth")]);

        let err = pool
            .connect(&call_context(), &sig_of(&args), &node_id(&key), 1, "geth")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoHosts { tried: 0 }));
    }

    #[tokio::test]
    async fn test_withdraw_not_implemented() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let args = signed(&key, "vipnode_withdraw", 1, vec![]);

        let err = pool
            .withdraw(&sig_of(&args), &node_id(&key), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn test_update_requires_registration() {
        let pool = pool();
        let key = SigningKey::from_bytes(&[6u8; 32]);
        let args = signed(&key, "vipnode_update", 1, vec![json!(Vec::<String>::new())]);

        let err = pool
            .update(&sig_of(&args), &node_id(&key), 1, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnregisteredNode { .. }));
    }

    #[tokio::test]
    async fn test_methods_registered_under_namespace() {
        let pool = pool();
        let mut names: Vec<_> = pool.methods().names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["connect", "disconnect", "host", "ping", "update", "withdraw"]
        );

        let mut dispatcher = Dispatcher::new();
        pool.register(&mut dispatcher).unwrap();
        let loopback = Loopback::new(Arc::new(dispatcher));
        let pong = loopback
            .call(&Context::background(), "vipnode_ping", vec![])
            .await
            .unwrap();
        assert_eq!(pong, json!("pong"));
    }
}

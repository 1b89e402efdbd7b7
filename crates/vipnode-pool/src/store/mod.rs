//! Pool state storage.
//!
//! The [`Store`] trait is the single serialization point for all pool state:
//! nonces, nodes, their peers and balances. Implementations must be safe to
//! share between sessions; every method is one atomic operation.
//!
//! The trait is synchronous to match rusqlite, which is the persistent backend.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hex-encoded public key of a node.
pub type NodeId = String;

/// Opaque payout identity. Several nodes may share one account.
pub type Account = String;

/// Credit amount.
pub type Amount = i64;

/// A node known to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub kind: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub is_host: bool,
}

impl Node {
    /// A host seen now.
    pub fn host(id: impl Into<NodeId>, kind: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            kind: kind.into(),
            last_seen: Utc::now(),
            is_host: true,
        }
    }

    /// A client seen now.
    pub fn client(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: String::new(),
            kind: kind.into(),
            last_seen: Utc::now(),
            is_host: false,
        }
    }
}

/// Balance of an account, or the trial balance of a node without one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub account: Account,
    pub credit: Amount,
    /// On-chain deposit, for contract-backed settlement.
    #[serde(default)]
    pub deposit: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_withdraw: Option<DateTime<Utc>>,
}

impl std::fmt::Display for Balance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let account = if self.account.is_empty() {
            "(null account)"
        } else {
            self.account.as_str()
        };
        write!(f, "Balance({:?}, {})", account, self.credit)
    }
}

/// Storage contract used by the pool.
pub trait Store: Send + Sync {
    /// Accept `nonce` only if it is strictly greater than the last accepted
    /// nonce for `node_id`, and record it.
    fn check_and_save_nonce(&self, node_id: &str, nonce: i64) -> Result<()>;

    /// Current balance of an account. Unknown accounts have an empty balance.
    fn get_balance(&self, account: &str) -> Result<Balance>;

    /// Add `credit` (possibly negative) to an account.
    fn add_balance(&self, account: &str, credit: Amount) -> Result<()>;

    /// Balance of the node's account, or its trial balance if it has none.
    fn get_node_balance(&self, node_id: &str) -> Result<Balance>;

    /// Add `credit` to the node's account, or to its trial balance.
    fn add_node_balance(&self, node_id: &str, credit: Amount) -> Result<()>;

    /// Credit each `(node, amount)` in `to` and debit `from` the total, as
    /// one operation. Either every balance changes or none does.
    fn transfer(&self, from: &str, to: &[(NodeId, Amount)]) -> Result<()>;

    /// Load a node. Fails with `UnregisteredNode` if unknown.
    fn get_node(&self, node_id: &str) -> Result<Node>;

    /// Insert or update a node, keeping its tracked peers. An existing
    /// account is kept unless `account` names a new one.
    fn set_node(&self, node: &Node, account: Option<&str>) -> Result<()>;

    /// Forget a node and its peer tracking.
    fn remove_node(&self, node_id: &str) -> Result<()>;

    /// Hosts of `kind` (any kind if empty) seen recently, at most `limit`
    /// of them (0 means no limit).
    fn active_hosts(&self, kind: &str, limit: usize) -> Result<Vec<Node>>;

    /// The peers currently tracked for a node.
    fn node_peers(&self, node_id: &str) -> Result<Vec<Node>>;

    /// Mark the node and the known nodes among `peers` as seen now. Tracked
    /// peers missing from `peers` are dropped and returned.
    fn update_node_peers(&self, node_id: &str, peers: &[String]) -> Result<Vec<NodeId>>;
}

/// Cutoff for a host to count as active, given the keepalive interval.
pub(crate) fn active_since(now: DateTime<Utc>, keepalive: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(keepalive * 2)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn validate_node(node: &Node) -> Result<()> {
    if node.id.is_empty() {
        return Err(crate::error::PoolError::MalformedNode {
            message: "node ID is empty".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract_tests {
    //! Behavior every backend must share. Each backend's test module runs
    //! these against a fresh instance.

    use super::*;
    use crate::error::PoolError;

    pub fn nonce_is_strictly_increasing(store: &dyn Store) {
        store.check_and_save_nonce("a", 1).unwrap();
        store.check_and_save_nonce("a", 5).unwrap();
        for stale in [5, 4, 0, -1] {
            assert!(matches!(
                store.check_and_save_nonce("a", stale),
                Err(PoolError::InvalidNonce { .. })
            ));
        }
        // Per node.
        store.check_and_save_nonce("b", 1).unwrap();
    }

    pub fn set_node_rejects_empty_id(store: &dyn Store) {
        let err = store.set_node(&Node::client("", "geth"), None).unwrap_err();
        assert!(matches!(err, PoolError::MalformedNode { .. }));
    }

    pub fn get_node_roundtrip(store: &dyn Store) {
        assert!(matches!(
            store.get_node("missing"),
            Err(PoolError::UnregisteredNode { .. })
        ));

        let node = Node::host("h1", "geth", "enode://h1@127.0.0.1:30303");
        store.set_node(&node, Some("0xpayout")).unwrap();
        let loaded = store.get_node("h1").unwrap();
        assert_eq!(loaded.id, "h1");
        assert_eq!(loaded.uri, node.uri);
        assert_eq!(loaded.kind, "geth");
        assert!(loaded.is_host);
        assert_eq!(loaded.last_seen.timestamp_millis(), node.last_seen.timestamp_millis());

        store.remove_node("h1").unwrap();
        assert!(store.get_node("h1").is_err());
    }

    pub fn active_hosts_filters(store: &dyn Store) {
        let stale = Node {
            last_seen: Utc::now() - chrono::Duration::hours(1),
            ..Node::host("stale", "geth", "")
        };
        store.set_node(&stale, None).unwrap();
        store.set_node(&Node::host("g1", "geth", ""), None).unwrap();
        store.set_node(&Node::host("g2", "geth", ""), None).unwrap();
        store.set_node(&Node::host("p1", "parity", ""), None).unwrap();
        store.set_node(&Node::client("c1", "geth"), None).unwrap();

        let mut geth: Vec<_> = store
            .active_hosts("geth", 0)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        geth.sort();
        assert_eq!(geth, vec!["g1", "g2"]);

        assert_eq!(store.active_hosts("geth", 1).unwrap().len(), 1);
        assert_eq!(store.active_hosts("", 0).unwrap().len(), 3);
        assert!(store.active_hosts("besu", 0).unwrap().is_empty());
    }

    pub fn balances_follow_accounts(store: &dyn Store) {
        store.set_node(&Node::host("h1", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::host("h2", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::client("c1", "geth"), None).unwrap();

        store.add_node_balance("h1", 100).unwrap();
        store.add_node_balance("h2", 50).unwrap();
        store.add_node_balance("c1", -30).unwrap();

        let shared = store.get_balance("acct").unwrap();
        assert_eq!(shared.credit, 150);
        assert_eq!(shared.account, "acct");
        assert_eq!(store.get_node_balance("h2").unwrap().credit, 150);

        let trial = store.get_node_balance("c1").unwrap();
        assert_eq!(trial.credit, -30);
        assert_eq!(trial.account, "");

        assert_eq!(store.get_balance("nobody").unwrap().credit, 0);
        store.add_balance("nobody", 7).unwrap();
        assert_eq!(store.get_balance("nobody").unwrap().credit, 7);
    }

    pub fn set_node_keeps_account(store: &dyn Store) {
        store.set_node(&Node::host("h1", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::host("h1", "geth", ""), None).unwrap();
        store.add_node_balance("h1", 10).unwrap();
        assert_eq!(store.get_balance("acct").unwrap().credit, 10);
    }

    pub fn update_node_peers_tracks_known_peers(store: &dyn Store) {
        assert!(matches!(
            store.update_node_peers("c1", &[]),
            Err(PoolError::UnregisteredNode { .. })
        ));

        let before = Utc::now() - chrono::Duration::seconds(30);
        let client = Node {
            last_seen: before,
            ..Node::client("c1", "geth")
        };
        store.set_node(&client, None).unwrap();
        store.set_node(&Node::host("h1", "geth", ""), None).unwrap();
        store.set_node(&Node::host("h2", "geth", ""), None).unwrap();

        let inactive = store
            .update_node_peers("c1", &["h1".into(), "h2".into(), "stranger".into()])
            .unwrap();
        assert!(inactive.is_empty());
        assert!(store.get_node("c1").unwrap().last_seen > before);

        let mut peers: Vec<_> = store
            .node_peers("c1")
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        peers.sort();
        assert_eq!(peers, vec!["h1", "h2"]);

        // Peers survive a re-registration of the node.
        store.set_node(&Node::client("c1", "geth"), None).unwrap();
        assert_eq!(store.node_peers("c1").unwrap().len(), 2);

        let inactive = store.update_node_peers("c1", &["h2".into()]).unwrap();
        assert_eq!(inactive, vec!["h1".to_string()]);
        let peers: Vec<_> = store
            .node_peers("c1")
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(peers, vec!["h2"]);
    }

    pub fn transfer_is_zero_sum(store: &dyn Store) {
        store.set_node(&Node::host("h1", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::host("h2", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::host("h3", "geth", ""), None).unwrap();
        store.set_node(&Node::client("c1", "geth"), None).unwrap();

        store
            .transfer(
                "c1",
                &[("h1".into(), 300), ("h2".into(), 300), ("h3".into(), 400)],
            )
            .unwrap();

        assert_eq!(store.get_balance("acct").unwrap().credit, 600);
        assert_eq!(store.get_node_balance("h3").unwrap().credit, 400);
        assert_eq!(store.get_node_balance("c1").unwrap().credit, -1000);
    }

    pub fn transfer_is_all_or_nothing(store: &dyn Store) {
        store.set_node(&Node::host("h1", "geth", ""), Some("acct")).unwrap();
        store.set_node(&Node::host("h2", "geth", ""), None).unwrap();
        store.set_node(&Node::client("c1", "geth"), None).unwrap();
        store.add_node_balance("h2", i64::MAX).unwrap();

        // The second credit overflows after the first one was applied.
        let err = store
            .transfer("c1", &[("h1".into(), 1000), ("h2".into(), 1000)])
            .unwrap_err();
        assert!(matches!(err, PoolError::Configuration { .. }));
        assert_eq!(store.get_balance("acct").unwrap().credit, 0);
        assert_eq!(store.get_node_balance("h2").unwrap().credit, i64::MAX);
        assert_eq!(store.get_node_balance("c1").unwrap().credit, 0);

        let err = store
            .transfer("c1", &[("h1".into(), 1000), ("missing".into(), 1000)])
            .unwrap_err();
        assert!(matches!(err, PoolError::UnregisteredNode { .. }));
        assert_eq!(store.get_balance("acct").unwrap().credit, 0);
        assert_eq!(store.get_node_balance("c1").unwrap().credit, 0);
    }

    pub fn run_all(make: impl Fn() -> Box<dyn Store>) {
        nonce_is_strictly_increasing(make().as_ref());
        set_node_rejects_empty_id(make().as_ref());
        get_node_roundtrip(make().as_ref());
        active_hosts_filters(make().as_ref());
        balances_follow_accounts(make().as_ref());
        set_node_keeps_account(make().as_ref());
        update_node_peers_tracks_known_peers(make().as_ref());
        transfer_is_zero_sum(make().as_ref());
        transfer_is_all_or_nothing(make().as_ref());
    }
}

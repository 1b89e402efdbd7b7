//! Ephemeral in-memory store.

use super::{active_since, validate_node, Account, Amount, Balance, Node, NodeId, Store};
use crate::config::StoreDefaults;
use crate::error::{PoolError, Result};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct NodeRecord {
    node: Node,
    account: Option<Account>,
    /// Last seen per peer; only pool-registered peers are tracked.
    peers: HashMap<NodeId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<Account, Balance>,
    trial_balances: HashMap<NodeId, Balance>,
    nodes: HashMap<NodeId, NodeRecord>,
    nonces: HashMap<NodeId, i64>,
}

/// Where a node's credit is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BalanceKey {
    Account(Account),
    Trial(NodeId),
}

impl MemoryState {
    fn record(&self, node_id: &str) -> Result<&NodeRecord> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| PoolError::UnregisteredNode {
                node_id: node_id.to_string(),
            })
    }

    fn balance_key(&self, node_id: &str) -> Result<BalanceKey> {
        Ok(match &self.record(node_id)?.account {
            Some(account) => BalanceKey::Account(account.clone()),
            None => BalanceKey::Trial(node_id.to_string()),
        })
    }

    fn balance(&self, key: &BalanceKey) -> Option<&Balance> {
        match key {
            BalanceKey::Account(account) => self.balances.get(account),
            BalanceKey::Trial(node_id) => self.trial_balances.get(node_id),
        }
    }

    fn balance_mut(&mut self, key: BalanceKey) -> &mut Balance {
        match key {
            BalanceKey::Account(account) => self
                .balances
                .entry(account.clone())
                .or_insert_with(|| Balance {
                    account,
                    ..Balance::default()
                }),
            BalanceKey::Trial(node_id) => self.trial_balances.entry(node_id).or_default(),
        }
    }

    fn node_balance_mut(&mut self, node_id: &str) -> Result<&mut Balance> {
        let key = self.balance_key(node_id)?;
        Ok(self.balance_mut(key))
    }
}

fn overflow(amount: Amount, credit: Amount) -> PoolError {
    PoolError::configuration(format!(
        "credit overflow adding {} to {}",
        amount, credit
    ))
}

fn credit(balance: &mut Balance, amount: Amount) -> Result<()> {
    balance.credit = balance
        .credit
        .checked_add(amount)
        .ok_or_else(|| overflow(amount, balance.credit))?;
    Ok(())
}

/// A store that keeps everything in process memory, guarded by one mutex.
///
/// Useful for tests and single-process deployments; nothing survives a restart.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    keepalive: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_keepalive(StoreDefaults::KEEPALIVE_INTERVAL)
    }

    pub fn with_keepalive(keepalive: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            keepalive,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| PoolError::Database {
            message: "Failed to acquire memory store lock".to_string(),
            source: None,
        })
    }
}

impl Store for MemoryStore {
    fn check_and_save_nonce(&self, node_id: &str, nonce: i64) -> Result<()> {
        let mut state = self.lock_state()?;
        if let Some(last) = state.nonces.get(node_id) {
            if *last >= nonce {
                return Err(PoolError::InvalidNonce {
                    node_id: node_id.to_string(),
                    nonce,
                });
            }
        }
        state.nonces.insert(node_id.to_string(), nonce);
        Ok(())
    }

    fn get_balance(&self, account: &str) -> Result<Balance> {
        let state = self.lock_state()?;
        Ok(state.balances.get(account).cloned().unwrap_or_else(|| Balance {
            account: account.to_string(),
            ..Balance::default()
        }))
    }

    fn add_balance(&self, account: &str, amount: Amount) -> Result<()> {
        let mut state = self.lock_state()?;
        let balance = state
            .balances
            .entry(account.to_string())
            .or_insert_with(|| Balance {
                account: account.to_string(),
                ..Balance::default()
            });
        credit(balance, amount)
    }

    fn get_node_balance(&self, node_id: &str) -> Result<Balance> {
        let mut state = self.lock_state()?;
        Ok(state.node_balance_mut(node_id)?.clone())
    }

    fn add_node_balance(&self, node_id: &str, amount: Amount) -> Result<()> {
        let mut state = self.lock_state()?;
        credit(state.node_balance_mut(node_id)?, amount)
    }

    fn transfer(&self, from: &str, to: &[(NodeId, Amount)]) -> Result<()> {
        let mut state = self.lock_state()?;

        let mut total: Amount = 0;
        let mut moves = Vec::with_capacity(to.len() + 1);
        for (node_id, amount) in to {
            total = total
                .checked_add(*amount)
                .ok_or_else(|| overflow(*amount, total))?;
            moves.push((state.balance_key(node_id)?, *amount));
        }
        let debit = total
            .checked_neg()
            .ok_or_else(|| PoolError::configuration("credit overflow negating transfer total"))?;
        moves.push((state.balance_key(from)?, debit));

        // Settle every sum before touching the state.
        let mut settled: HashMap<BalanceKey, Amount> = HashMap::new();
        for (key, amount) in moves {
            let current = match settled.get(&key) {
                Some(credit) => *credit,
                None => state.balance(&key).map_or(0, |balance| balance.credit),
            };
            let next = current
                .checked_add(amount)
                .ok_or_else(|| overflow(amount, current))?;
            settled.insert(key, next);
        }
        for (key, credit) in settled {
            state.balance_mut(key).credit = credit;
        }
        Ok(())
    }

    fn get_node(&self, node_id: &str) -> Result<Node> {
        let state = self.lock_state()?;
        Ok(state.record(node_id)?.node.clone())
    }

    fn set_node(&self, node: &Node, account: Option<&str>) -> Result<()> {
        validate_node(node)?;
        let account = account.filter(|a| !a.is_empty()).map(str::to_string);

        let mut state = self.lock_state()?;
        match state.nodes.entry(node.id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.node = node.clone();
                if account.is_some() {
                    record.account = account;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(NodeRecord {
                    node: node.clone(),
                    account,
                    peers: HashMap::new(),
                });
            }
        }
        Ok(())
    }

    fn remove_node(&self, node_id: &str) -> Result<()> {
        let mut state = self.lock_state()?;
        state.nodes.remove(node_id);
        Ok(())
    }

    fn active_hosts(&self, kind: &str, limit: usize) -> Result<Vec<Node>> {
        let seen_since = active_since(Utc::now(), self.keepalive);
        let state = self.lock_state()?;

        // HashMap iteration order is unspecified, which spreads clients
        // across hosts well enough.
        let hosts = state
            .nodes
            .values()
            .map(|record| &record.node)
            .filter(|node| node.is_host)
            .filter(|node| kind.is_empty() || node.kind == kind)
            .filter(|node| node.last_seen > seen_since)
            .cloned();

        Ok(if limit == 0 {
            hosts.collect()
        } else {
            hosts.take(limit).collect()
        })
    }

    fn node_peers(&self, node_id: &str) -> Result<Vec<Node>> {
        let state = self.lock_state()?;
        let record = state.record(node_id)?;
        Ok(record
            .peers
            .keys()
            .filter_map(|peer| state.nodes.get(peer))
            .map(|peer| peer.node.clone())
            .collect())
    }

    fn update_node_peers(&self, node_id: &str, peers: &[String]) -> Result<Vec<NodeId>> {
        let now = Utc::now();
        let mut state = self.lock_state()?;
        state.record(node_id)?;

        let known: Vec<NodeId> = peers
            .iter()
            .filter(|peer| state.nodes.contains_key(peer.as_str()))
            .cloned()
            .collect();

        let record = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PoolError::UnregisteredNode {
                node_id: node_id.to_string(),
            })?;
        record.node.last_seen = now;

        let mut inactive: Vec<NodeId> = record
            .peers
            .keys()
            .filter(|peer| !known.contains(*peer))
            .cloned()
            .collect();
        inactive.sort();
        for peer in &inactive {
            record.peers.remove(peer);
        }
        for peer in known {
            record.peers.insert(peer, now);
        }
        Ok(inactive)
    }
}

//! Ledger accrual.
//!
//! Billing is driven by client updates: every time a client reports its
//! peers, each host among them is paid for the time since the client was
//! last seen, and the client pays the total.

use crate::config::PoolDefaults;
use crate::error::{PoolError, Result};
use crate::pretty::abbrev;
use crate::store::{Amount, Balance, Node, NodeId, Store};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Turns node updates into balance changes.
pub trait BalanceManager: Send + Sync {
    /// Settle the time since `node` (its state before this update) was last
    /// seen against `peers`, returning the node's resulting balance.
    fn on_update(&self, node: &Node, peers: &[Node]) -> Result<Balance>;
}

/// Pays hosts a fixed amount of credit per interval of client connection time.
pub struct PayPerInterval {
    store: Arc<dyn Store>,
    credit_per_interval: Amount,
    interval: Duration,
}

impl PayPerInterval {
    pub fn new(store: Arc<dyn Store>, credit_per_interval: Amount, interval: Duration) -> Self {
        Self {
            store,
            credit_per_interval,
            interval,
        }
    }

    /// A ledger with the default rate.
    pub fn with_defaults(store: Arc<dyn Store>) -> Self {
        Self::new(
            store,
            PoolDefaults::CREDIT_PER_INTERVAL,
            PoolDefaults::INTERVAL,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(PoolError::configuration(
                "PayPerInterval: interval must be positive",
            ));
        }
        if self.credit_per_interval == 0 {
            return Err(PoolError::configuration(
                "PayPerInterval: credit per interval must be non-zero",
            ));
        }
        Ok(())
    }

    /// Credit owed to one host for the time between `since` and `now`.
    fn credit_for(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<Amount> {
        let elapsed_ms = (now - since).num_milliseconds().max(0);
        let interval_ms = i64::try_from(self.interval.as_millis())
            .map_err(|_| PoolError::configuration("PayPerInterval: interval too long"))?;

        // Whole seconds, rounded down, to keep payouts independent of clock
        // resolution.
        let elapsed_secs = elapsed_ms / 1000;
        let interval_secs = interval_ms / 1000;
        if interval_secs == 0 {
            return Err(PoolError::configuration(
                "PayPerInterval: interval must be at least one second",
            ));
        }

        self.credit_per_interval
            .checked_mul(elapsed_secs)
            .map(|total| total / interval_secs)
            .ok_or_else(|| {
                PoolError::configuration(format!(
                    "PayPerInterval: credit overflow for {}s elapsed",
                    elapsed_secs
                ))
            })
    }

    /// [`BalanceManager::on_update`] with an explicit clock.
    pub fn on_update_at(&self, node: &Node, peers: &[Node], now: DateTime<Utc>) -> Result<Balance> {
        self.validate()?;

        if node.is_host {
            return self.store.get_node_balance(&node.id);
        }

        let credit = self.credit_for(node.last_seen, now)?;
        let payees: Vec<(NodeId, Amount)> = peers
            .iter()
            .filter(|peer| peer.is_host)
            .map(|peer| (peer.id.clone(), credit))
            .collect();

        if credit != 0 && !payees.is_empty() {
            self.store.transfer(&node.id, &payees)?;
            debug!(
                "Client {} paid {} to each of {} hosts",
                abbrev(&node.id),
                credit,
                payees.len()
            );
        }

        self.store.get_node_balance(&node.id)
    }
}

impl BalanceManager for PayPerInterval {
    fn on_update(&self, node: &Node, peers: &[Node]) -> Result<Balance> {
        self.on_update_at(node, peers, Utc::now())
    }
}

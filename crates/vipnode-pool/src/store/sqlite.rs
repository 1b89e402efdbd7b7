//! SQLite-backed persistent store.

use super::{active_since, validate_node, Amount, Balance, Node, NodeId, Store};
use crate::config::StoreDefaults;
use crate::error::{PoolError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const NODE_COLUMNS: &str = "id, uri, kind, last_seen, is_host";

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        uri: row.get(1)?,
        kind: row.get(2)?,
        last_seen: from_millis(row.get(3)?),
        is_host: row.get(4)?,
    })
}

fn overflow(amount: Amount, credit: Amount) -> PoolError {
    PoolError::configuration(format!(
        "credit overflow adding {} to {}",
        amount, credit
    ))
}

/// SQLite store for pool state.
///
/// Uses WAL mode and `Arc<Mutex<Connection>>` for thread safety within a
/// process. Every trait method runs in its own transaction.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    keepalive: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| PoolError::Database {
                    message: format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ),
                    source: None,
                })?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            keepalive: StoreDefaults::KEEPALIVE_INTERVAL,
        })
    }

    /// Override how long hosts stay active without an update.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA foreign_keys=ON;",
            StoreDefaults::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nonces (
                node_id TEXT PRIMARY KEY,
                nonce INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                uri TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT '',
                last_seen INTEGER NOT NULL,
                is_host INTEGER NOT NULL DEFAULT 0,
                account TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_active_hosts
                ON nodes(is_host, kind, last_seen);

            CREATE TABLE IF NOT EXISTS node_peers (
                node_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (node_id, peer_id)
            );

            CREATE TABLE IF NOT EXISTS balances (
                account TEXT PRIMARY KEY,
                credit INTEGER NOT NULL DEFAULT 0,
                deposit INTEGER NOT NULL DEFAULT 0,
                next_withdraw INTEGER
            );

            CREATE TABLE IF NOT EXISTS trial_balances (
                node_id TEXT PRIMARY KEY,
                credit INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PoolError::Database {
            message: "Failed to acquire store connection lock".to_string(),
            source: None,
        })
    }

    /// The node's account, `None` for trial nodes. Fails for unknown nodes.
    fn node_account(tx: &Transaction<'_>, node_id: &str) -> Result<Option<String>> {
        tx.query_row(
            "SELECT account FROM nodes WHERE id = ?1",
            params![node_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .ok_or_else(|| PoolError::UnregisteredNode {
            node_id: node_id.to_string(),
        })
    }

    fn read_balance(tx: &Transaction<'_>, account: &str) -> Result<Balance> {
        let balance = tx
            .query_row(
                "SELECT credit, deposit, next_withdraw FROM balances WHERE account = ?1",
                params![account],
                |row| {
                    Ok(Balance {
                        account: account.to_string(),
                        credit: row.get(0)?,
                        deposit: row.get(1)?,
                        next_withdraw: row.get::<_, Option<i64>>(2)?.map(from_millis),
                    })
                },
            )
            .optional()?;
        Ok(balance.unwrap_or_else(|| Balance {
            account: account.to_string(),
            ..Balance::default()
        }))
    }

    fn credit_account(tx: &Transaction<'_>, account: &str, amount: Amount) -> Result<()> {
        let current = Self::read_balance(tx, account)?.credit;
        let total = current
            .checked_add(amount)
            .ok_or_else(|| overflow(amount, current))?;
        tx.execute(
            "INSERT INTO balances (account, credit) VALUES (?1, ?2)
             ON CONFLICT(account) DO UPDATE SET credit = excluded.credit",
            params![account, total],
        )?;
        Ok(())
    }

    fn read_trial_balance(tx: &Transaction<'_>, node_id: &str) -> Result<Balance> {
        let credit: Option<i64> = tx
            .query_row(
                "SELECT credit FROM trial_balances WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Balance {
            credit: credit.unwrap_or(0),
            ..Balance::default()
        })
    }

    fn credit_node(tx: &Transaction<'_>, node_id: &str, amount: Amount) -> Result<()> {
        match Self::node_account(tx, node_id)? {
            Some(account) => Self::credit_account(tx, &account, amount),
            None => Self::credit_trial(tx, node_id, amount),
        }
    }

    fn credit_trial(tx: &Transaction<'_>, node_id: &str, amount: Amount) -> Result<()> {
        let current = Self::read_trial_balance(tx, node_id)?.credit;
        let total = current
            .checked_add(amount)
            .ok_or_else(|| overflow(amount, current))?;
        tx.execute(
            "INSERT INTO trial_balances (node_id, credit) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET credit = excluded.credit",
            params![node_id, total],
        )?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn check_and_save_nonce(&self, node_id: &str, nonce: i64) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let last: Option<i64> = tx
            .query_row(
                "SELECT nonce FROM nonces WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        if last.is_some_and(|last| last >= nonce) {
            return Err(PoolError::InvalidNonce {
                node_id: node_id.to_string(),
                nonce,
            });
        }
        tx.execute(
            "INSERT INTO nonces (node_id, nonce) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET nonce = excluded.nonce",
            params![node_id, nonce],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_balance(&self, account: &str) -> Result<Balance> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::read_balance(&tx, account)
    }

    fn add_balance(&self, account: &str, credit: Amount) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::credit_account(&tx, account, credit)?;
        tx.commit()?;
        Ok(())
    }

    fn get_node_balance(&self, node_id: &str) -> Result<Balance> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        match Self::node_account(&tx, node_id)? {
            Some(account) => Self::read_balance(&tx, &account),
            None => Self::read_trial_balance(&tx, node_id),
        }
    }

    fn add_node_balance(&self, node_id: &str, credit: Amount) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::credit_node(&tx, node_id, credit)?;
        tx.commit()?;
        Ok(())
    }

    fn transfer(&self, from: &str, to: &[(NodeId, Amount)]) -> Result<()> {
        let mut total: Amount = 0;
        for (_, amount) in to {
            total = total
                .checked_add(*amount)
                .ok_or_else(|| overflow(*amount, total))?;
        }
        let debit = total
            .checked_neg()
            .ok_or_else(|| PoolError::configuration("credit overflow negating transfer total"))?;

        let mut conn = self.lock_conn()?;
        // Dropping the transaction on any error rolls back the credits already made.
        let tx = conn.transaction()?;
        for (node_id, amount) in to {
            Self::credit_node(&tx, node_id, *amount)?;
        }
        Self::credit_node(&tx, from, debit)?;
        tx.commit()?;
        Ok(())
    }

    fn get_node(&self, node_id: &str) -> Result<Node> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
            params![node_id],
            node_from_row,
        )
        .optional()?
        .ok_or_else(|| PoolError::UnregisteredNode {
            node_id: node_id.to_string(),
        })
    }

    fn set_node(&self, node: &Node, account: Option<&str>) -> Result<()> {
        validate_node(node)?;
        let account = account.filter(|a| !a.is_empty());

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO nodes (id, uri, kind, last_seen, is_host, account)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                uri = excluded.uri,
                kind = excluded.kind,
                last_seen = excluded.last_seen,
                is_host = excluded.is_host,
                account = COALESCE(excluded.account, nodes.account)",
            params![
                node.id,
                node.uri,
                node.kind,
                to_millis(node.last_seen),
                node.is_host,
                account
            ],
        )?;
        Ok(())
    }

    fn remove_node(&self, node_id: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM node_peers WHERE node_id = ?1", params![node_id])?;
        tx.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])?;
        tx.commit()?;
        Ok(())
    }

    fn active_hosts(&self, kind: &str, limit: usize) -> Result<Vec<Node>> {
        let seen_since = to_millis(active_since(Utc::now(), self.keepalive));
        // SQLite treats a negative LIMIT as no limit.
        let limit = if limit == 0 {
            -1
        } else {
            i64::try_from(limit).unwrap_or(i64::MAX)
        };

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes
             WHERE is_host = 1 AND (?1 = '' OR kind = ?1) AND last_seen > ?2
             ORDER BY RANDOM()
             LIMIT ?3",
            NODE_COLUMNS
        ))?;
        let hosts = stmt
            .query_map(params![kind, seen_since, limit], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hosts)
    }

    fn node_peers(&self, node_id: &str) -> Result<Vec<Node>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::node_account(&tx, node_id)?;

        let mut stmt = tx.prepare(
            "SELECT n.id, n.uri, n.kind, n.last_seen, n.is_host
             FROM node_peers p JOIN nodes n ON n.id = p.peer_id
             WHERE p.node_id = ?1
             ORDER BY n.id",
        )?;
        let peers = stmt
            .query_map(params![node_id], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(peers)
    }

    fn update_node_peers(&self, node_id: &str, peers: &[String]) -> Result<Vec<NodeId>> {
        let now = to_millis(Utc::now());
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE nodes SET last_seen = ?1 WHERE id = ?2",
            params![now, node_id],
        )?;
        if updated == 0 {
            return Err(PoolError::UnregisteredNode {
                node_id: node_id.to_string(),
            });
        }

        let mut known = HashSet::new();
        {
            let mut exists = tx.prepare("SELECT 1 FROM nodes WHERE id = ?1")?;
            for peer in peers {
                if exists.exists(params![peer])? {
                    known.insert(peer.clone());
                }
            }
        }

        let tracked: Vec<NodeId> = {
            let mut stmt =
                tx.prepare("SELECT peer_id FROM node_peers WHERE node_id = ?1 ORDER BY peer_id")?;
            let rows = stmt
                .query_map(params![node_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let inactive: Vec<NodeId> = tracked
            .into_iter()
            .filter(|peer| !known.contains(peer))
            .collect();

        for peer in &inactive {
            tx.execute(
                "DELETE FROM node_peers WHERE node_id = ?1 AND peer_id = ?2",
                params![node_id, peer],
            )?;
        }
        for peer in &known {
            tx.execute(
                "INSERT INTO node_peers (node_id, peer_id, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(node_id, peer_id) DO UPDATE SET last_seen = excluded.last_seen",
                params![node_id, peer, now],
            )?;
        }
        tx.commit()?;

        debug!(
            "Updated peers of {}: {} tracked, {} inactive",
            crate::pretty::abbrev(node_id),
            known.len(),
            inactive.len()
        );
        Ok(inactive)
    }
}

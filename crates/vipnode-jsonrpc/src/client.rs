//! The calling half of a session.
//!
//! A [`Caller`] assigns correlation ids to outbound calls and keeps the
//! table of calls still waiting for their result. It never touches a codec:
//! the owning session (or loopback) delivers the message, then routes the
//! matching result back through [`Caller::resolve`].

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::message::Message;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Waiter = oneshot::Sender<Result<Value>>;

/// Pending calls keyed by id. Ids are allocated monotonically, so key order
/// is also age order.
type PendingTable = Arc<Mutex<BTreeMap<u64, Waiter>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, BTreeMap<u64, Waiter>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bound on outstanding calls, and how many of the oldest to discard when
/// the bound is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    pub limit: usize,
    pub discard: usize,
}

/// Issues calls and matches their results by id.
#[derive(Debug)]
pub struct Caller {
    next_id: AtomicU64,
    pending: PendingTable,
    limits: Option<PendingLimits>,
}

impl Default for Caller {
    fn default() -> Self {
        Self::new()
    }
}

impl Caller {
    /// A caller with an unbounded pending table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            limits: None,
        }
    }

    /// A caller that discards its oldest pending calls once `limit` are outstanding.
    pub fn with_limits(limit: usize, discard: usize) -> Self {
        Self {
            limits: Some(PendingLimits { limit, discard }),
            ..Self::new()
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a call message with a fresh id, without tracking it.
    ///
    /// Used when the result is produced synchronously (loopback).
    pub fn request(&self, method: &str, params: Vec<Value>) -> Message {
        Message::call(self.next_id(), method, params)
    }

    /// Build a call message and register a [`PendingCall`] for its result.
    pub fn start(&self, method: &str, params: Vec<Value>) -> (Message, PendingCall) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        let mut table = lock(&self.pending);
        if let Some(limits) = self.limits {
            if limits.limit > 0 && table.len() >= limits.limit {
                let discard = limits.discard.max(1).min(table.len());
                warn!(
                    "Pending call limit {} reached, discarding {} oldest calls",
                    limits.limit, discard
                );
                for _ in 0..discard {
                    if let Some((_, waiter)) = table.pop_first() {
                        let _ = waiter.send(Err(RpcError::Overloaded));
                    }
                }
            }
        }
        table.insert(id, tx);
        drop(table);

        let msg = Message::call(id, method, params);
        let pending = PendingCall {
            id,
            rx,
            table: Arc::clone(&self.pending),
        };
        (msg, pending)
    }

    /// Route a result message to the call waiting for it.
    ///
    /// Returns `false` for results nobody is waiting for (unknown, late, or
    /// already cancelled); those are dropped.
    pub fn resolve(&self, msg: Message) -> bool {
        let Some(id) = msg.numeric_id() else {
            debug!("Dropping result with non-numeric id: {:?}", msg.id);
            return false;
        };
        let waiter = lock(&self.pending).remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(msg.into_result());
                true
            }
            None => {
                debug!("Dropping unmatched result for id {}", id);
                false
            }
        }
    }

    /// Fail every pending call with `ClosedError`.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *lock(&self.pending));
        for (_, waiter) in drained {
            let _ = waiter.send(Err(RpcError::Closed));
        }
    }

    /// Number of calls still waiting for a result.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// A call waiting for its result.
///
/// Dropping it (directly, or by dropping the future awaiting [`PendingCall::wait`])
/// removes the entry from the caller's table.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    table: PendingTable,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the result, or until `ctx` is cancelled or expires.
    pub async fn wait(mut self, ctx: &Context) -> Result<Value> {
        tokio::select! {
            outcome = &mut self.rx => outcome.unwrap_or(Err(RpcError::Closed)),
            _ = ctx.done() => Err(RpcError::Cancelled),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.id);
    }
}

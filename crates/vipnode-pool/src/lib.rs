//! vipnode pool - Admission and accounting for Ethereum hosts and clients.
//!
//! Hosts register with the pool over a bidirectional JSON-RPC session; the
//! pool keeps that session so it can later call back into the host and have
//! it whitelist a client. Clients ask the pool for hosts, and pay for the
//! connection time they report through `update`.
//!
//! Every operation is signed by the calling node (see [`request`]) and
//! carries a strictly increasing nonce.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vipnode_jsonrpc::Dispatcher;
//! use vipnode_pool::{MemoryStore, PayPerInterval, PoolConfig, Store, VipnodePool};
//!
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let ledger = Arc::new(PayPerInterval::with_defaults(Arc::clone(&store)));
//! let pool = Arc::new(VipnodePool::new(store, ledger, PoolConfig::default()));
//!
//! let mut dispatcher = Dispatcher::new();
//! pool.register(&mut dispatcher)?;
//! ```

pub mod agent;
pub mod balance;
pub mod config;
pub mod error;
pub mod ethnode;
pub mod pool;
pub mod pretty;
pub mod remote;
pub mod request;
pub mod store;

pub use agent::{ClientAgent, HostAgent};
pub use balance::{BalanceManager, PayPerInterval};
pub use config::{PoolConfig, PoolDefaults, StoreDefaults};
pub use error::{PoolError, Result};
pub use ethnode::{EthNode, NodeKind, PeerInfo};
pub use pool::{UpdateResponse, VipnodePool, NAMESPACE, WHITELIST_METHOD};
pub use remote::RemotePool;
pub use store::{Account, Amount, Balance, MemoryStore, Node, NodeId, SqliteStore, Store};

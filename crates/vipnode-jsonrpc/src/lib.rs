//! vipnode JSON-RPC - Bidirectional JSON-RPC 2.0 sessions.
//!
//! One duplex connection carries calls in both directions: each side of a
//! [`Session`] is a client and a server at the same time. A handler can
//! reach back to the party that called it through
//! [`CallContext::service`], which is how a pool calls into a host that is
//! itself a caller of the pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vipnode_jsonrpc::{pipe, Context, Dispatcher, Methods, RpcError, Service, Session, SessionConfig};
//!
//! let (a, b) = pipe();
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register(
//!     "bar",
//!     Methods::new().add("pong", |_cx, (): ()| async { Ok::<_, RpcError>("pong") }),
//! )?;
//! let _server = Session::start(b, Arc::new(dispatcher), SessionConfig::default());
//! let client = Session::start(a, Arc::new(Dispatcher::new()), SessionConfig::default());
//!
//! let pong = client.call(&Context::background(), "bar_pong", vec![]).await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod local;
pub mod message;
pub mod params;
pub mod remote;
pub mod server;
pub mod service;

pub use client::{Caller, PendingCall};
pub use codec::{pipe, Codec, FramedCodec, LineCodec, MessageReader, MessageWriter};
pub use config::{SessionConfig, SessionDefaults};
pub use context::{CancellationToken, Context};
pub use error::{codes, Result, RpcError};
pub use local::Loopback;
pub use message::{ErrorObject, Message, MessageKind};
pub use params::{FromParams, IntoParams};
pub use remote::{Session, SessionState};
pub use server::{Dispatcher, Methods};
pub use service::{call_typed, CallContext, Service};

//! Inbound call routing.
//!
//! A [`Dispatcher`] maps namespace prefixes to [`Methods`] tables. The method
//! `"vipnode_connect"` resolves to the `connect` operation of the table
//! registered under `"vipnode"`.

use crate::context::Context;
use crate::error::{codes, Result, RpcError};
use crate::message::{Message, MessageKind};
use crate::params::{positional, FromParams};
use crate::service::{CallContext, Service};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Separator between namespace prefix and operation name.
pub const NAMESPACE_SEPARATOR: char = '_';

type BoxedHandler =
    Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// The operations exposed under one namespace.
#[derive(Clone, Default)]
pub struct Methods {
    ops: HashMap<String, BoxedHandler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed operation.
    ///
    /// Params are decoded positionally into `P`; the handler's error type only
    /// needs to convert into [`RpcError`], which is how domain errors choose
    /// their wire code.
    pub fn add<P, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        P: FromParams + Send + 'static,
        R: Serialize,
        E: Into<RpcError>,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |cx, params| {
            let handler = Arc::clone(&handler);
            async move {
                let params = P::from_params(params)?;
                let value = (*handler)(cx, params).await.map_err(Into::into)?;
                serde_json::to_value(value)
                    .map_err(|e| RpcError::remote(codes::INTERNAL_ERROR, e.to_string()))
            }
            .boxed()
        });
        if self.ops.insert(name.to_string(), boxed).is_some() {
            warn!("Operation {} registered twice, keeping the latest", name);
        }
        self
    }

    /// Names of the registered operations.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl std::fmt::Debug for Methods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ops.keys()).finish()
    }
}

/// Routes inbound calls to registered operations.
#[derive(Debug, Default)]
pub struct Dispatcher {
    namespaces: HashMap<String, Methods>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `methods` under `prefix`. A trailing separator is ignored, so
    /// `"vipnode"` and `"vipnode_"` name the same namespace.
    pub fn register(&mut self, prefix: &str, methods: Methods) -> Result<()> {
        let prefix = prefix.trim_end_matches(NAMESPACE_SEPARATOR);
        if self.namespaces.contains_key(prefix) {
            return Err(RpcError::DuplicatePrefix {
                prefix: prefix.to_string(),
            });
        }
        info!(
            "Registered namespace {} with {} operations",
            prefix,
            methods.len()
        );
        self.namespaces.insert(prefix.to_string(), methods);
        Ok(())
    }

    fn lookup(&self, method: &str) -> Option<&BoxedHandler> {
        let (prefix, op) = method.split_once(NAMESPACE_SEPARATOR)?;
        self.namespaces.get(prefix)?.ops.get(op)
    }

    /// Invoke the operation named by `method`.
    ///
    /// Handler failures, including panics, come back as errors; they never
    /// escape into the caller's task.
    pub async fn call(&self, cx: CallContext, method: &str, params: Option<Value>) -> Result<Value> {
        let handler = self
            .lookup(method)
            .ok_or_else(|| RpcError::MethodNotFound {
                method: method.to_string(),
            })?;
        let params = positional(params)?;

        match AssertUnwindSafe((**handler)(cx, params)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Handler for {} panicked", method);
                Err(RpcError::remote(
                    codes::INTERNAL_ERROR,
                    format!("internal error in {}", method),
                ))
            }
        }
    }

    /// Handle one inbound message and produce the result message to send back.
    ///
    /// Returns `None` when nothing should be written: notifications, results
    /// (those belong to a caller), and invalid messages without an id.
    pub async fn handle(
        &self,
        ctx: Context,
        service: Arc<dyn Service>,
        msg: Message,
    ) -> Option<Message> {
        match msg.kind() {
            MessageKind::Call | MessageKind::Notification => {}
            MessageKind::Result => return None,
            MessageKind::Invalid => {
                let id = msg.id?;
                let err = RpcError::InvalidRequest {
                    message: "message is neither a call nor a result".to_string(),
                };
                return Some(Message::failure(Some(id), &err));
            }
        }

        let Message {
            id, method, params, ..
        } = msg;
        let method = method.unwrap_or_default();
        let outcome = self
            .call(CallContext::new(ctx, service), &method, params)
            .await;

        let id = id?;
        Some(match outcome {
            Ok(value) => Message::success(Some(id), value),
            Err(err) => {
                debug!("Call {} failed: {}", method, err);
                Message::failure(Some(id), &err)
            }
        })
    }
}

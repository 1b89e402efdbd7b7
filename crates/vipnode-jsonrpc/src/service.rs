//! The `Service` abstraction: anything calls can be issued through.
//!
//! Both a networked [`crate::Session`] and an in-process [`crate::Loopback`]
//! implement [`Service`]. Handlers receive the service they were called
//! through inside their [`CallContext`], which is how a server-side handler
//! issues calls back to its own caller over the same connection.

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::params::IntoParams;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// A party that remote calls can be issued to.
#[async_trait]
pub trait Service: Send + Sync {
    /// Call `method` with positional `params` and wait for its result.
    async fn call(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value>;

    /// Send a call that expects no result.
    async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()>;

    /// Whether the service can no longer carry calls.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Per-call context handed to every handler.
#[derive(Clone)]
pub struct CallContext {
    ctx: Context,
    service: Arc<dyn Service>,
}

impl CallContext {
    pub fn new(ctx: Context, service: Arc<dyn Service>) -> Self {
        Self { ctx, service }
    }

    /// Cancellation/deadline context of the inbound call.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The service this call arrived through. Calls issued on it travel back
    /// to the party that made the current call.
    pub fn service(&self) -> Arc<dyn Service> {
        Arc::clone(&self.service)
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// Call through any service with typed params and a typed result.
pub async fn call_typed<S, P, R>(service: &S, ctx: &Context, method: &str, params: P) -> Result<R>
where
    S: Service + ?Sized,
    P: IntoParams,
    R: DeserializeOwned,
{
    let value = service.call(ctx, method, params.into_params()?).await?;
    serde_json::from_value(value).map_err(RpcError::from)
}

//! In-process service: a caller wired straight into a dispatcher.

use crate::client::Caller;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::message::Message;
use crate::server::Dispatcher;
use crate::service::Service;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

struct LoopbackInner {
    caller: Caller,
    dispatcher: Arc<Dispatcher>,
}

/// A [`Service`] that dispatches calls in the calling task, without a codec.
///
/// Calls still travel as serialized [`Message`]s, so method resolution,
/// param decoding and error codes behave exactly as over a [`crate::Session`].
#[derive(Clone)]
pub struct Loopback {
    inner: Arc<LoopbackInner>,
}

impl Loopback {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                caller: Caller::new(),
                dispatcher,
            }),
        }
    }

    fn as_service(&self) -> Arc<dyn Service> {
        Arc::new(self.clone())
    }

    async fn deliver(&self, ctx: Context, msg: Message) -> Result<Option<Message>> {
        let msg: Message = serde_json::from_slice(&serde_json::to_vec(&msg)?)?;
        let reply = self.inner.dispatcher.handle(ctx, self.as_service(), msg).await;
        match reply {
            Some(reply) => Ok(Some(serde_json::from_slice(&serde_json::to_vec(&reply)?)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loopback")
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

#[async_trait]
impl Service for Loopback {
    async fn call(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        if ctx.is_done() {
            return Err(RpcError::Cancelled);
        }
        let msg = self.inner.caller.request(method, params);
        let reply = tokio::select! {
            reply = self.deliver(ctx.clone(), msg) => reply?,
            _ = ctx.done() => return Err(RpcError::Cancelled),
        };
        reply
            .ok_or_else(|| RpcError::connection("no result for call"))?
            .into_result()
    }

    async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let msg = Message::notification(method, params);
        self.deliver(Context::background(), msg).await?;
        Ok(())
    }
}

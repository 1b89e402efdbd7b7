//! Full-duplex sessions over a codec.
//!
//! A [`Session`] owns one codec, one [`Caller`] and a shared [`Dispatcher`].
//! Its read loop runs on its own task and routes every inbound message:
//! results go to the caller's pending table, calls are dispatched on their
//! own task each so a slow handler never stalls reading. All writes go
//! through one async mutex around the codec's writer half, and every write
//! gives up once its call's context or the session is done.

use crate::client::Caller;
use crate::codec::{Codec, MessageReader, MessageWriter};
use crate::config::SessionConfig;
use crate::context::{CancellationToken, Context};
use crate::error::{Result, RpcError};
use crate::message::{Message, MessageKind};
use crate::server::Dispatcher;
use crate::service::Service;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Inbound calls whose handlers have not resolved yet, keyed by arrival
/// order. Each handler runs until its token is cancelled.
#[derive(Debug, Default)]
struct InFlight {
    next_seq: u64,
    calls: BTreeMap<u64, CancellationToken>,
}

struct SessionInner {
    writer: tokio::sync::Mutex<Box<dyn MessageWriter>>,
    caller: Caller,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    /// Cancelled on close; stops the read loop and every pending write.
    token: CancellationToken,
    state: watch::Sender<SessionState>,
    inflight: Mutex<InFlight>,
}

/// A bidirectional JSON-RPC session. Cloning yields another handle to the
/// same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Take ownership of `codec` and start the read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Codec>(codec: C, dispatcher: Arc<Dispatcher>, config: SessionConfig) -> Self {
        let (reader, writer) = codec.split();
        let caller = if config.pending_limit > 0 {
            Caller::with_limits(config.pending_limit, config.pending_discard)
        } else {
            Caller::new()
        };
        let (state, _) = watch::channel(SessionState::Open);
        let writer: Box<dyn MessageWriter> = Box::new(writer);

        let session = Self {
            inner: Arc::new(SessionInner {
                writer: tokio::sync::Mutex::new(writer),
                caller,
                dispatcher,
                config,
                token: CancellationToken::new(),
                state,
                inflight: Mutex::new(InFlight::default()),
            }),
        };

        let runner = session.clone();
        tokio::spawn(async move { runner.read_loop(reader).await });
        session
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Number of inbound calls currently being handled.
    pub fn inflight_len(&self) -> usize {
        self.lock_inflight().calls.len()
    }

    /// Number of outbound calls waiting for a result.
    pub fn pending_len(&self) -> usize {
        self.inner.caller.pending_len()
    }

    /// Close the session and wait until the drain has finished.
    pub async fn close(&self) {
        self.shutdown().await;
        self.closed().await;
    }

    /// Wait until the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    fn lock_inflight(&self) -> MutexGuard<'_, InFlight> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_loop<R: MessageReader>(self, mut reader: R) {
        loop {
            let read = tokio::select! {
                _ = self.inner.token.cancelled() => break,
                read = reader.read_message() => read,
            };
            match read {
                Ok(msg) => self.route(msg).await,
                Err(err) => {
                    if self.state() == SessionState::Open {
                        error!("Session terminated: {}", err);
                    }
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    async fn route(&self, msg: Message) {
        match msg.kind() {
            MessageKind::Result => {
                self.inner.caller.resolve(msg);
            }
            MessageKind::Call | MessageKind::Notification => self.dispatch(msg),
            MessageKind::Invalid => {
                let service: Arc<dyn Service> = Arc::new(self.clone());
                let reply = self
                    .inner
                    .dispatcher
                    .handle(Context::background(), service, msg)
                    .await;
                match reply {
                    Some(reply) => self.send(&reply).await,
                    None => debug!("Dropping invalid message without id"),
                }
            }
        }
    }

    /// Reserve an in-flight slot for a new inbound call, cancelling the
    /// oldest ones when the limit is reached.
    fn admit(&self) -> (u64, CancellationToken) {
        let SessionConfig {
            pending_limit,
            pending_discard,
        } = self.inner.config;
        let token = CancellationToken::new();
        let mut inflight = self.lock_inflight();
        let seq = inflight.next_seq;
        inflight.next_seq += 1;

        if pending_limit > 0 && inflight.calls.len() >= pending_limit {
            let discard = pending_discard.max(1).min(inflight.calls.len());
            warn!(
                "Inbound call limit {} reached, discarding {} oldest calls",
                pending_limit, discard
            );
            for _ in 0..discard {
                if let Some((_, evicted)) = inflight.calls.pop_first() {
                    evicted.cancel();
                }
            }
        }
        inflight.calls.insert(seq, token.clone());
        // Shutdown cancels the session token before draining this table.
        if self.inner.token.is_cancelled() {
            token.cancel();
        }
        (seq, token)
    }

    /// Release an in-flight slot. Returns `false` if the call was discarded
    /// in the meantime.
    fn complete(&self, seq: u64) -> bool {
        self.lock_inflight().calls.remove(&seq).is_some()
    }

    fn dispatch(&self, msg: Message) {
        let (seq, token) = self.admit();
        let session = self.clone();
        tokio::spawn(async move {
            let ctx = Context::with_token(token.clone());
            let service: Arc<dyn Service> = Arc::new(session.clone());
            // Handlers get one more poll to observe their own cancellation.
            let reply = tokio::select! {
                biased;
                reply = session.inner.dispatcher.handle(ctx, service, msg) => reply,
                _ = token.cancelled() => {
                    debug!("Inbound call {} discarded", seq);
                    return;
                }
            };

            if !session.complete(seq) {
                debug!("Dropping result of discarded call");
                return;
            }
            if let Some(reply) = reply {
                session.send(&reply).await;
            }
        });
    }

    /// Write `msg` unless `ctx` or the session finishes first.
    ///
    /// Giving up while waiting for the writer is harmless. Giving up in the
    /// middle of a write may leave half a frame on the wire, so the session
    /// is closed in that case.
    async fn write(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let mut writer = tokio::select! {
            writer = self.inner.writer.lock() => writer,
            _ = ctx.done() => return Err(RpcError::Cancelled),
            _ = self.inner.token.cancelled() => return Err(RpcError::Closed),
        };
        let written = tokio::select! {
            written = writer.write_message(msg) => Some(written),
            _ = ctx.done() => None,
            _ = self.inner.token.cancelled() => None,
        };
        drop(writer);

        match written {
            Some(written) => written,
            None if self.inner.token.is_cancelled() => Err(RpcError::Closed),
            None => {
                warn!("Write abandoned mid-frame, closing session");
                let session = self.clone();
                tokio::spawn(async move { session.shutdown().await });
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Write a result; a failure here ends the session.
    async fn send(&self, msg: &Message) {
        if let Err(err) = self.write(&Context::background(), msg).await {
            if self.state() == SessionState::Open {
                error!("Failed to write result: {}", err);
            }
            self.shutdown().await;
        }
    }

    /// Drain: cancel inbound handlers, fail outbound calls, release the codec.
    async fn shutdown(&self) {
        let first = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        self.inner.token.cancel();
        let inflight = std::mem::take(&mut self.lock_inflight().calls);
        for token in inflight.into_values() {
            token.cancel();
        }
        self.inner.caller.close_all();
        if let Err(err) = self.inner.writer.lock().await.close().await {
            debug!("Error closing codec: {}", err);
        }
        self.inner.state.send_replace(SessionState::Closed);
        debug!("Session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Service for Session {
    async fn call(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.state() != SessionState::Open {
            return Err(RpcError::Closed);
        }
        let (msg, pending) = self.inner.caller.start(method, params);
        // A drain that started after the check above may have missed this entry.
        if self.state() != SessionState::Open {
            return Err(RpcError::Closed);
        }

        debug!("Calling {} (id {})", method, pending.id());
        if let Err(err) = self.write(ctx, &msg).await {
            if err.is_fatal() {
                self.shutdown().await;
            }
            return Err(err);
        }
        pending.wait(ctx).await
    }

    async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(RpcError::Closed);
        }
        let result = self
            .write(&Context::background(), &Message::notification(method, params))
            .await;
        if matches!(&result, Err(err) if err.is_fatal()) {
            self.shutdown().await;
        }
        result
    }

    fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }
}

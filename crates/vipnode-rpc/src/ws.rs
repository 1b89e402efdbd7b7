//! WebSocket codec: one JSON message per WebSocket message.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tracing::debug;
use vipnode_jsonrpc::{Codec, Message, MessageReader, MessageWriter, Result, RpcError};

/// Receiving half: decodes text and binary frames, skips control frames.
pub struct WsReader<St> {
    stream: St,
}

#[async_trait]
impl<St, E> MessageReader for WsReader<St>
where
    St: Stream<Item = std::result::Result<WsMessage, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    async fn read_message(&mut self) -> Result<Message> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(RpcError::connection(format!("websocket error: {}", e))),
                None => return Err(RpcError::connection("websocket closed")),
            };
            match frame {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Binary(bytes) => return Ok(serde_json::from_slice(&bytes)?),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(frame) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Err(RpcError::connection("websocket closed by peer"));
                }
            }
        }
    }
}

/// Sending half: writes each message as one text frame.
pub struct WsWriter<Si> {
    sink: Option<Si>,
}

#[async_trait]
impl<Si> MessageWriter for WsWriter<Si>
where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: Display,
{
    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(RpcError::Closed)?;
        let text = serde_json::to_string(msg)?;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| RpcError::connection(format!("websocket send failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            // The peer may already be gone; closing is best effort.
            let _ = sink.send(WsMessage::Close(None)).await;
            sink.close()
                .await
                .map_err(|e| RpcError::connection(format!("websocket close failed: {}", e)))?;
        }
        Ok(())
    }
}

/// JSON-RPC over a WebSocket, or any stream/sink pair of WebSocket messages.
pub struct WsCodec<Si, St> {
    reader: WsReader<St>,
    writer: WsWriter<Si>,
}

impl WsCodec<SplitSink<WebSocket, WsMessage>, SplitStream<WebSocket>> {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::from_parts(sink, stream)
    }
}

impl<Si, St> WsCodec<Si, St> {
    pub fn from_parts(sink: Si, stream: St) -> Self {
        Self {
            reader: WsReader { stream },
            writer: WsWriter { sink: Some(sink) },
        }
    }
}

impl<Si, St, E> Codec for WsCodec<Si, St>
where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = std::result::Result<WsMessage, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    type Reader = WsReader<St>;
    type Writer = WsWriter<Si>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

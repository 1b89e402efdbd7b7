//! Message codecs.
//!
//! A codec turns a duplex byte channel into a stream of whole [`Message`]s:
//! each `read_message` yields exactly one complete message no matter how the
//! underlying transport fragments it. Codecs split into independent reader
//! and writer halves so a session can read and write concurrently.
//!
//! Two byte-stream codecs live here:
//! - [`LineCodec`]: newline-delimited JSON.
//! - [`FramedCodec`]: `[u32 BE length][JSON payload]` frames.
//!
//! Message-oriented transports (e.g. WebSocket) implement the traits directly.

mod framed;
mod line;

pub use framed::{FramedCodec, FramedReader, FramedWriter, MAX_FRAME_SIZE};
pub use line::{pipe, LineCodec, LineReader, LineWriter};

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;

/// The receiving half of a codec.
#[async_trait]
pub trait MessageReader: Send + 'static {
    /// Read the next complete message.
    ///
    /// Fails with `RpcError::Connection` when the channel is closed or broken
    /// and with `RpcError::Decode` when a complete frame is not a valid message.
    async fn read_message(&mut self) -> Result<Message>;
}

/// The sending half of a codec.
#[async_trait]
pub trait MessageWriter: Send + 'static {
    /// Write one message as a single frame.
    async fn write_message(&mut self, msg: &Message) -> Result<()>;

    /// Release the underlying channel. Calling it more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// A duplex codec that can be split into reader and writer halves.
pub trait Codec: Send + 'static {
    type Reader: MessageReader;
    type Writer: MessageWriter;

    /// Split into halves that can be driven from different tasks.
    fn split(self) -> (Self::Reader, Self::Writer);
}

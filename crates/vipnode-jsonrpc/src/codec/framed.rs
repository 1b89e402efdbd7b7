//! Length-prefixed JSON codec.
//!
//! Frame format: 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload of that length.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use super::{Codec, MessageReader, MessageWriter};
use crate::error::{Result, RpcError};
use crate::message::Message;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest accepted frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF (peer closed connection).
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::decode(format!(
            "frame size {} exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            RpcError::decode(format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                MAX_FRAME_SIZE
            ))
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub struct FramedReader<R> {
    inner: R,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> MessageReader for FramedReader<R> {
    async fn read_message(&mut self) -> Result<Message> {
        let payload = read_frame(&mut self.inner)
            .await?
            .ok_or_else(|| RpcError::connection("connection closed"))?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

pub struct FramedWriter<W> {
    inner: Option<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> MessageWriter for FramedWriter<W> {
    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let writer = self.inner.as_mut().ok_or(RpcError::Closed)?;
        let payload = serde_json::to_vec(msg)?;
        write_frame(writer, &payload).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Length-prefixed JSON over any duplex byte stream.
pub struct FramedCodec<R, W> {
    reader: FramedReader<R>,
    writer: FramedWriter<W>,
}

impl<T> FramedCodec<ReadHalf<T>, WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        let (r, w) = tokio::io::split(io);
        Self {
            reader: FramedReader { inner: r },
            writer: FramedWriter { inner: Some(w) },
        }
    }
}

impl<R, W> Codec for FramedCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = FramedReader<R>;
    type Writer = FramedWriter<W>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<R, W> MessageReader for FramedCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&mut self) -> Result<Message> {
        self.reader.read_message().await
    }
}

#[async_trait]
impl<R, W> MessageWriter for FramedCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        self.writer.write_message(msg).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }
}

//! Newline-delimited JSON codec.

use super::framed::MAX_FRAME_SIZE;
use super::{Codec, MessageReader, MessageWriter};
use crate::error::{Result, RpcError};
use crate::message::Message;
use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadHalf, WriteHalf,
};

/// Buffer size of the in-memory pipe returned by [`pipe`].
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Reads one JSON message per line.
pub struct LineReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin + Send + 'static> LineReader<R> {
    /// Lines are capped at [`MAX_FRAME_SIZE`] bytes.
    pub fn new(reader: R) -> Self {
        Self::with_max_line(reader, MAX_FRAME_SIZE)
    }

    pub fn with_max_line(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: Vec::new(),
            max_line,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> MessageReader for LineReader<R> {
    async fn read_message(&mut self) -> Result<Message> {
        // One byte past the cap tells an overlong line from one that fits exactly.
        let limit = u64::try_from(self.max_line).unwrap_or(u64::MAX).saturating_add(1);
        loop {
            self.line.clear();
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;
            if n == 0 {
                return Err(RpcError::connection("connection closed"));
            }
            let body_len = self.line.len() - usize::from(self.line.ends_with(b"\n"));
            if body_len > self.max_line {
                return Err(RpcError::decode(format!(
                    "line exceeds maximum {} bytes",
                    self.max_line
                )));
            }
            let trimmed = self.line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_slice(trimmed)?);
        }
    }
}

/// Writes one JSON message per line.
pub struct LineWriter<W> {
    inner: Option<W>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Some(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> MessageWriter for LineWriter<W> {
    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let writer = self.inner.as_mut().ok_or(RpcError::Closed)?;
        let mut bytes = serde_json::to_vec(msg)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Newline-delimited JSON over any duplex byte stream.
pub struct LineCodec<R, W> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
}

impl<T> LineCodec<ReadHalf<T>, WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a duplex stream (TCP socket, pipe, ...).
    pub fn new(io: T) -> Self {
        let (r, w) = tokio::io::split(io);
        Self::from_parts(r, w)
    }
}

impl<R, W> LineCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Build from separately owned read and write streams.
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }
}

impl<R, W> Codec for LineCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = LineReader<R>;
    type Writer = LineWriter<W>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<R, W> MessageReader for LineCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&mut self) -> Result<Message> {
        self.reader.read_message().await
    }
}

#[async_trait]
impl<R, W> MessageWriter for LineCodec<R, W>
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

/// Two codecs connected back to back through an in-memory pipe.
pub fn pipe() -> (
    LineCodec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
    LineCodec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
) {
    let (a, b) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    (LineCodec::new(a), LineCodec::new(b))
}

//! Frame writer
//!
//! Emits whole frames to a stream, retrying short writes.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::connection::ConnectionResult;
use crate::protocol::{encode_into, CodecError, Command, MAX_FRAME_SIZE};

/// Writes complete frames to any `AsyncWrite` stream
///
/// A failed write leaves the peer's frame boundary unknown, so callers
/// must treat any error as fatal for the connection.
pub struct FrameWriter<W> {
    inner: W,
    /// Reused encode buffer
    buf: BytesMut,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_frame_size(inner, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
            max_frame_size,
        }
    }

    /// Encode and write one command, then flush
    ///
    /// Commands whose frame would exceed the reader-side ceiling are
    /// rejected before any byte reaches the stream.
    pub async fn write_command(&mut self, command: &Command) -> ConnectionResult<()> {
        self.buf.clear();
        encode_into(command, &mut self.buf)?;

        if self.buf.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: self.buf.len(),
                max: self.max_frame_size,
            }
            .into());
        }

        let mut offset = 0;
        while offset < self.buf.len() {
            let n = self.inner.write(&self.buf[offset..]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            offset += n;
        }

        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

//! Frame reader
//!
//! Turns a possibly fragmented byte stream into complete frames.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::connection::ConnectionResult;
use crate::protocol::{frame_len, split_frame, CodecError, HEADER_SIZE, MAX_FRAME_SIZE};

/// Size of the scratch buffer used for each underlying read
const SCRATCH_SIZE: usize = 1024;

/// Reads complete frames from any `AsyncRead` stream
///
/// Partial reads are buffered internally; callers only ever see whole
/// frames. `read_frame` is cancel safe: bytes are appended to the
/// accumulator only after a read completes.
pub struct FrameReader<R> {
    inner: R,
    /// Bytes read but not yet returned as part of a frame
    buf: BytesMut,
    scratch: Box<[u8; SCRATCH_SIZE]>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_size(inner, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(SCRATCH_SIZE),
            scratch: Box::new([0u8; SCRATCH_SIZE]),
            max_frame_size,
        }
    }

    /// Read the next complete frame, header included
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames. A
    /// stream that ends part way through a frame yields
    /// `CodecError::TruncatedFrame`.
    pub async fn read_frame(&mut self) -> ConnectionResult<Option<Bytes>> {
        loop {
            if let Some(frame) = split_frame(&mut self.buf, self.max_frame_size)? {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.scratch[..]).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::TruncatedFrame {
                    expected: frame_len(&self.buf).unwrap_or(HEADER_SIZE),
                    available: self.buf.len(),
                }
                .into());
            }

            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Number of bytes buffered beyond the frames already returned
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionError;
    use crate::protocol::{decode, encode, Command};
    use tokio_test::io::Builder;

    fn wire(cmd: &Command) -> Vec<u8> {
        encode(cmd).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_single_frame() {
        let cmd = Command::new(b'm', "hello world");
        let bytes = wire(&cmd);
        let mut reader = FrameReader::new(&bytes[..]);

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.as_ref(), bytes.as_slice());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_byte_by_byte() {
        let cmd = Command::new(b'm', "fragmented payload");
        let bytes = wire(&cmd);

        let mut builder = Builder::new();
        for b in &bytes {
            builder.read(std::slice::from_ref(b));
        }
        let mut reader = FrameReader::new(builder.build());

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(decode(&frame).unwrap(), cmd);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_arbitrary_chunking() {
        let cmd = Command::new(b'q', vec![42u8; 3000]);
        let bytes = wire(&cmd);

        for splits in [vec![1, 2, 3], vec![4], vec![5, 1500], vec![2999, 3003]] {
            let mut builder = Builder::new();
            let mut start = 0;
            for end in splits.iter().copied().chain(std::iter::once(bytes.len())) {
                builder.read(&bytes[start..end]);
                start = end;
            }
            let mut reader = FrameReader::new(builder.build());

            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(decode(&frame).unwrap(), cmd, "splits {:?}", splits);
        }
    }

    #[tokio::test]
    async fn test_concatenated_frames_served_one_at_a_time() {
        let commands: Vec<Command> = (0..5u8)
            .map(|i| Command::new(b'a' + i, vec![i; i as usize * 10]))
            .collect();
        let bytes: Vec<u8> = commands.iter().flat_map(wire).collect();

        let mut reader = FrameReader::new(Builder::new().read(&bytes).build());
        for (i, cmd) in commands.iter().enumerate() {
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(&decode(&frame).unwrap(), cmd);
            let rest: usize = commands[i + 1..].iter().map(Command::frame_len).sum();
            assert_eq!(reader.buffered(), rest);
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads_with_trailing_frame() {
        let a = wire(&Command::new(b'a', "first"));
        let b = wire(&Command::new(b'b', "second"));
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let mut reader = FrameReader::new(
            Builder::new()
                .read(&joined[..7])
                .read(&joined[7..a.len() + 2])
                .read(&joined[a.len() + 2..])
                .build(),
        );

        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), a.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b.as_slice());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        // Header announcing 20_000 payload bytes; only the header is ever sent.
        let header = [1u8, b'm', 0x4E, 0x20];
        let mut reader = FrameReader::new(Builder::new().read(&header).build());

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Codec(CodecError::FrameTooLarge { size: 20_004, max: MAX_FRAME_SIZE })
        ));
    }

    #[tokio::test]
    async fn test_custom_ceiling() {
        let bytes = wire(&Command::new(b'm', vec![0u8; 100]));
        let mut reader = FrameReader::with_max_frame_size(&bytes[..], 50);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Codec(CodecError::FrameTooLarge { size: 104, max: 50 })
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_truncation() {
        let bytes = wire(&Command::new(b'm', "cut short"));
        let mut reader = FrameReader::new(&bytes[..8]);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Codec(CodecError::TruncatedFrame { expected: 13, available: 8 })
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_header_is_truncation() {
        let mut reader = FrameReader::new(&[1u8, b'm'][..]);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Codec(CodecError::TruncatedFrame { expected: 4, available: 2 })
        ));
    }

    #[tokio::test]
    async fn test_io_error_propagates() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let mut reader = FrameReader::new(Builder::new().read(&[1u8]).read_error(err).build());

        match reader.read_frame().await {
            Err(ConnectionError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

//! Protocol codec for encoding/decoding commands
//!
//! Handles serialization of commands and carving complete frames out of a
//! byte accumulator.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Command, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Truncated frame: expected {expected} bytes, got {available}")]
    TruncatedFrame { expected: usize, available: usize },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encode a command into a freshly allocated buffer
pub fn encode(command: &Command) -> CodecResult<BytesMut> {
    let mut buf = BytesMut::with_capacity(command.frame_len());
    encode_into(command, &mut buf)?;
    Ok(buf)
}

/// Append the wire form of a command to `buf`
///
/// Payloads that do not fit the 16-bit length field are rejected; nothing
/// is written in that case.
pub fn encode_into(command: &Command, buf: &mut BytesMut) -> CodecResult<()> {
    let len = command.data.len();
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    buf.reserve(HEADER_SIZE + len);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(command.tag);
    buf.put_u16(len as u16);
    buf.put_slice(&command.data);
    Ok(())
}

/// Decode one complete frame
///
/// The returned payload is an owned copy of exactly `length` bytes. Bytes
/// past the declared length are ignored. A wrong version byte is reported
/// even when the rest of the header is missing.
pub fn decode(frame: &[u8]) -> CodecResult<Command> {
    if let Some(&version) = frame.first() {
        if version != PROTOCOL_VERSION {
            return Err(CodecError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }
    }

    if frame.len() < HEADER_SIZE {
        return Err(CodecError::TruncatedFrame {
            expected: HEADER_SIZE,
            available: frame.len(),
        });
    }

    let length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    let end = HEADER_SIZE + length;
    if frame.len() < end {
        return Err(CodecError::TruncatedFrame {
            expected: end,
            available: frame.len(),
        });
    }

    Ok(Command {
        tag: frame[1],
        data: Bytes::copy_from_slice(&frame[HEADER_SIZE..end]),
    })
}

/// Total frame length announced by the header at the front of `buf`
///
/// Returns `None` while fewer than `HEADER_SIZE` bytes are buffered.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(HEADER_SIZE + u16::from_be_bytes([buf[2], buf[3]]) as usize)
}

/// Split one complete frame off the front of `buf`
///
/// Returns `Ok(None)` if more data is needed. On success `buf` keeps only
/// the bytes after the frame.
pub fn split_frame(buf: &mut BytesMut, max_frame_size: usize) -> CodecResult<Option<Bytes>> {
    let Some(len) = frame_len(buf) else {
        return Ok(None);
    };

    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    if buf.len() < len {
        return Ok(None);
    }

    Ok(Some(buf.split_to(len).freeze()))
}

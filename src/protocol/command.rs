//! Command definition
//!
//! A command is the decoded unit carried by one frame: a tag byte and an
//! opaque payload.

use bytes::Bytes;

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Tag identifying the message kind. Any byte is legal on the wire.
    pub tag: u8,
    /// Payload bytes
    pub data: Bytes,
}

impl Command {
    pub fn new(tag: u8, data: impl Into<Bytes>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    /// A command with no payload
    pub fn empty(tag: u8) -> Self {
        Self {
            tag,
            data: Bytes::new(),
        }
    }

    /// Size of this command once framed
    pub fn frame_len(&self) -> usize {
        super::HEADER_SIZE + self.data.len()
    }

    /// Payload interpreted as UTF-8, with invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

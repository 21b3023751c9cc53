//! Protocol module - Defines the wire protocol for chatwire communication
//!
//! Every frame uses a fixed 4 byte header followed by the payload:
//! - 1 byte protocol version
//! - 1 byte command tag (opaque to the framing layer)
//! - 2 bytes payload length (big-endian)
//! - Variable length payload

mod codec;
mod command;

pub use codec::*;
pub use command::*;

/// Protocol version carried in the first byte of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size: version(1) + tag(1) + length(2)
pub const HEADER_SIZE: usize = 4;

/// Largest frame (header + payload) a conformant reader accepts
pub const MAX_FRAME_SIZE: usize = 10_000;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Default port for chatwire servers
pub const DEFAULT_PORT: u16 = 8080;

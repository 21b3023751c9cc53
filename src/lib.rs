//! Chatwire - a minimal framed text-chat transport
//!
//! Clients exchange length-prefixed binary commands with a server that
//! fans every message out to all connected peers.

pub mod chat;
pub mod config;
pub mod network;
pub mod protocol;

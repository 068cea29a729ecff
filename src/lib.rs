//! Signaling and session coordination client for WebRTC media servers.
//!
//! Races redundant signaling endpoints, runs the connect / offer / answer
//! handshake, keeps one peer session in step with signaling, and reports a
//! single lifecycle per channel.

pub mod channel;
pub mod config;
pub mod error;
pub mod media;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use channel::{ChannelEvent, MediaChannel, SessionState};
pub use config::ChannelConfig;
pub use error::{CloseEvent, DisconnectReason, ErrorReason};

//! Signaling protocol: message codec, endpoint racing, and the session that
//! ties them to one adopted connection.

pub mod message;
pub mod racer;
pub mod session;

pub use racer::{CandidateRegistry, ConnectionEvent, TransportRacer};
pub use session::{SignalingEvent, SignalingSession};

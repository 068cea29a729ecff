//! Transport contract consumed by the signaling layer.
//!
//! A [`Connector`] opens one bidirectional text connection per endpoint and
//! reports everything that happens on it as [`TransportEvent`]s on a shared
//! channel, tagged with the candidate id the caller picked.

pub mod websocket;

use tokio::sync::mpsc;

/// Identity of one candidate connection within a race. Never zero.
pub type CandidateId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened {
        id: CandidateId,
    },
    Message {
        id: CandidateId,
        text: String,
    },
    /// The remote side started the closing handshake.
    Closing {
        id: CandidateId,
        code: u16,
        reason: String,
    },
    Closed {
        id: CandidateId,
        code: u16,
        reason: String,
    },
    Failed {
        id: CandidateId,
        cause: String,
    },
}

impl TransportEvent {
    pub fn id(&self) -> CandidateId {
        match self {
            TransportEvent::Opened { id }
            | TransportEvent::Message { id, .. }
            | TransportEvent::Closing { id, .. }
            | TransportEvent::Closed { id, .. }
            | TransportEvent::Failed { id, .. } => *id,
        }
    }
}

/// Opens connections. Implementations must not block; the returned handle
/// is live immediately and its outcome arrives later on `events`.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        id: CandidateId,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Connection>;
}

/// Handle to one open or opening connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> CandidateId;

    fn endpoint(&self) -> &str;

    /// Queue a text frame. Returns false if the connection is already gone.
    fn send(&self, text: String) -> bool;

    /// Start a closing handshake with the given code.
    fn close(&self, code: u16);

    /// Abort without a closing handshake. No further events are reported.
    fn cancel(&self);
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

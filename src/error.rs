//! Error and disconnect reason types shared by the signaling and channel layers.

use std::fmt;

/// Why a session was torn down.
///
/// Exactly one reason is attached to the terminal close of a session. The
/// first fatal trigger wins; later triggers observe the closing flag and
/// become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The application asked to disconnect.
    ClientRequested,
    /// The adopted websocket was closed.
    WebSocketClosed,
    /// The adopted websocket failed (network error, or every candidate failed).
    WebSocketError,
    /// Malformed message or a media engine failure while negotiating.
    SignalingFailure,
    /// The media engine reported connectivity as permanently failed.
    IceFailure,
    /// The media engine reported a close that this side did not start.
    IceClosedByServer,
    /// Connectivity was not confirmed before the connect timer fired.
    Timeout,
    /// The server asked us to reconnect somewhere else.
    Redirected,
}

impl DisconnectReason {
    /// Value carried in the `reason` field of a `disconnect` message.
    ///
    /// Reasons without a wire value omit the field entirely.
    pub fn wire_value(self) -> Option<&'static str> {
        match self {
            DisconnectReason::ClientRequested => Some("NO-ERROR"),
            DisconnectReason::WebSocketClosed => Some("WEBSOCKET-ONCLOSE"),
            DisconnectReason::WebSocketError => Some("WEBSOCKET-ONERROR"),
            _ => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::ClientRequested => "client-requested",
            DisconnectReason::WebSocketClosed => "websocket-closed",
            DisconnectReason::WebSocketError => "websocket-error",
            DisconnectReason::SignalingFailure => "signaling-failure",
            DisconnectReason::IceFailure => "ice-failure",
            DisconnectReason::IceClosedByServer => "ice-closed-by-server",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Redirected => "redirected",
        };
        f.write_str(s)
    }
}

/// Errors and warnings reported to the application alongside the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    SignalingFailure,
    IceFailure,
    IceClosedByServer,
    Timeout,
    /// Non-fatal: connectivity was lost but may recover.
    IceDisconnected,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorReason::SignalingFailure => "signaling-failure",
            ErrorReason::IceFailure => "ice-failure",
            ErrorReason::IceClosedByServer => "ice-closed-by-server",
            ErrorReason::Timeout => "timeout",
            ErrorReason::IceDisconnected => "ice-disconnected",
        };
        f.write_str(s)
    }
}

/// Close code and reason observed when a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    /// Normal closure code.
    pub const NORMAL: u16 = 1000;

    /// Close event recorded for a disconnect started by the application.
    pub fn client_disconnect() -> Self {
        Self {
            code: Self::NORMAL,
            reason: "NO-ERROR".to_string(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == Self::NORMAL
    }
}

/// Failure to decode an inbound signaling message.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("signaling message has no \"type\" field")]
    MissingType,
}

/// Failure reported by the media engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("failed to create local offer: {0}")]
    OfferFailed(String),

    #[error("failed to create answer: {0}")]
    AnswerFailed(String),

    #[error("failed to create peer session: {0}")]
    PeerCreation(String),
}

//! Signaling message catalog and JSON codec.
//!
//! Pure mapping between typed protocol messages and their text frames.
//! Outbound optional fields are omitted when absent (never emitted as
//! `null`), and unknown inbound fields are ignored.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SignalingError;

/// SDK identification carried in the connect message.
pub const SDK_TYPE: &str = "Rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Direction of the media this client takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sendonly,
    #[default]
    Recvonly,
    Sendrecv,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sendonly => "sendonly",
            Role::Recvonly => "recvonly",
            Role::Sendrecv => "sendrecv",
        }
    }

    /// Whether this role publishes media.
    pub fn is_upstream(self) -> bool {
        matches!(self, Role::Sendonly | Role::Sendrecv)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sendonly" => Ok(Role::Sendonly),
            "recvonly" => Ok(Role::Recvonly),
            "sendrecv" => Ok(Role::Sendrecv),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Requested settings for one media kind (audio or video).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapability {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
}

impl Default for MediaCapability {
    fn default() -> Self {
        Self {
            enabled: true,
            codec_type: None,
            bit_rate: None,
        }
    }
}

impl MediaCapability {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Wire form: `false` when disabled, omitted when all settings are
    /// default, otherwise an object.
    fn to_setting(&self) -> Option<MediaSetting> {
        if !self.enabled {
            return Some(MediaSetting::Enabled(false));
        }
        if self.codec_type.is_none() && self.bit_rate.is_none() {
            return None;
        }
        Some(MediaSetting::Settings {
            codec_type: self.codec_type.clone(),
            bit_rate: self.bit_rate,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MediaSetting {
    Enabled(bool),
    Settings {
        #[serde(skip_serializing_if = "Option::is_none")]
        codec_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bit_rate: Option<u32>,
    },
}

/// Everything needed to build the one `connect` message of a session.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub role: Role,
    pub channel_id: String,
    pub client_id: Option<String>,
    pub bundle_id: Option<String>,
    pub metadata: Option<Value>,
    pub signaling_notify_metadata: Option<Value>,
    pub multistream: Option<bool>,
    pub audio: MediaCapability,
    pub video: MediaCapability,
    pub simulcast: Option<bool>,
    pub simulcast_rid: Option<String>,
    /// Spotlight is requested when a focus count is given.
    pub spotlight_number: Option<u32>,
    pub data_channel_signaling: Option<bool>,
    pub ignore_disconnect_websocket: Option<bool>,
    /// Capability-only local offer.
    pub sdp: Option<String>,
    /// Set when reconnecting to a redirect location.
    pub redirect: bool,
}

#[derive(Debug, Serialize)]
struct ConnectMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    channel_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bundle_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signaling_notify_metadata: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multistream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulcast: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulcast_rid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spotlight: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spotlight_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<MediaSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<MediaSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_channel_signaling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ignore_disconnect_websocket: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<bool>,
    sdk_type: &'static str,
    sdk_version: &'static str,
    user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<&'a str>,
}

fn user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        SDK_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn encode_connect(req: &ConnectRequest) -> serde_json::Result<String> {
    let msg = ConnectMessage {
        kind: "connect",
        role: req.role.as_str(),
        channel_id: &req.channel_id,
        client_id: req.client_id.as_deref(),
        bundle_id: req.bundle_id.as_deref(),
        metadata: req.metadata.as_ref(),
        signaling_notify_metadata: req.signaling_notify_metadata.as_ref(),
        multistream: req.multistream,
        simulcast: req.simulcast,
        simulcast_rid: req.simulcast_rid.as_deref(),
        spotlight: req.spotlight_number.map(|_| true),
        spotlight_number: req.spotlight_number,
        audio: req.audio.to_setting(),
        video: req.video.to_setting(),
        data_channel_signaling: req.data_channel_signaling,
        ignore_disconnect_websocket: req.ignore_disconnect_websocket,
        redirect: req.redirect.then_some(true),
        sdk_type: SDK_TYPE,
        sdk_version: SDK_VERSION,
        user_agent: user_agent(),
        sdp: req.sdp.as_deref(),
    };
    serde_json::to_string(&msg)
}

// ---------------------------------------------------------------------------
// Simple SDP-carrying messages
// ---------------------------------------------------------------------------

/// A message that carries only a type tag and an SDP blob.
///
/// Used for `answer`, `update` (answer to an update), `re-answer`, and the
/// inbound `update` / `re-offer` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SdpMessage {
    fn new(kind: &str, sdp: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sdp: sdp.to_string(),
        }
    }
}

pub fn encode_answer(sdp: &str) -> serde_json::Result<String> {
    serde_json::to_string(&SdpMessage::new("answer", sdp))
}

/// Answer to an `update` request. The server expects it under the same
/// `update` type tag.
pub fn encode_update_answer(sdp: &str) -> serde_json::Result<String> {
    serde_json::to_string(&SdpMessage::new("update", sdp))
}

pub fn encode_re_answer(sdp: &str) -> serde_json::Result<String> {
    serde_json::to_string(&SdpMessage::new("re-answer", sdp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub candidate: String,
}

pub fn encode_candidate(candidate: &str) -> serde_json::Result<String> {
    serde_json::to_string(&CandidateMessage {
        kind: "candidate".to_string(),
        candidate: candidate.to_string(),
    })
}

#[derive(Debug, Serialize)]
struct PongMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a Value>,
}

pub fn encode_pong(stats: Option<&Value>) -> serde_json::Result<String> {
    serde_json::to_string(&PongMessage { kind: "pong", stats })
}

#[derive(Debug, Serialize)]
struct DisconnectMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

pub fn encode_disconnect(reason: crate::error::DisconnectReason) -> serde_json::Result<String> {
    serde_json::to_string(&DisconnectMessage {
        kind: "disconnect",
        reason: reason.wire_value(),
    })
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Discriminant of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Offer,
    Switched,
    Update,
    ReOffer,
    Notify,
    Push,
    Ping,
    Redirect,
    Unknown(String),
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "offer" => MessageType::Offer,
            "switched" => MessageType::Switched,
            "update" => MessageType::Update,
            "re-offer" => MessageType::ReOffer,
            "notify" => MessageType::Notify,
            "push" => MessageType::Push,
            "ping" => MessageType::Ping,
            "redirect" => MessageType::Redirect,
            other => MessageType::Unknown(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct TypeOnly {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// First-pass parse that only extracts the `type` field.
pub fn decode_type(text: &str) -> Result<MessageType, SignalingError> {
    let part: TypeOnly = serde_json::from_str(text)?;
    let kind = part.kind.ok_or(SignalingError::MissingType)?;
    Ok(MessageType::from(kind.as_str()))
}

/// Decode a full message body.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, SignalingError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Server-provided network configuration for the peer session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OfferConfig {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(rename = "iceTransportPolicy", default)]
    pub ice_transport_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Encoding {
    pub rid: Option<String>,
    pub active: Option<bool>,
    #[serde(rename = "maxBitrate")]
    pub max_bitrate: Option<u32>,
    #[serde(rename = "maxFramerate")]
    pub max_framerate: Option<f64>,
    #[serde(rename = "scaleResolutionDownBy")]
    pub scale_resolution_down_by: Option<f64>,
}

/// Initial `offer` from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OfferMessage {
    pub sdp: String,
    pub client_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub config: Option<OfferConfig>,
    #[serde(default)]
    pub encodings: Option<Vec<Encoding>>,
    #[serde(default)]
    pub simulcast: Option<bool>,
    #[serde(default)]
    pub mid: Option<HashMap<String, String>>,
    #[serde(default)]
    pub data_channels: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SwitchedMessage {
    #[serde(default)]
    pub ignore_disconnect_websocket: Option<bool>,
}

/// `notify` event. Fields this client does not model are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationMessage {
    pub event_type: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub audio: Option<bool>,
    #[serde(default)]
    pub video: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, rename = "minutes")]
    pub connection_time: Option<u64>,
    #[serde(default)]
    pub channel_connections: Option<u32>,
    #[serde(default)]
    pub channel_sendrecv_connections: Option<u32>,
    #[serde(default)]
    pub channel_sendonly_connections: Option<u32>,
    #[serde(default)]
    pub channel_recvonly_connections: Option<u32>,
    #[serde(default)]
    pub unstable_level: Option<u32>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub spotlight_id: Option<String>,
    #[serde(default)]
    pub fixed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PingMessage {
    #[serde(default)]
    pub stats: Option<bool>,
}

impl PingMessage {
    pub fn wants_stats(&self) -> bool {
        self.stats == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectMessage {
    pub location: String,
}

/// A fully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Offer(OfferMessage),
    Switched(SwitchedMessage),
    Update(SdpMessage),
    ReOffer(SdpMessage),
    Notify(NotificationMessage),
    Push(PushMessage),
    Ping(PingMessage),
    Redirect(RedirectMessage),
    Unknown(String),
}

impl InboundMessage {
    /// Dispatch on the type tag, then decode the matching body.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let msg = match decode_type(text)? {
            MessageType::Offer => InboundMessage::Offer(decode(text)?),
            MessageType::Switched => InboundMessage::Switched(decode(text)?),
            MessageType::Update => InboundMessage::Update(decode(text)?),
            MessageType::ReOffer => InboundMessage::ReOffer(decode(text)?),
            MessageType::Notify => InboundMessage::Notify(decode(text)?),
            MessageType::Push => InboundMessage::Push(decode(text)?),
            MessageType::Ping => InboundMessage::Ping(decode(text)?),
            MessageType::Redirect => InboundMessage::Redirect(decode(text)?),
            MessageType::Unknown(kind) => InboundMessage::Unknown(kind),
        };
        Ok(msg)
    }
}

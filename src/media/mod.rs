//! Media engine collaborator contract.
//!
//! The engine owns SDP generation, ICE, and tracks. The channel only needs
//! to ask it for offers and answers and to listen to [`PeerEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::signaling::message::{MediaCapability, OfferConfig, Role};

/// What the local side wants to send and receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCapabilities {
    pub role: Role,
    pub audio: MediaCapability,
    pub video: MediaCapability,
    pub multistream: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// One ICE server entry, flattened so that each carries a single URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerEntry {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Network parameters a peer session is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerNetworkConfig {
    pub ice_servers: Vec<IceServerEntry>,
    pub ice_transport_policy: IceTransportPolicy,
}

impl PeerNetworkConfig {
    /// Build from the `config` block of an initial offer.
    pub fn from_offer(config: Option<&OfferConfig>) -> Self {
        let Some(config) = config else {
            return Self::default();
        };
        let ice_servers = config
            .ice_servers
            .iter()
            .flat_map(|server| {
                server.urls.iter().map(move |url| IceServerEntry {
                    url: url.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                })
            })
            .collect();
        let ice_transport_policy = match config.ice_transport_policy.as_deref() {
            Some("relay") => IceTransportPolicy::Relay,
            _ => IceTransportPolicy::All,
        };
        Self {
            ice_servers,
            ice_transport_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Connectivity checks failed for good.
    IceFailed,
    /// The peer connection was closed from the remote side.
    ClosedByServer,
}

/// Events a peer session reports to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    Failed(FatalKind),
    RemoteStreamAdded(String),
    RemoteStreamRemoved(String),
    LocalCandidate(String),
    /// Text received on the `signaling` data channel.
    SignalingMessage(String),
}

pub trait MediaEngine: Send + Sync + 'static {
    /// One-time process-wide setup. See [`ensure_initialized`].
    fn initialize(&self) {}

    /// Produce a capability-only offer from a throwaway peer.
    fn create_local_offer(
        &self,
        capabilities: &MediaCapabilities,
    ) -> BoxFuture<'static, Result<String, EngineError>>;

    /// Create the real peer session for this channel.
    fn create_peer(
        &self,
        capabilities: &MediaCapabilities,
        network: PeerNetworkConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerSession>, EngineError>;
}

pub trait PeerSession: Send + Sync {
    /// Apply a remote offer and produce the local answer. Used for the
    /// initial offer and for every renegotiation.
    fn ingest_offer_and_answer(
        &self,
        sdp: String,
    ) -> BoxFuture<'static, Result<String, EngineError>>;

    /// Stats snapshot for a `pong`, if the engine can produce one.
    fn stats(&self) -> BoxFuture<'static, Option<Value>>;

    /// Send a signaling message on the `signaling` data channel. Returns
    /// false when the engine has no such channel open.
    fn send_signaling(&self, _text: String) -> bool {
        false
    }

    fn dispose(&self);
}

static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Run the engine's process-wide setup once. Safe to call from any number
/// of channels and threads; only the first call does anything.
pub fn ensure_initialized(engine: &dyn MediaEngine) {
    INIT.call_once(|| {
        tracing::info!("Initializing media engine");
        engine.initialize();
        INITIALIZED.store(true, Ordering::Release);
    });
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::IceServer;
    use crate::testing::MockEngine;
    use std::sync::Arc;

    #[test]
    fn test_network_config_from_offer() {
        let config = OfferConfig {
            ice_servers: vec![IceServer {
                urls: vec![
                    "turn:a.example.com:3478?transport=udp".to_string(),
                    "turns:a.example.com:443".to_string(),
                ],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            }],
            ice_transport_policy: Some("relay".to_string()),
        };
        let net = PeerNetworkConfig::from_offer(Some(&config));
        assert_eq!(net.ice_servers.len(), 2);
        assert_eq!(net.ice_servers[1].url, "turns:a.example.com:443");
        assert_eq!(net.ice_servers[1].credential.as_deref(), Some("secret"));
        assert_eq!(net.ice_transport_policy, IceTransportPolicy::Relay);
    }

    #[test]
    fn test_network_config_without_server_config() {
        let net = PeerNetworkConfig::from_offer(None);
        assert!(net.ice_servers.is_empty());
        assert_eq!(net.ice_transport_policy, IceTransportPolicy::All);
    }

    #[test]
    fn test_ensure_initialized_runs_once() {
        let (engine, _peers) = MockEngine::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || ensure_initialized(engine.as_ref()))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        ensure_initialized(engine.as_ref());

        assert!(is_initialized());
        // Another test may have won the process-wide init first.
        assert!(engine.initialize_count() <= 1);
    }
}

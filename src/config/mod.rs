//! Channel configuration

use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::media::MediaCapabilities;
use crate::signaling::message::{ConnectRequest, MediaCapability, Role};

/// Everything needed to open one media channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Signaling endpoints, raced in this order
    pub endpoints: Vec<String>,
    pub channel_id: String,
    pub role: Role,
    pub client_id: Option<String>,
    pub bundle_id: Option<String>,
    /// Opaque metadata passed through to the server (auth tokens etc.)
    pub metadata: Option<Value>,
    pub signaling_notify_metadata: Option<Value>,
    pub multistream: Option<bool>,
    pub audio: MediaCapability,
    pub video: MediaCapability,
    pub simulcast: Option<bool>,
    pub simulcast_rid: Option<String>,
    /// Number of focused participants when spotlight is wanted
    pub spotlight: Option<u32>,
    pub data_channel_signaling: Option<bool>,
    pub ignore_disconnect_websocket: Option<bool>,
    /// Seconds until media connectivity must be confirmed
    pub timeout_secs: u64,
    /// Reconnect to the location given by a `redirect` message
    pub follow_redirect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            channel_id: String::new(),
            role: Role::default(),
            client_id: None,
            bundle_id: None,
            metadata: None,
            signaling_notify_metadata: None,
            multistream: None,
            audio: MediaCapability::default(),
            video: MediaCapability::default(),
            simulcast: None,
            simulcast_rid: None,
            spotlight: None,
            data_channel_signaling: None,
            ignore_disconnect_websocket: None,
            timeout_secs: 10,
            follow_redirect: true,
        }
    }
}

impl ChannelConfig {
    /// Get default config file path
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "media-signaling", "media-signaling")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when none is given.
    ///
    /// A missing default file yields the default config; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = Self::default_path()?;
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.endpoints.is_empty(), "at least one endpoint is required");
        ensure!(!self.channel_id.is_empty(), "channel_id must not be empty");
        for endpoint in &self.endpoints {
            let url = url::Url::parse(endpoint)
                .with_context(|| format!("Invalid endpoint URL: {}", endpoint))?;
            ensure!(
                matches!(url.scheme(), "ws" | "wss"),
                "endpoint must use ws:// or wss://: {}",
                endpoint
            );
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn capabilities(&self) -> MediaCapabilities {
        MediaCapabilities {
            role: self.role,
            audio: self.audio.clone(),
            video: self.video.clone(),
            multistream: self.multistream.unwrap_or(false),
        }
    }

    /// Build the `connect` payload for this configuration.
    pub fn connect_request(&self, sdp: Option<String>) -> ConnectRequest {
        ConnectRequest {
            role: self.role,
            channel_id: self.channel_id.clone(),
            client_id: self.client_id.clone(),
            bundle_id: self.bundle_id.clone(),
            metadata: self.metadata.clone(),
            signaling_notify_metadata: self.signaling_notify_metadata.clone(),
            multistream: self.multistream,
            audio: self.audio.clone(),
            video: self.video.clone(),
            simulcast: self.simulcast,
            simulcast_rid: self.simulcast_rid.clone(),
            spotlight_number: self.spotlight,
            data_channel_signaling: self.data_channel_signaling,
            ignore_disconnect_websocket: self.ignore_disconnect_websocket,
            sdp,
            redirect: false,
        }
    }
}

//! media-signaling - signaling client tools
//!
//! Race signaling endpoints and inspect what a channel would send.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_signaling::config::ChannelConfig;
use media_signaling::signaling::message;
use media_signaling::signaling::{ConnectionEvent, TransportRacer};
use media_signaling::transport::websocket::WebSocketConnector;
use media_signaling::CloseEvent;

#[derive(Parser)]
#[command(name = "media-signaling")]
#[command(about = "Signaling client for WebRTC media servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Race signaling endpoints and report which one is adopted
    Race {
        /// Endpoint URL (repeat for redundant endpoints, raced in order)
        #[arg(short, long = "endpoint", required = true)]
        endpoints: Vec<String>,

        /// Seconds to wait for any endpoint to open
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Print the connect message a channel would send
    ConnectMessage {
        /// Config file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// File holding a local offer SDP to embed
        #[arg(long)]
        sdp: Option<PathBuf>,
    },

    /// Print the effective configuration
    ShowConfig {
        /// Config file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Race { endpoints, timeout } => {
            race(&endpoints, Duration::from_secs(timeout)).await?;
        }
        Commands::ConnectMessage { config, sdp } => {
            let config = ChannelConfig::load(config.as_deref())?;
            config.validate()?;
            let sdp = match sdp {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => None,
            };
            let text = message::encode_connect(&config.connect_request(sdp))?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::ShowConfig { config } => {
            let config = ChannelConfig::load(config.as_deref())?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn race(endpoints: &[String], timeout: Duration) -> Result<()> {
    tracing::info!("Racing {} endpoint(s)...", endpoints.len());
    let mut race = TransportRacer::start(&WebSocketConnector, endpoints);

    let outcome = tokio::select! {
        ev = race.next() => ev,
        _ = tokio::time::sleep(timeout) => {
            race.cancel();
            bail!("No endpoint opened within {}s", timeout.as_secs());
        }
        _ = tokio::signal::ctrl_c() => {
            race.cancel();
            println!("Cancelled");
            return Ok(());
        }
    };

    match outcome {
        Some(ConnectionEvent::Opened(conn)) => {
            println!("Adopted {}", conn.endpoint());
            conn.close(CloseEvent::NORMAL);
            // Let the close handshake finish before the runtime shuts down.
            let drain = async {
                while let Some(ev) = race.next().await {
                    if matches!(ev, ConnectionEvent::Closed { .. } | ConnectionEvent::Failed(_)) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
                tracing::debug!("Close handshake did not complete");
            }
            Ok(())
        }
        Some(ConnectionEvent::AllFailed) | None => bail!("All endpoints failed"),
        Some(other) => bail!("Unexpected transport event: {:?}", other),
    }
}

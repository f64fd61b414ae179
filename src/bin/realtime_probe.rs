//! Realtime Probe
//!
//! Connects to a Socket.IO endpoint with a session cookie and prints every
//! event the connection manager publishes, one JSON object per line.
//!
//! Usage:
//!   realtime-probe --endpoint https://example.com --cookie "sid=abc123"
//!
//! Environment:
//!   REALTIME_ENDPOINT - Endpoint URL
//!   REALTIME_COOKIE - Raw cookie string carrying the session id
//!   REALTIME_CONFIG - Optional TOML config file
//!   REALTIME_* - Per-field overrides (see RealtimeConfig::apply_env)

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use realtime_link::realtime::{
    events::{EVENT_ERROR, WILDCARD},
    RealtimeConfig, RealtimeEvent, RealtimeManager,
};

#[derive(Parser, Debug)]
#[command(name = "realtime-probe")]
#[command(about = "Realtime Probe - watch a Socket.IO event stream through the connection manager")]
struct Args {
    /// Endpoint URL (http, https, ws or wss)
    #[arg(long, env = "REALTIME_ENDPOINT")]
    endpoint: String,

    /// Raw cookie string, e.g. "sid=abc123; system_user=yes"
    #[arg(long, env = "REALTIME_COOKIE", default_value = "")]
    cookie: String,

    /// TOML config file
    #[arg(long, env = "REALTIME_CONFIG")]
    config: Option<String>,

    /// Override max reconnect attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Override base reconnect interval in milliseconds
    #[arg(long)]
    base_interval_ms: Option<u64>,

    /// Call retry() automatically when the manager gives up
    #[arg(long, default_value_t = false)]
    retry_on_give_up: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("realtime_link=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RealtimeConfig::load(path).context("Failed to load config")?,
        None => RealtimeConfig::default(),
    };
    config.apply_env();
    if let Some(max) = args.max_attempts {
        config.max_reconnect_attempts = max;
    }
    if let Some(base) = args.base_interval_ms {
        config.base_reconnect_interval_ms = base;
    }

    info!("Starting Realtime Probe");
    info!("  Endpoint: {}", args.endpoint);
    info!("  Max attempts: {}", config.max_reconnect_attempts);
    info!(
        "  Backoff: {}ms -> {}ms",
        config.base_reconnect_interval_ms, config.max_reconnect_interval_ms
    );

    let manager = RealtimeManager::new(args.endpoint.clone(), args.cookie.clone(), config);

    manager.subscribe(WILDCARD, |event: &RealtimeEvent| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialize event"),
        }
    });

    if args.retry_on_give_up {
        let weak = manager.downgrade();
        manager.subscribe(EVENT_ERROR, move |event: &RealtimeEvent| {
            let RealtimeEvent::Error(err) = event else {
                return;
            };
            if err.give_up {
                if let Some(manager) = weak.upgrade() {
                    warn!("Reconnection exhausted, retrying from scratch");
                    manager.retry();
                }
            }
        });
    }

    manager.connect();

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
    manager.disconnect();

    let status = manager.status();
    info!(
        total_attempts = status.total_reconnect_attempts,
        last_error = status.last_error.as_deref().unwrap_or("-"),
        "Realtime probe stopped"
    );
    Ok(())
}

//! findmy-bridge - Find My locations to MQTT device trackers
//!
//! Polls a remote iOS host over SSH for the Find My location caches, turns
//! every usable record into a device tracker entity and publishes it over MQTT
//! with discovery metadata.
//!
//! Module structure:
//! - `domain/` - Record types, normalization, topics, expiry table
//! - `io/` - MQTT client, SSH transport, heartbeat file
//! - `services/` - Cycle orchestrator, discovery, state publishing, liveness
//! - `infra/` - Configuration and counters

use clap::Parser;
use findmy_bridge::domain::Topics;
use findmy_bridge::infra::{Config, CycleMetrics};
use findmy_bridge::io::mqtt::connect_bridge;
use findmy_bridge::io::SshTransport;
use findmy_bridge::services::Bridge;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for the offline message and DISCONNECT to reach the broker
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Find My to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "findmy-bridge", version, about)]
struct Args {
    /// Path to TOML configuration file (environment variables override it)
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for PubAcks and remote command results
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "findmy-bridge starting");

    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref());

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        discovery_prefix = %config.discovery_prefix(),
        base_topic = %config.base_topic(),
        remote_host = %config.remote_host(),
        remote_port = %config.remote_port(),
        time_zone = %config.time_zone(),
        settle_secs = %config.settle_secs(),
        sleep_secs = %config.sleep_secs(),
        heartbeat_file = %config.heartbeat_file().display(),
        "config_loaded"
    );

    let topics = Topics::from_config(&config);
    let (client, eventloop_task) = connect_bridge(&config, &topics, BROKER_CONNECT_TIMEOUT).await?;

    let transport = SshTransport::from_config(&config)?;
    transport.connect().await?;

    let metrics = Arc::new(CycleMetrics::new());
    let mut bridge = Bridge::new(config, transport, client.clone(), metrics.clone());
    if !bridge.announce_online().await {
        warn!("bridge_availability_not_sent");
    }

    let result = tokio::select! {
        result = bridge.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            Ok(())
        }
    };

    metrics.snapshot().log();
    match &result {
        // Clean disconnect suppresses the last will, so retract `online` first
        Ok(()) => {
            if !bridge.announce_offline().await {
                warn!("bridge_offline_not_sent");
            }
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "mqtt_disconnect_failed");
            }
            if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, eventloop_task).await.is_err() {
                warn!("mqtt_shutdown_flush_timed_out");
            }
        }
        // Let the last will fire
        Err(e) => error!(error = %format!("{:#}", e), "bridge_stopped"),
    }
    info!("findmy-bridge shutdown complete");
    result
}

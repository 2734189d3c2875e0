//! Liveness checks for the health check binary
//!
//! Checks run in order and stop at the first failure:
//! 1. heartbeat file is present, parsable and recent
//! 2. broker accepts a connection
//! 3. remote host's SSH port accepts TCP, optionally followed by an
//!    authenticated handshake

use crate::infra::config::Config;
use crate::io::heartbeat::{read_heartbeat, HeartbeatError};
use crate::io::mqtt::{mqtt_options, open_session};
use crate::io::remote::SshTransport;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub const BROKER_TIMEOUT: Duration = Duration::from_secs(10);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

/// Reason printed by the health check before exiting non-zero
#[derive(Debug, thiserror::Error)]
pub enum ProbeFailure {
    #[error("no heartbeat")]
    NoHeartbeat,
    #[error("bad heartbeat: {0}")]
    BadHeartbeat(String),
    #[error("stale heartbeat")]
    StaleHeartbeat { age_secs: i64 },
    #[error("no MQTT_HOST")]
    NoBrokerHost,
    #[error("mqtt down: {0}")]
    BrokerDown(String),
    #[error("no IOS_URL")]
    NoRemoteHost,
    #[error("ssh down: {0}")]
    TransportDown(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub max_age_secs: u64,
    /// Authenticate over SSH after the TCP check
    pub handshake: bool,
}

/// Fail if the heartbeat is missing, unparsable or older than `max_age_secs`
///
/// Returns the heartbeat age in seconds.
pub fn check_heartbeat(path: &Path, now: i64, max_age_secs: u64) -> Result<i64, ProbeFailure> {
    let last = match read_heartbeat(path) {
        Ok(ts) => ts,
        Err(HeartbeatError::Missing) => return Err(ProbeFailure::NoHeartbeat),
        Err(e) => return Err(ProbeFailure::BadHeartbeat(e.to_string())),
    };
    let age_secs = now.saturating_sub(last);
    if age_secs > i64::try_from(max_age_secs).unwrap_or(i64::MAX) {
        return Err(ProbeFailure::StaleHeartbeat { age_secs });
    }
    Ok(age_secs)
}

/// Open and immediately close a broker connection
pub async fn check_broker(config: &Config, timeout: Duration) -> Result<(), ProbeFailure> {
    if config.mqtt_host().is_empty() {
        return Err(ProbeFailure::NoBrokerHost);
    }
    let client_id = format!("findmy-healthcheck-{}", std::process::id());
    let options = mqtt_options(config, &client_id, None);
    let (client, task) = open_session(options, timeout)
        .await
        .map_err(|e| ProbeFailure::BrokerDown(format!("{:#}", e)))?;
    // Best effort; a failed DISCONNECT does not make the broker unhealthy
    let _ = client.disconnect().await;
    task.abort();
    debug!(host = %config.mqtt_host(), "probe_broker_ok");
    Ok(())
}

/// TCP connect to the remote control port, then optionally authenticate
pub async fn check_transport(
    config: &Config,
    tcp_timeout: Duration,
    handshake: bool,
) -> Result<(), ProbeFailure> {
    if config.remote_host().is_empty() {
        return Err(ProbeFailure::NoRemoteHost);
    }
    let addr = (config.remote_host(), config.remote_port());
    match tokio::time::timeout(tcp_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {}
        Ok(Err(e)) => return Err(ProbeFailure::TransportDown(e.to_string())),
        Err(_) => {
            return Err(ProbeFailure::TransportDown(format!(
                "connect timed out after {:?}",
                tcp_timeout
            )))
        }
    }

    if handshake {
        let transport = SshTransport::from_config(config)
            .map_err(|e| ProbeFailure::TransportDown(e.to_string()))?
            .with_connect_timeout(HANDSHAKE_TIMEOUT.as_secs())
            .without_multiplexing();
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ProbeFailure::TransportDown(e.to_string())),
            Err(_) => {
                return Err(ProbeFailure::TransportDown("handshake timed out".to_string()))
            }
        }
    }
    debug!(host = %config.remote_host(), "probe_transport_ok");
    Ok(())
}

/// Run every check in order, stopping at the first failure
pub async fn run_probe(
    config: &Config,
    options: ProbeOptions,
    now: i64,
) -> Result<(), ProbeFailure> {
    check_heartbeat(config.heartbeat_file(), now, options.max_age_secs)?;
    check_broker(config, BROKER_TIMEOUT).await?;
    check_transport(config, TCP_TIMEOUT, options.handshake).await?;
    Ok(())
}

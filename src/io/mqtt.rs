//! MQTT client plumbing
//!
//! The bridge publishes through the [`Publisher`] trait. The production
//! implementation is a rumqttc [`AsyncClient`]: `publish` waits for room in the
//! client's bounded request queue, so a slow broker throttles the cycle instead
//! of dropping packets. A spawned task drives the event loop (connect, acks,
//! reconnect) for the lifetime of the process.

use crate::domain::topics::Topics;
use crate::infra::config::Config;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Payload published on availability channels while we are reporting
pub const ONLINE: &str = "online";
/// Bridge availability payload when stopped (last will and clean shutdown)
pub const OFFLINE: &str = "offline";

/// Longest payload prefix written to the publish log
const LOG_PAYLOAD_MAX_CHARS: usize = 200;

/// Request queue capacity between the publisher and the event loop
const REQUEST_CAPACITY: usize = 100;

/// Longest wait for room in the request queue before a publish is dropped
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// The broker refused or could not accept a publish request
#[derive(Debug, thiserror::Error)]
#[error("publish to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// Publish handoff; resolves once the request is queued for the event loop
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &str,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &str,
    ) -> Result<(), PublishError> {
        publish_within(self, topic, qos, retain, payload, PUBLISH_TIMEOUT).await
    }
}

/// Queue a publish on `client`, waiting at most `timeout` for queue space
pub async fn publish_within(
    client: &AsyncClient,
    topic: &str,
    qos: QoS,
    retain: bool,
    payload: &str,
    timeout: Duration,
) -> Result<(), PublishError> {
    let request = AsyncClient::publish(client, topic, qos, retain, payload.as_bytes().to_vec());
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PublishError { topic: topic.to_string(), reason: e.to_string() }),
        Err(_) => Err(PublishError {
            topic: topic.to_string(),
            reason: format!("request queue still full after {:?}", timeout),
        }),
    }
}

/// Publish with a structured log line; failures are logged, not returned
///
/// Returns `true` if the publish was handed to the client.
pub async fn publish_logged<P: Publisher + ?Sized>(
    publisher: &P,
    topic: &str,
    payload: &str,
    qos: QoS,
    retain: bool,
    label: Option<&str>,
) -> bool {
    info!(
        label = %label.unwrap_or(""),
        topic = %topic,
        qos = %(qos as u8),
        retain = %retain,
        payload = %truncate_payload(payload),
        "publish"
    );
    match publisher.publish(topic, qos, retain, payload).await {
        Ok(()) => true,
        Err(e) => {
            error!(topic = %topic, error = %e.reason, "publish_failed");
            false
        }
    }
}

/// Cut a payload for logging, keeping char boundaries intact
pub fn truncate_payload(payload: &str) -> std::borrow::Cow<'_, str> {
    match payload.char_indices().nth(LOG_PAYLOAD_MAX_CHARS) {
        Some((idx, _)) => format!("{}...[truncated]", &payload[..idx]).into(),
        None => payload.into(),
    }
}

/// Build client options from config
///
/// `will` registers a last will payload delivered if we drop off unexpectedly.
pub fn mqtt_options(config: &Config, client_id: &str, will: Option<LastWill>) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);

    // Set credentials if configured
    if let Some(username) = config.mqtt_username() {
        options.set_credentials(username, config.mqtt_password().unwrap_or(""));
    }

    if let Some(will) = will {
        options.set_last_will(will);
    }
    options
}

/// Open the bridge's broker session
///
/// Registers `offline` (retained) as last will on the bridge availability
/// channel and waits for the first ConnAck before returning. The returned task
/// ends once a DISCONNECT has been written to the broker.
pub async fn connect_bridge(
    config: &Config,
    topics: &Topics,
    timeout: Duration,
) -> anyhow::Result<(AsyncClient, JoinHandle<()>)> {
    let client_id = config
        .mqtt_client_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("findmy-bridge-{}", std::process::id()));
    let will = LastWill::new(topics.app_availability(), OFFLINE, QoS::AtLeastOnce, true);
    let options = mqtt_options(config, &client_id, Some(will));

    let (client, eventloop_task) = open_session(options, timeout).await?;
    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        client_id = %client_id,
        "mqtt_session_ready"
    );
    Ok((client, eventloop_task))
}

/// Start a client, spawn its event loop and wait for the broker's ConnAck
///
/// An error before the first ConnAck ends the session and is returned.
/// Afterwards the event loop keeps polling, which reconnects on failure.
pub async fn open_session(
    options: MqttOptions,
    timeout: Duration,
) -> anyhow::Result<(AsyncClient, JoinHandle<()>)> {
    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(drive_eventloop(eventloop, ready_tx));

    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => Ok((client, task)),
        Ok(Ok(Err(reason))) => {
            task.abort();
            anyhow::bail!("broker connection failed: {}", reason)
        }
        Ok(Err(_)) => {
            task.abort();
            anyhow::bail!("broker event loop stopped before connecting")
        }
        Err(_) => {
            task.abort();
            anyhow::bail!("broker did not acknowledge connection within {:?}", timeout)
        }
    }
}

async fn drive_eventloop(mut eventloop: EventLoop, ready_tx: oneshot::Sender<Result<(), String>>) {
    let mut ready = Some(ready_tx);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt_connected");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                // QoS 1 acknowledgement received
                debug!(pkid = %ack.pkid, "mqtt_puback");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt_disconnected_by_broker");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt_disconnect_sent");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                warn!(error = %e, "mqtt_connection_error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

//! Tests for the cycle orchestrator

use super::*;
use crate::io::heartbeat::read_heartbeat;
use crate::io::mqtt::PublishError;
use crate::io::remote::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

/// Publish captured by the recording publisher
#[derive(Debug, Clone)]
struct Sent {
    topic: String,
    qos: QoS,
    retain: bool,
    payload: String,
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingPublisher {
    fn on_topic(&self, topic: &str) -> Vec<Sent> {
        self.sent.lock().iter().filter(|s| s.topic == topic).cloned().collect()
    }

    fn topics_in_order(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.topic.clone()).collect()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &str,
    ) -> Result<(), PublishError> {
        self.sent.lock().push(Sent {
            topic: topic.to_string(),
            qos,
            retain,
            payload: payload.to_string(),
        });
        Ok(())
    }
}

/// Bounded queue drained by a slow consumer task, like the broker client's
/// request channel in front of a busy event loop
struct QueuedPublisher {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl Publisher for QueuedPublisher {
    async fn publish(
        &self,
        topic: &str,
        _qos: QoS,
        _retain: bool,
        _payload: &str,
    ) -> Result<(), PublishError> {
        self.tx.send(topic.to_string()).await.map_err(|e| PublishError {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Serves snapshot bytes by remote path and records every remote call
#[derive(Default)]
struct FakeTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    fail_exec: bool,
}

impl FakeTransport {
    fn with_snapshots(items: Value, devices: Value) -> Self {
        let transport = Self::default();
        transport.set(crate::infra::config::DEFAULT_ITEMS_PATH, items.to_string().into_bytes());
        transport.set(crate::infra::config::DEFAULT_DEVICES_PATH, devices.to_string().into_bytes());
        transport
    }

    fn set(&self, remote: &str, bytes: Vec<u8>) {
        self.files.lock().insert(remote.to_string(), bytes);
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<(), TransportError> {
        self.calls.lock().push(format!("exec {}", command));
        if self.fail_exec {
            return Err(TransportError::Session {
                command: command.to_string(),
                detail: "exit status 255: Connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<(), TransportError> {
        self.calls.lock().push(format!("fetch {}", remote_path));
        let bytes = self.files.lock().get(remote_path).cloned().ok_or_else(|| {
            TransportError::Fetch {
                remote: remote_path.to_string(),
                detail: "no such file".to_string(),
            }
        })?;
        std::fs::write(local_path, bytes).map_err(|e| TransportError::Fetch {
            remote: remote_path.to_string(),
            detail: e.to_string(),
        })
    }
}

struct Harness {
    bridge: Bridge<FakeTransport, RecordingPublisher>,
    metrics: Arc<CycleMetrics>,
    dir: TempDir,
}

impl Harness {
    fn heartbeat_path(&self) -> PathBuf {
        self.dir.path().join("last_cycle")
    }
}

fn harness(transport: FakeTransport) -> Harness {
    let dir = tempdir().unwrap();
    let config = Config::default()
        .with_no_delays()
        .with_local_paths(&dir.path().join("work"), &dir.path().join("last_cycle"));
    let metrics = Arc::new(CycleMetrics::new());
    let bridge = Bridge::new(config, transport, RecordingPublisher::default(), metrics.clone());
    Harness { bridge, metrics, dir }
}

fn airtag(identifier: &str) -> Value {
    json!({
        "identifier": identifier,
        "name": "Keys",
        "productType": {
            "productInformation": {"manufacturerName": "Apple", "modelName": "AirTag"}
        },
        "location": {"latitude": 1.0, "longitude": 2.0, "timeStamp": 1700000000000u64}
    })
}

fn phone(id: &str) -> Value {
    json!({
        "deviceDiscoveryId": id,
        "name": "Phone",
        "locationCapable": true,
        "deviceModel": "iPhone15,2",
        "deviceClass": "iPhone",
        "location": {"latitude": 5.0, "longitude": 6.0, "timeStamp": 1700000000000u64}
    })
}

#[tokio::test]
async fn test_single_item_cycle() {
    let mut h = harness(FakeTransport::with_snapshots(json!([airtag("X1")]), json!([])));

    let report = h.bridge.run_cycle().await.unwrap();
    assert_eq!(report.items_seen, 1);
    assert_eq!(report.published, 1);
    assert_eq!(report.discovered, 1);
    assert!(report.heartbeat_written);

    let publisher = h.bridge.publisher();
    let discovery = publisher.on_topic("homeassistant/device_tracker/find_my/X1/config");
    assert_eq!(discovery.len(), 1);
    assert!(discovery[0].retain);
    assert_eq!(discovery[0].qos, QoS::AtLeastOnce);

    let availability = publisher.on_topic("find_my/devices/X1/availability");
    assert_eq!(availability.len(), 1);
    assert_eq!(availability[0].payload, "online");

    let state = publisher.on_topic("find_my/devices/X1/state");
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].payload, "None");
    assert!(!state[0].retain);

    let attrs = publisher.on_topic("find_my/devices/X1/attributes");
    assert_eq!(attrs.len(), 1);
    let attrs: Value = serde_json::from_str(&attrs[0].payload).unwrap();
    assert_eq!(attrs["latitude"], json!(1.0));
    assert_eq!(attrs["longitude"], json!(2.0));
    assert_eq!(attrs["timestamp"], json!("2023-11-14T22:13:20+00:00"));

    assert!(read_heartbeat(&h.heartbeat_path()).is_ok());
}

#[tokio::test]
async fn test_discovery_once_state_every_cycle() {
    let mut h = harness(FakeTransport::with_snapshots(json!([airtag("X1")]), json!([])));

    h.bridge.run_cycle().await.unwrap();
    let second = h.bridge.run_cycle().await.unwrap();
    assert_eq!(second.discovered, 0);

    let publisher = h.bridge.publisher();
    assert_eq!(publisher.on_topic("homeassistant/device_tracker/find_my/X1/config").len(), 1);
    assert_eq!(publisher.on_topic("find_my/devices/X1/state").len(), 2);
    assert_eq!(publisher.on_topic("find_my/devices/X1/attributes").len(), 2);
    assert_eq!(h.bridge.discovery_cache().len(), 1);
    assert_eq!(h.metrics.snapshot().cycles, 2);
}

#[tokio::test]
async fn test_items_before_devices_and_per_entity_order() {
    let transport = FakeTransport::with_snapshots(json!([airtag("X1")]), json!([phone("P-1")]));
    let mut h = harness(transport);
    h.bridge.run_cycle().await.unwrap();

    let order = h.bridge.publisher().topics_in_order();
    assert_eq!(
        order,
        vec![
            "homeassistant/device_tracker/find_my/X1/config",
            "find_my/devices/X1/availability",
            "find_my/devices/X1/state",
            "find_my/devices/X1/attributes",
            "find_my/devices/X1/raw",
            "homeassistant/device_tracker/find_my/P1/config",
            "find_my/devices/P1/availability",
            "find_my/devices/P1/state",
            "find_my/devices/P1/attributes",
            "find_my/devices/P1/raw",
        ]
    );
}

#[tokio::test]
async fn test_remote_call_sequence() {
    let mut h = harness(FakeTransport::with_snapshots(json!([]), json!([])));
    h.bridge.run_cycle().await.unwrap();

    let calls = h.bridge.transport.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            "exec open com.apple.findmy".to_string(),
            format!("fetch {}", crate::infra::config::DEFAULT_ITEMS_PATH),
            format!("fetch {}", crate::infra::config::DEFAULT_DEVICES_PATH),
            "exec open com.apple.weather".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_no_heartbeat_when_nothing_published() {
    let mut not_capable = phone("P2");
    not_capable["locationCapable"] = json!(false);
    let items = json!([{"identifier": "broken"}]);
    let mut h = harness(FakeTransport::with_snapshots(items, json!([not_capable])));

    let report = h.bridge.run_cycle().await.unwrap();
    assert_eq!(report.rejected, 2);
    assert_eq!(report.published, 0);
    assert!(!report.heartbeat_written);
    assert!(!h.heartbeat_path().exists());
    assert!(h.bridge.publisher().topics_in_order().is_empty());
    assert_eq!(h.metrics.snapshot().records_rejected, 2);
}

#[tokio::test]
async fn test_malformed_record_does_not_abort_batch() {
    let items =
        json!([{"name": 42}, "garbage", airtag("X1"), {"identifier": "X2", "location": null}]);
    let mut h = harness(FakeTransport::with_snapshots(items, json!([])));

    let report = h.bridge.run_cycle().await.unwrap();
    assert_eq!(report.items_seen, 4);
    assert_eq!(report.rejected, 3);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_unparsable_snapshot_skipped() {
    let transport = FakeTransport::with_snapshots(json!([]), json!([phone("P1")]));
    transport.set(crate::infra::config::DEFAULT_ITEMS_PATH, b"{truncated".to_vec());
    let mut h = harness(transport);

    let report = h.bridge.run_cycle().await.unwrap();
    assert_eq!(report.items_seen, 0);
    assert_eq!(report.devices_seen, 1);
    assert_eq!(report.published, 1);
    assert_eq!(report.snapshots_unparsable, 1);

    h.bridge.run_cycle().await.unwrap();
    assert_eq!(h.metrics.snapshot().snapshots_unparsable, 2);
}

#[tokio::test]
async fn test_large_cycle_waits_for_slow_queue() {
    let dir = tempdir().unwrap();
    let config = Config::default()
        .with_no_delays()
        .with_local_paths(&dir.path().join("work"), &dir.path().join("hb"));

    // 40 tags make 200 publishes through a queue holding 8
    let items: Vec<Value> = (0..40).map(|i| airtag(&format!("TAG{}", i))).collect();
    let transport = FakeTransport::with_snapshots(Value::Array(items), json!([]));
    let (tx, mut rx) = mpsc::channel(8);
    let consumer = tokio::spawn(async move {
        let mut topics = Vec::new();
        while let Some(topic) = rx.recv().await {
            topics.push(topic);
            tokio::task::yield_now().await;
        }
        topics
    });

    let metrics = Arc::new(CycleMetrics::new());
    let mut bridge = Bridge::new(config, transport, QueuedPublisher { tx }, metrics.clone());
    let report = bridge.run_cycle().await.unwrap();
    assert_eq!(report.published, 40);
    assert_eq!(report.publish_failed, 0);
    assert_eq!(bridge.discovery_cache().len(), 40);

    drop(bridge);
    let topics = consumer.await.unwrap();
    assert_eq!(topics.len(), 200);
    assert_eq!(topics.last().map(String::as_str), Some("find_my/devices/TAG39/raw"));
    assert_eq!(metrics.snapshot().publish_failures, 0);
}

#[tokio::test]
async fn test_transport_failure_is_fatal() {
    let transport = FakeTransport { fail_exec: true, ..Default::default() };
    let mut h = harness(transport);

    let err = h.bridge.run_cycle().await.unwrap_err();
    assert!(err.to_string().contains("wake command failed"));
    assert!(h.bridge.publisher().topics_in_order().is_empty());
}

#[tokio::test]
async fn test_missing_remote_file_is_fatal() {
    let transport = FakeTransport::default();
    let mut h = harness(transport);
    assert!(h.bridge.run_cycle().await.is_err());
}

#[tokio::test]
async fn test_device_without_location_published() {
    let mut device = phone("P1");
    device.as_object_mut().unwrap().remove("location");
    let mut h = harness(FakeTransport::with_snapshots(json!([]), json!([device])));

    let report = h.bridge.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);
    let attrs = h.bridge.publisher().on_topic("find_my/devices/P1/attributes");
    let attrs: Value = serde_json::from_str(&attrs[0].payload).unwrap();
    assert!(attrs.get("latitude").is_none());
    assert!(attrs.get("timestamp").is_none());
}

#[tokio::test]
async fn test_process_record_twice() {
    let mut h = harness(FakeTransport::default());
    let record = airtag("X1");

    let first = h.bridge.process_record(RecordKind::Item, &record).await;
    let second = h.bridge.process_record(RecordKind::Item, &record).await;
    assert_eq!(first, RecordOutcome::Published { discovered: true });
    assert_eq!(second, RecordOutcome::Published { discovered: false });

    let publisher = h.bridge.publisher();
    assert_eq!(publisher.on_topic("homeassistant/device_tracker/find_my/X1/config").len(), 1);
    assert_eq!(publisher.on_topic("find_my/devices/X1/state").len(), 2);
    assert_eq!(publisher.on_topic("find_my/devices/X1/attributes").len(), 2);

    publisher.clear();
    let rejected = h.bridge.process_record(RecordKind::Item, &json!({"identifier": "X9"})).await;
    assert_eq!(rejected, RecordOutcome::Rejected);
    assert!(h.bridge.publisher().topics_in_order().is_empty());
}

#[tokio::test]
async fn test_announce_online() {
    let h = harness(FakeTransport::default());
    assert!(h.bridge.announce_online().await);
    let sent = h.bridge.publisher().on_topic("find_my/availability");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, "online");
    assert!(sent[0].retain);
    assert_eq!(sent[0].qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_announce_offline_replaces_online() {
    let h = harness(FakeTransport::default());
    h.bridge.announce_online().await;
    assert!(h.bridge.announce_offline().await);

    let sent = h.bridge.publisher().on_topic("find_my/availability");
    assert_eq!(sent.len(), 2);
    let last = &sent[1];
    assert_eq!(last.payload, "offline");
    assert!(last.retain);
    assert_eq!(last.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_nudge_disabled() {
    let dir = tempdir().unwrap();
    let config = Config::default()
        .with_no_delays()
        .with_local_paths(dir.path(), &dir.path().join("hb"))
        .with_nudge_command(None);
    let transport = FakeTransport::with_snapshots(json!([]), json!([]));
    let metrics = Arc::new(CycleMetrics::new());
    let mut bridge = Bridge::new(config, transport, RecordingPublisher::default(), metrics);

    bridge.run_cycle().await.unwrap();
    let calls = bridge.transport.calls.lock().clone();
    assert!(!calls.iter().any(|c| c.contains("weather")));
}

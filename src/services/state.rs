//! Per-cycle availability, state and attribute publishing

use crate::domain::topics::Topics;
use crate::domain::types::NormalizedEntry;
use crate::io::mqtt::{publish_logged, Publisher, ONLINE};
use rumqttc::QoS;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// State placeholder; zone presence is derived from the attributes instead
pub const STATE_PLACEHOLDER: &str = "None";

/// Attribute payload. Absent source values are left out entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributesPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antenna_power: Option<Value>,
    pub address: String,
    /// RFC 3339 with the configured zone's offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl AttributesPayload {
    pub fn from_entry(entry: &NormalizedEntry) -> Self {
        let fix = entry.location.as_ref();
        Self {
            latitude: fix.map(|f| f.latitude),
            longitude: fix.map(|f| f.longitude),
            altitude: fix.and_then(|f| f.altitude),
            vertical_accuracy: fix.and_then(|f| f.vertical_accuracy),
            gps_accuracy: fix.and_then(|f| f.gps_accuracy),
            battery_status: entry.battery_status.clone().filter(|v| !v.is_null()),
            antenna_power: entry.antenna_power.clone().filter(|v| !v.is_null()),
            address: entry.address.clone(),
            timestamp: fix.map(|f| f.timestamp.to_rfc3339()),
        }
    }
}

/// Publish availability, state, attributes and the raw record for one entry
///
/// Returns `true` when availability, state and attributes were all handed off.
/// The raw debug publish is best-effort and does not affect the result.
pub async fn publish_entry<P: Publisher + ?Sized>(
    publisher: &P,
    topics: &Topics,
    entry: &NormalizedEntry,
) -> bool {
    let id = &entry.device_id;

    // Mark the entity online for this update
    let availability = topics.availability(id);
    let mut ok =
        publish_logged(publisher, &availability, ONLINE, QoS::AtLeastOnce, true, None).await;

    let state = topics.state(id);
    ok &= publish_logged(publisher, &state, STATE_PLACEHOLDER, QoS::AtLeastOnce, false, None)
        .await;

    match serde_json::to_string(&AttributesPayload::from_entry(entry)) {
        Ok(json) => {
            let attributes = topics.attributes(id);
            ok &= publish_logged(publisher, &attributes, &json, QoS::AtLeastOnce, false, None)
                .await;
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "attributes_encode_failed");
            ok = false;
        }
    }

    if let Some(raw) = &entry.raw {
        match serde_json::to_string(raw) {
            Ok(json) => {
                let raw_topic = topics.raw(id);
                let label = Some("raw");
                publish_logged(publisher, &raw_topic, &json, QoS::AtMostOnce, false, label).await;
            }
            Err(e) => warn!(device_id = %id, error = %e, "raw_encode_failed"),
        }
    }

    ok
}

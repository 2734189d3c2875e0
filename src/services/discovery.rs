//! Discovery metadata, published once per device id per process run

use crate::domain::expiry::expire_for;
use crate::domain::topics::Topics;
use crate::domain::types::{DeviceId, NormalizedEntry};
use crate::io::mqtt::{publish_logged, Publisher};
use rumqttc::QoS;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::warn;

pub const SOURCE_TYPE: &str = "gps";
pub const ICON: &str = "mdi:map-marker";

/// Device ids whose discovery config went out during this run
///
/// Starts empty, only grows, and is not persisted.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    published: FxHashSet<DeviceId>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.published.contains(id)
    }

    pub fn len(&self) -> usize {
        self.published.len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty()
    }

    fn insert(&mut self, id: DeviceId) {
        self.published.insert(id);
    }
}

/// Device tracker discovery payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    pub unique_id: String,
    pub name: String,
    pub state_topic: String,
    pub json_attributes_topic: String,
    pub availability_topic: String,
    pub source_type: &'static str,
    pub icon: &'static str,
    pub expire_after: u64,
    pub device: DeviceBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceBlock {
    pub manufacturer: String,
    pub model: String,
    pub identifiers: String,
    pub name: String,
    pub sw_version: String,
}

impl DiscoveryConfig {
    pub fn for_entry(entry: &NormalizedEntry, topics: &Topics) -> Self {
        let id = &entry.device_id;
        Self {
            unique_id: format!("findmy_{}", id),
            name: entry.name.clone(),
            state_topic: topics.state(id),
            json_attributes_topic: topics.attributes(id),
            availability_topic: topics.availability(id),
            source_type: SOURCE_TYPE,
            icon: ICON,
            expire_after: expire_for(&entry.model_or_class),
            device: DeviceBlock {
                manufacturer: entry.manufacturer.clone(),
                model: entry.model.clone(),
                identifiers: id.to_string(),
                name: entry.name.clone(),
                sw_version: entry.sw_version.clone(),
            },
        }
    }
}

/// Publish discovery for `entry` unless this run already did
///
/// The id is cached only after the publish was handed to the client, so a
/// rejected handoff is retried on the next cycle. Returns `true` if it published.
pub async fn maybe_publish_discovery<P: Publisher + ?Sized>(
    publisher: &P,
    topics: &Topics,
    entry: &NormalizedEntry,
    cache: &mut DiscoveryCache,
) -> bool {
    if cache.contains(&entry.device_id) {
        return false;
    }

    let config = DiscoveryConfig::for_entry(entry, topics);
    let payload = match serde_json::to_string(&config) {
        Ok(json) => json,
        Err(e) => {
            warn!(device_id = %entry.device_id, error = %e, "discovery_encode_failed");
            return false;
        }
    };

    let topic = topics.discovery(&entry.device_id);
    let label = Some("discovery");
    if !publish_logged(publisher, &topic, &payload, QoS::AtLeastOnce, true, label).await {
        return false;
    }
    cache.insert(entry.device_id.clone());
    true
}

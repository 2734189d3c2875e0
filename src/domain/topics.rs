//! Broker topic layout
//!
//! - `<discovery>/device_tracker/<scope>/<id>/config` - discovery metadata
//! - `<base>/devices/<id>/{state,attributes,availability,raw}` - per-entity channels
//! - `<base>/availability` - bridge-level availability and last will

use crate::domain::types::DeviceId;
use crate::infra::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    discovery_prefix: String,
    discovery_scope: String,
    base: String,
}

impl Topics {
    pub fn new(discovery_prefix: &str, discovery_scope: &str, base: &str) -> Self {
        Self {
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            discovery_scope: discovery_scope.trim_matches('/').to_string(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.discovery_prefix(), config.discovery_scope(), config.base_topic())
    }

    pub fn discovery(&self, id: &DeviceId) -> String {
        format!("{}/device_tracker/{}/{}/config", self.discovery_prefix, self.discovery_scope, id)
    }

    pub fn state(&self, id: &DeviceId) -> String {
        self.device(id, "state")
    }

    pub fn attributes(&self, id: &DeviceId) -> String {
        self.device(id, "attributes")
    }

    pub fn availability(&self, id: &DeviceId) -> String {
        self.device(id, "availability")
    }

    pub fn raw(&self, id: &DeviceId) -> String {
        self.device(id, "raw")
    }

    /// Bridge-level availability, also used for the last will
    pub fn app_availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    fn device(&self, id: &DeviceId, leaf: &str) -> String {
        format!("{}/devices/{}/{}", self.base, id, leaf)
    }
}

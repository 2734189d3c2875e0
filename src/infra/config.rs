//! Configuration loading
//!
//! Values are layered:
//! 1. Built-in defaults
//! 2. Optional TOML file (`--config <path>` or `CONFIG_FILE`)
//! 3. Environment variables (`MQTT_HOST`, `BASE_TOPIC`, `IOS_URL`, ...)
//!
//! Every setting is optional. Empty environment values count as unset.

use anyhow::Context;
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_ITEMS_PATH: &str =
    "/private/var/mobile/Library/Caches/com.apple.findmy.fmipcore/Items.data";
pub const DEFAULT_DEVICES_PATH: &str =
    "/private/var/mobile/Library/Caches/com.apple.findmy.fmipcore/Devices.data";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TopicsConfig {
    /// Discovery prefix watched by the automation platform
    #[serde(default)]
    pub discovery_prefix: Option<String>,
    /// Scope segment between `device_tracker` and the device id
    #[serde(default)]
    pub discovery_scope: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    #[serde(default)]
    pub items_path: Option<String>,
    #[serde(default)]
    pub devices_path: Option<String>,
    #[serde(default)]
    pub wake_command: Option<String>,
    /// Set to an empty string to disable the nudge
    #[serde(default)]
    pub nudge_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CycleConfig {
    #[serde(default)]
    pub settle_secs: Option<u64>,
    #[serde(default)]
    pub sleep_secs: Option<u64>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HealthConfig {
    #[serde(default)]
    pub heartbeat_file: Option<PathBuf>,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_client_id: Option<String>,
    discovery_prefix: String,
    discovery_scope: String,
    base_topic: String,
    time_zone: Tz,
    remote_host: String,
    remote_port: u16,
    remote_username: String,
    remote_key_file: PathBuf,
    known_hosts: PathBuf,
    items_path: String,
    devices_path: String,
    wake_command: String,
    nudge_command: Option<String>,
    settle_secs: u64,
    sleep_secs: u64,
    work_dir: PathBuf,
    heartbeat_file: PathBuf,
    heartbeat_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: None,
            discovery_prefix: "homeassistant".to_string(),
            discovery_scope: "find_my".to_string(),
            base_topic: "find_my".to_string(),
            time_zone: Tz::UTC,
            remote_host: String::new(),
            remote_port: 22,
            remote_username: "root".to_string(),
            remote_key_file: PathBuf::from("/ssh/id_rsa"),
            known_hosts: PathBuf::from("/ssh/known_hosts"),
            items_path: DEFAULT_ITEMS_PATH.to_string(),
            devices_path: DEFAULT_DEVICES_PATH.to_string(),
            wake_command: "open com.apple.findmy".to_string(),
            nudge_command: Some("open com.apple.weather".to_string()),
            settle_secs: 5,
            sleep_secs: 5,
            work_dir: env::temp_dir().join("findmy-bridge"),
            heartbeat_file: PathBuf::from("/tmp/last_cycle"),
            heartbeat_max_age_secs: 900,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, on top of the defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self::default();
        config.config_file = path.display().to_string();
        config.apply_toml(toml_config);
        Ok(config)
    }

    /// Load from a TOML file, falling back to defaults if it cannot be used
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_file_unusable_using_defaults");
                Self::default()
            }
        }
    }

    /// Full resolution used by the binaries: defaults, optional file, then environment
    pub fn resolve(path: Option<&str>) -> Self {
        let mut config = match path {
            Some(path) => Self::load_from_path(path),
            None => Self::default(),
        };
        config.apply_env_with(|key| env::var(key).ok());
        config
    }

    fn apply_toml(&mut self, toml: TomlConfig) {
        let TomlConfig { mqtt, topics, remote, cycle, health } = toml;

        set(&mut self.mqtt_host, mqtt.host);
        set(&mut self.mqtt_port, mqtt.port);
        set_opt(&mut self.mqtt_username, mqtt.username);
        set_opt(&mut self.mqtt_password, mqtt.password);
        set_opt(&mut self.mqtt_client_id, mqtt.client_id);

        set(&mut self.discovery_prefix, topics.discovery_prefix);
        set(&mut self.discovery_scope, topics.discovery_scope);
        set(&mut self.base_topic, topics.base);

        set(&mut self.remote_host, remote.host);
        set(&mut self.remote_port, remote.port);
        set(&mut self.remote_username, remote.username);
        set(&mut self.remote_key_file, remote.key_file);
        set(&mut self.known_hosts, remote.known_hosts);
        set(&mut self.items_path, remote.items_path);
        set(&mut self.devices_path, remote.devices_path);
        set(&mut self.wake_command, remote.wake_command);
        if let Some(nudge) = remote.nudge_command {
            self.nudge_command = Some(nudge).filter(|cmd| !cmd.trim().is_empty());
        }

        set(&mut self.settle_secs, cycle.settle_secs);
        set(&mut self.sleep_secs, cycle.sleep_secs);
        set(&mut self.work_dir, cycle.work_dir);
        if let Some(name) = cycle.time_zone {
            self.time_zone = parse_time_zone(&name);
        }

        set(&mut self.heartbeat_file, health.heartbeat_file);
        set(&mut self.heartbeat_max_age_secs, health.max_age_secs);
    }

    /// Apply environment overrides through `lookup` (e.g. `std::env::var`)
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        set(&mut self.mqtt_host, get("MQTT_HOST"));
        set(&mut self.mqtt_port, parse_env(&get, "MQTT_PORT"));
        set_opt(&mut self.mqtt_username, get("MQTT_USERNAME"));
        set_opt(&mut self.mqtt_password, get("MQTT_PASSWORD"));
        set_opt(&mut self.mqtt_client_id, get("MQTT_CLIENT_ID"));

        set(&mut self.discovery_prefix, get("DISCOVERY_PREFIX"));
        set(&mut self.discovery_scope, get("DISCOVERY_SCOPE"));
        set(&mut self.base_topic, get("BASE_TOPIC"));
        if let Some(name) = get("TZ") {
            self.time_zone = parse_time_zone(&name);
        }

        set(&mut self.remote_host, get("IOS_URL"));
        set(&mut self.remote_port, parse_env(&get, "IOS_PORT"));
        set(&mut self.remote_username, get("IOS_USERNAME"));
        set(&mut self.remote_key_file, get("IOS_KEYFILE").map(PathBuf::from));
        set(&mut self.known_hosts, get("KNOWN_HOSTS").map(PathBuf::from));

        set(&mut self.settle_secs, parse_env(&get, "SETTLE_SECS"));
        set(&mut self.sleep_secs, parse_env(&get, "SLEEP_SECS"));
        set(&mut self.work_dir, get("WORK_DIR").map(PathBuf::from));
        set(&mut self.heartbeat_file, get("HEARTBEAT_FILE").map(PathBuf::from));
        set(&mut self.heartbeat_max_age_secs, parse_env(&get, "HEARTBEAT_MAX_AGE_SECS"));
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_client_id(&self) -> Option<&str> {
        self.mqtt_client_id.as_deref()
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    pub fn discovery_scope(&self) -> &str {
        &self.discovery_scope
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn remote_username(&self) -> &str {
        &self.remote_username
    }

    pub fn remote_key_file(&self) -> &Path {
        &self.remote_key_file
    }

    pub fn known_hosts(&self) -> &Path {
        &self.known_hosts
    }

    pub fn items_path(&self) -> &str {
        &self.items_path
    }

    pub fn devices_path(&self) -> &str {
        &self.devices_path
    }

    pub fn wake_command(&self) -> &str {
        &self.wake_command
    }

    pub fn nudge_command(&self) -> Option<&str> {
        self.nudge_command.as_deref()
    }

    pub fn settle_secs(&self) -> u64 {
        self.settle_secs
    }

    pub fn sleep_secs(&self) -> u64 {
        self.sleep_secs
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn heartbeat_file(&self) -> &Path {
        &self.heartbeat_file
    }

    pub fn heartbeat_max_age_secs(&self) -> u64 {
        self.heartbeat_max_age_secs
    }

    /// Builder method for tests to skip the fixed delays
    #[cfg(test)]
    pub fn with_no_delays(mut self) -> Self {
        self.settle_secs = 0;
        self.sleep_secs = 0;
        self
    }

    /// Builder method for tests to redirect local files
    #[cfg(test)]
    pub fn with_local_paths(mut self, work_dir: &Path, heartbeat_file: &Path) -> Self {
        self.work_dir = work_dir.to_path_buf();
        self.heartbeat_file = heartbeat_file.to_path_buf();
        self
    }

    /// Builder method for tests to change the nudge command
    #[cfg(test)]
    pub fn with_nudge_command(mut self, command: Option<&str>) -> Self {
        self.nudge_command = command.map(str::to_string);
        self
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_env<T, G>(get: &G, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "config_env_value_ignored");
            None
        }
    }
}

/// Parse an IANA zone name, falling back to UTC
pub fn parse_time_zone(name: &str) -> Tz {
    name.trim().parse::<Tz>().unwrap_or_else(|_| {
        warn!(time_zone = %name, "unknown_time_zone_using_utc");
        Tz::UTC
    })
}

//! Source record shapes and the normalized entity model
//!
//! Both snapshots are arrays of loosely-typed JSON objects. The structs here
//! describe the fields we read from each shape; everything is optional at the
//! serde level so that required-field checks happen in the normalizer with a
//! named rejection reason. A type mismatch (e.g. a string latitude) still fails
//! deserialization and rejects the whole record.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Which snapshot a raw record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `Items.data` - AirTags and third-party accessories
    Item,
    /// `Devices.data` - phones, tablets, watches, computers
    Device,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Item => "item",
            RecordKind::Device => "device",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic-safe device identifier with `:` and `-` separators removed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Normalize a source identifier into a device id.
    ///
    /// Returns `None` when nothing is left after normalization or when the
    /// result contains characters that would break the topic layout.
    pub fn parse(raw: &str) -> Option<Self> {
        let id = normalize_device_id(raw);
        if id.is_empty() || id.contains(['/', '+', '#']) || id.contains(char::is_whitespace) {
            return None;
        }
        Some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip `:` and `-` separators and surrounding whitespace
pub fn normalize_device_id(raw: &str) -> String {
    raw.replace([':', '-'], "").trim().to_string()
}

/// Entry in `Items.data`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
    pub system_version: Option<String>,
    pub product_type: Option<ProductType>,
    pub address: Option<Address>,
    pub location: Option<Location>,
    pub battery_status: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductType {
    pub product_information: Option<ProductInformation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInformation {
    pub manufacturer_name: Option<String>,
    pub model_name: Option<String>,
    pub antenna_power: Option<Value>,
}

/// Entry in `Devices.data`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_discovery_id: Option<String>,
    pub name: Option<String>,
    pub location_capable: Option<bool>,
    pub device_model: Option<String>,
    pub device_class: Option<String>,
    pub device_display_name: Option<String>,
    pub address: Option<Address>,
    pub location: Option<Location>,
    pub battery_status: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub map_item_full_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub vertical_accuracy: Option<f64>,
    pub horizontal_accuracy: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_epoch_ms")]
    pub time_stamp: Option<i64>,
}

/// Raw record tagged by its source snapshot
#[derive(Debug)]
pub enum RawRecord {
    Item(ItemRecord),
    Device(DeviceRecord),
}

/// Location fix attached to an entry
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub vertical_accuracy: Option<f64>,
    pub gps_accuracy: Option<f64>,
    pub timestamp: DateTime<Tz>,
}

/// Unified entity produced from either record shape
#[derive(Debug, Clone)]
pub struct NormalizedEntry {
    pub device_id: DeviceId,
    /// Original source identifier
    pub unique_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub address: String,
    /// Only used to resolve the expiry policy
    pub model_or_class: String,
    /// `None` for devices that are known but not located
    pub location: Option<Fix>,
    pub battery_status: Option<Value>,
    pub antenna_power: Option<Value>,
    pub raw: Option<Value>,
}

/// Epoch milliseconds may arrive as an integer, a float or a numeric string
fn deserialize_epoch_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct EpochMsVisitor;

    impl<'de> Visitor<'de> for EpochMsVisitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an epoch milliseconds integer")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            i64::try_from(value).map(Some).map_err(|_| E::custom("timestamp out of range"))
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !value.is_finite() {
                return Err(E::custom("timestamp is not finite"));
            }
            Ok(Some(value.trunc() as i64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value.trim().parse::<i64>().map(Some).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(EpochMsVisitor)
}

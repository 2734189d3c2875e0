//! Entity normalizer
//!
//! Turns one raw snapshot record into a [`NormalizedEntry`], or explains why
//! the record was dropped. Rejection is per record: the caller logs it and
//! moves on to the next one.

use crate::domain::types::{
    Address, DeviceId, DeviceRecord, Fix, ItemRecord, Location, NormalizedEntry, RawRecord,
    RecordKind,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Manufacturer reported for devices without a `deviceClass`
pub const DEFAULT_MANUFACTURER: &str = "Apple";

/// Why a record was not normalized
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("record is not an object")]
    NotAnObject,
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("no usable location")]
    NoLocation,
    #[error("device is not location capable")]
    NotLocationCapable,
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("identifier {0:?} does not yield a usable device id")]
    InvalidDeviceId(String),
}

impl RawRecord {
    /// Read a raw snapshot value as the given record shape
    pub fn from_value(kind: RecordKind, value: &Value) -> Result<Self, Rejection> {
        if !value.is_object() {
            return Err(Rejection::NotAnObject);
        }
        Ok(match kind {
            RecordKind::Item => RawRecord::Item(ItemRecord::deserialize(value)?),
            RecordKind::Device => RawRecord::Device(DeviceRecord::deserialize(value)?),
        })
    }
}

/// Normalize a raw value, returning the entry or the reason it was dropped
pub fn normalize(kind: RecordKind, value: &Value, tz: Tz) -> Result<NormalizedEntry, Rejection> {
    let mut entry = match RawRecord::from_value(kind, value)? {
        RawRecord::Item(item) => normalize_item(item, tz)?,
        RawRecord::Device(device) => normalize_device(device, tz)?,
    };
    entry.raw = Some(value.clone());
    Ok(entry)
}

/// Fail-soft variant: `None` for any rejected record
pub fn normalize_record(kind: RecordKind, value: &Value, tz: Tz) -> Option<NormalizedEntry> {
    match normalize(kind, value, tz) {
        Ok(entry) => Some(entry),
        Err(reason) => {
            debug!(kind = %kind, reason = %reason, "record_dropped");
            None
        }
    }
}

fn normalize_item(item: ItemRecord, tz: Tz) -> Result<NormalizedEntry, Rejection> {
    let identifier = require(item.identifier, "identifier")?;
    let name = require(item.name, "name")?;
    let info = item
        .product_type
        .and_then(|p| p.product_information)
        .ok_or(Rejection::MissingField("productType.productInformation"))?;
    let manufacturer =
        require(info.manufacturer_name, "productType.productInformation.manufacturerName")?;
    let model = require(info.model_name, "productType.productInformation.modelName")?;

    let location = item.location.ok_or(Rejection::NoLocation)?;
    let fix = located_fix(location, tz)?;

    let serial = item.serial_number.unwrap_or_else(|| identifier.clone());
    let device_id = DeviceId::parse(&serial).ok_or(Rejection::InvalidDeviceId(serial))?;

    Ok(NormalizedEntry {
        device_id,
        unique_id: identifier,
        name,
        manufacturer,
        model_or_class: model.clone(),
        model,
        sw_version: item.system_version.unwrap_or_default(),
        address: full_address(item.address),
        location: Some(fix),
        battery_status: item.battery_status,
        antenna_power: info.antenna_power,
        raw: None,
    })
}

fn normalize_device(device: DeviceRecord, tz: Tz) -> Result<NormalizedEntry, Rejection> {
    if device.location_capable != Some(true) {
        return Err(Rejection::NotLocationCapable);
    }
    let identifier = require(device.device_discovery_id, "deviceDiscoveryId")?;
    let name = require(device.name, "name")?;
    let model = require(device.device_model, "deviceModel")?;
    let manufacturer = device.device_class.unwrap_or_else(|| DEFAULT_MANUFACTURER.to_string());

    // Known but not located: keep the entry, drop the fix
    let location = match device.location {
        Some(loc) if loc.latitude.is_some() && loc.longitude.is_some() => {
            Some(located_fix(loc, tz)?)
        }
        _ => None,
    };

    let device_id =
        DeviceId::parse(&identifier).ok_or_else(|| Rejection::InvalidDeviceId(identifier.clone()))?;

    Ok(NormalizedEntry {
        device_id,
        unique_id: identifier,
        name,
        model_or_class: if manufacturer.is_empty() { model.clone() } else { manufacturer.clone() },
        manufacturer,
        model,
        sw_version: device.device_display_name.unwrap_or_default(),
        address: full_address(device.address),
        location,
        battery_status: device.battery_status,
        antenna_power: None,
        raw: None,
    })
}

fn located_fix(location: Location, tz: Tz) -> Result<Fix, Rejection> {
    let latitude = location.latitude.ok_or(Rejection::MissingField("location.latitude"))?;
    let longitude = location.longitude.ok_or(Rejection::MissingField("location.longitude"))?;
    let ms = location.time_stamp.ok_or(Rejection::MissingField("location.timeStamp"))?;
    Ok(Fix {
        latitude,
        longitude,
        altitude: location.altitude,
        vertical_accuracy: location.vertical_accuracy,
        gps_accuracy: location.horizontal_accuracy,
        timestamp: timestamp_in_zone(ms, tz)?,
    })
}

/// Convert epoch milliseconds (truncated to whole seconds) into the given zone
pub fn timestamp_in_zone(epoch_ms: i64, tz: Tz) -> Result<DateTime<Tz>, Rejection> {
    DateTime::<Utc>::from_timestamp(epoch_ms.div_euclid(1000), 0)
        .map(|utc| utc.with_timezone(&tz))
        .ok_or(Rejection::InvalidTimestamp(epoch_ms))
}

fn full_address(address: Option<Address>) -> String {
    address.and_then(|a| a.map_item_full_address).unwrap_or_default()
}

fn require(value: Option<String>, field: &'static str) -> Result<String, Rejection> {
    value.ok_or(Rejection::MissingField(field))
}

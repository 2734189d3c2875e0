//! Domain models - record types and the rules applied to them
//!
//! - `types` - raw snapshot records, `DeviceId`, `NormalizedEntry`
//! - `normalize` - raw record to entry, or a rejection reason
//! - `topics` - MQTT topic layout
//! - `expiry` - staleness window per device class

pub mod expiry;
pub mod normalize;
pub mod topics;
pub mod types;

pub use normalize::{normalize, Rejection};
pub use topics::Topics;
pub use types::{DeviceId, NormalizedEntry, RecordKind};

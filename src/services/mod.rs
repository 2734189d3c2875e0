//! Services - the polling cycle and what it publishes
//!
//! - `bridge` - cycle orchestrator
//! - `discovery` - once-per-run discovery configs
//! - `state` - availability, state and attributes every cycle
//! - `liveness` - checks behind the health check binary

pub mod bridge;
pub mod discovery;
pub mod liveness;
pub mod state;

pub use bridge::{Bridge, CycleReport, RecordOutcome};
pub use discovery::DiscoveryCache;

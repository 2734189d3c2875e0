//! Infrastructure - configuration and metrics
//!
//! - `config` - defaults, TOML file, environment overrides
//! - `metrics` - lock-free counters across cycles

pub mod config;
pub mod metrics;

pub use config::Config;
pub use metrics::CycleMetrics;

//! Staleness timeouts per device class
//!
//! Matching is a case-insensitive substring test against an ordered table;
//! the first hit wins, so more specific names must come before shorter ones
//! they contain.

/// Timeout used when no class matches (seconds)
pub const EXPIRE_DEFAULT_SECS: u64 = 3600;

/// Ordered (class, timeout seconds) pairs
pub const EXPIRE_BY_CLASS: &[(&str, u64)] = &[
    ("iPhone", 1800),
    ("iPad", 1800),
    ("Watch", 1800),
    ("Mac", 7200),
    ("AirTag", 21600),
    ("Accessory", 21600),
];

/// Resolve the `expire_after` value for a model or device class
pub fn expire_for(model_or_class: &str) -> u64 {
    let haystack = model_or_class.to_lowercase();
    EXPIRE_BY_CLASS
        .iter()
        .find(|(class, _)| haystack.contains(&class.to_lowercase()))
        .map(|&(_, secs)| secs)
        .unwrap_or(EXPIRE_DEFAULT_SECS)
}

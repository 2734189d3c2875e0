//! Heartbeat marker
//!
//! A single file holding a decimal Unix timestamp. The bridge overwrites it
//! after every cycle that published something; the health check reads it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat file is missing")]
    Missing,
    #[error("cannot read heartbeat: {0}")]
    Unreadable(#[source] std::io::Error),
    #[error("invalid heartbeat value {0:?}")]
    Unparsable(String),
}

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Atomically replace the heartbeat with `unix_secs`
///
/// Writes a sibling temp file and renames it over the target so readers
/// never observe a partial value.
pub fn write_heartbeat(path: &Path, unix_secs: i64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        write!(file, "{}", unix_secs)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), ts = %unix_secs, "heartbeat_written");
    Ok(())
}

pub fn read_heartbeat(path: &Path) -> Result<i64, HeartbeatError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(HeartbeatError::Missing),
        Err(e) => return Err(HeartbeatError::Unreadable(e)),
    };
    let trimmed = content.trim();
    trimmed.parse::<i64>().map_err(|_| HeartbeatError::Unparsable(trimmed.to_string()))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

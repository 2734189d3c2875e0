//! Cycle orchestrator
//!
//! One cycle: wake the source app, let it settle, download both snapshots,
//! normalize and publish every record (items first, then devices), write the
//! heartbeat if anything went out, then nudge a secondary app. `run` repeats
//! cycles with a fixed pause until a transport failure ends the process.
//!
//! Failure boundary: a bad record or a refused publish is logged and the
//! batch continues. Remote command and download errors propagate out of
//! [`Bridge::run`] untouched; recovery is a supervisor restart.

use crate::domain::normalize::normalize;
use crate::domain::topics::Topics;
use crate::domain::types::RecordKind;
use crate::infra::config::Config;
use crate::infra::metrics::CycleMetrics;
use crate::io::heartbeat::{unix_now, write_heartbeat};
use crate::io::mqtt::{publish_logged, Publisher, OFFLINE, ONLINE};
use crate::io::remote::RemoteTransport;
use crate::services::discovery::{maybe_publish_discovery, DiscoveryCache};
use crate::services::state::publish_entry;
use anyhow::Context;
use chrono_tz::Tz;
use rumqttc::QoS;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Local file names for the downloaded snapshots
const ITEMS_FILE: &str = "Items.data";
const DEVICES_FILE: &str = "Devices.data";

/// What happened to a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Dropped by the normalizer
    Rejected,
    /// State and attributes handed to the broker client
    Published { discovered: bool },
    /// Normalized, but at least one core publish was refused
    PublishFailed,
}

/// Per-cycle tally, logged as `cycle_complete`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub items_seen: usize,
    pub devices_seen: usize,
    pub rejected: usize,
    pub published: usize,
    pub discovered: usize,
    pub publish_failed: usize,
    /// Snapshot files skipped because they were not a JSON array
    pub snapshots_unparsable: usize,
    pub heartbeat_written: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Rejected => self.rejected += 1,
            RecordOutcome::Published { discovered } => {
                self.published += 1;
                if discovered {
                    self.discovered += 1;
                }
            }
            RecordOutcome::PublishFailed => self.publish_failed += 1,
        }
    }

    pub fn log(&self) {
        info!(
            items = %self.items_seen,
            devices = %self.devices_seen,
            rejected = %self.rejected,
            published = %self.published,
            discovered = %self.discovered,
            publish_failed = %self.publish_failed,
            snapshots_unparsable = %self.snapshots_unparsable,
            heartbeat = %self.heartbeat_written,
            "cycle_complete"
        );
    }
}

/// Owns the discovery cache and everything a cycle needs
pub struct Bridge<T, P> {
    config: Config,
    topics: Topics,
    tz: Tz,
    transport: T,
    publisher: P,
    cache: DiscoveryCache,
    metrics: Arc<CycleMetrics>,
}

impl<T: RemoteTransport, P: Publisher> Bridge<T, P> {
    pub fn new(config: Config, transport: T, publisher: P, metrics: Arc<CycleMetrics>) -> Self {
        let topics = Topics::from_config(&config);
        let tz = config.time_zone();
        Self { config, topics, tz, transport, publisher, cache: DiscoveryCache::new(), metrics }
    }

    pub fn discovery_cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publish `online` on the bridge availability channel
    pub async fn announce_online(&self) -> bool {
        self.announce(ONLINE).await
    }

    /// Publish `offline` on the bridge availability channel
    ///
    /// A clean DISCONNECT discards the last will, so a deliberate shutdown
    /// has to retract `online` itself.
    pub async fn announce_offline(&self) -> bool {
        self.announce(OFFLINE).await
    }

    async fn announce(&self, payload: &str) -> bool {
        let topic = self.topics.app_availability();
        publish_logged(&self.publisher, &topic, payload, QoS::AtLeastOnce, true, Some("bridge"))
            .await
    }

    /// Loop forever; only returns on a fatal error
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let pause = Duration::from_secs(self.config.sleep_secs());
        loop {
            self.run_cycle().await?;
            tokio::time::sleep(pause).await;
        }
    }

    /// Run one full poll-parse-publish cycle
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();

        info!(command = %self.config.wake_command(), "waking_source_app");
        self.transport
            .exec(self.config.wake_command())
            .await
            .context("wake command failed")?;
        tokio::time::sleep(Duration::from_secs(self.config.settle_secs())).await;

        let work_dir = self.config.work_dir().to_path_buf();
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("cannot create work dir {}", work_dir.display()))?;

        let (items_local, devices_local) = snapshot_paths(&work_dir);
        self.download(self.config.items_path().to_string(), &items_local).await?;
        self.download(self.config.devices_path().to_string(), &devices_local).await?;

        let items = self.load(&items_local, RecordKind::Item, &mut report)?;
        report.items_seen = items.len();
        info!(count = %items.len(), "items_loaded");
        for value in &items {
            let outcome = self.process_record(RecordKind::Item, value).await;
            report.record(outcome);
        }

        let devices = self.load(&devices_local, RecordKind::Device, &mut report)?;
        report.devices_seen = devices.len();
        info!(count = %devices.len(), "devices_loaded");
        for value in &devices {
            let outcome = self.process_record(RecordKind::Device, value).await;
            report.record(outcome);
        }

        if report.published > 0 {
            let path = self.config.heartbeat_file();
            match write_heartbeat(path, unix_now()) {
                Ok(()) => report.heartbeat_written = true,
                Err(e) => error!(path = %path.display(), error = %e, "heartbeat_write_failed"),
            }
        }

        if let Some(nudge) = self.config.nudge_command() {
            info!(command = %nudge, "nudging_secondary_app");
            self.transport.exec(nudge).await.context("nudge command failed")?;
        }

        self.metrics.record_cycle();
        report.log();
        Ok(report)
    }

    /// Normalize and publish one record; never fails the batch
    pub async fn process_record(&mut self, kind: RecordKind, value: &Value) -> RecordOutcome {
        self.metrics.record_seen();

        let entry = match normalize(kind, value, self.tz) {
            Ok(entry) => entry,
            Err(reason) => {
                self.metrics.record_rejected();
                let name = record_name(value);
                info!(kind = %kind, name = %name, reason = %reason, "record_rejected");
                return RecordOutcome::Rejected;
            }
        };

        let discovered =
            maybe_publish_discovery(&self.publisher, &self.topics, &entry, &mut self.cache).await;
        if discovered {
            self.metrics.record_discovery();
        }

        info!(kind = %kind, name = %entry.name, device_id = %entry.device_id, "publishing_entry");
        if publish_entry(&self.publisher, &self.topics, &entry).await {
            self.metrics.record_published();
            RecordOutcome::Published { discovered }
        } else {
            self.metrics.record_publish_failure();
            RecordOutcome::PublishFailed
        }
    }

    fn load(
        &self,
        path: &Path,
        kind: RecordKind,
        report: &mut CycleReport,
    ) -> anyhow::Result<Vec<Value>> {
        match load_snapshot(path, kind)? {
            Some(records) => Ok(records),
            None => {
                self.metrics.record_snapshot_unparsable();
                report.snapshots_unparsable += 1;
                Ok(Vec::new())
            }
        }
    }

    async fn download(&self, remote: String, local: &Path) -> anyhow::Result<()> {
        self.transport
            .fetch(&remote, local)
            .await
            .with_context(|| format!("download of {} failed", remote))?;
        info!(remote = %remote, local = %local.display(), "snapshot_downloaded");
        Ok(())
    }
}

/// Read a snapshot file as a JSON array
///
/// A file that cannot be read is fatal. Content that is not a JSON array is
/// logged and returned as `None`; the cycle treats it as an empty snapshot.
pub fn load_snapshot(path: &Path, kind: RecordKind) -> anyhow::Result<Option<Vec<Value>>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("cannot read {} snapshot {}", kind, path.display()))?;
    match serde_json::from_slice::<Vec<Value>>(&bytes) {
        Ok(records) => Ok(Some(records)),
        Err(e) => {
            error!(kind = %kind, path = %path.display(), error = %e, "snapshot_unparsable");
            Ok(None)
        }
    }
}

/// Best-effort display name for log lines about rejected records
fn record_name(value: &Value) -> &str {
    value.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
}

/// Local snapshot paths for a work directory
pub fn snapshot_paths(work_dir: &Path) -> (PathBuf, PathBuf) {
    (work_dir.join(ITEMS_FILE), work_dir.join(DEVICES_FILE))
}

#[cfg(test)]
mod tests;

//! Payloads pushed to the webhook and the Prometheus push gateway after a job.

mod handler;

pub use handler::Handler;

use crate::error::Result;
use crate::restic::output::BackupSummary;
use async_trait::async_trait;
use common::Snapshot;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;

const METRIC_NAMESPACE: &str = "k8up";
const METRIC_SUBSYSTEM: &str = "backup_restic";

#[async_trait]
pub trait StatsHandler: Send + Sync {
    async fn send_prometheus(&self, stats: &dyn PrometheusProvider) -> Result<()>;
    async fn send_webhook(&self, stats: &dyn WebhookProvider) -> Result<()>;
}

pub trait PrometheusProvider: Send + Sync {
    fn to_prom(&self) -> Vec<Gauge>;
}

pub trait WebhookProvider: Send + Sync {
    fn to_json(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T> WebhookProvider for T
where
    T: Serialize + Send + Sync,
{
    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gauge {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str, value: f64) -> Self {
        Self {
            name,
            help,
            labels: Vec::new(),
            value,
        }
    }

    pub fn label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }

    fn opts(&self) -> Opts {
        Opts::new(self.name, self.help)
            .namespace(METRIC_NAMESPACE)
            .subsystem(METRIC_SUBSYSTEM)
    }

    pub fn available_snapshots(count: usize) -> Self {
        Gauge::new(
            "available_snapshots",
            "How many snapshots are available",
            count as f64,
        )
    }

    pub fn last_errors(errors: usize, folder: &str, hostname: &str) -> Self {
        Gauge::new(
            "last_errors",
            "How many errors the backup or check had",
            errors as f64,
        )
        .label("pvc", folder)
        .label("namespace", hostname)
    }
}

impl PrometheusProvider for Vec<Gauge> {
    fn to_prom(&self) -> Vec<Gauge> {
        self.clone()
    }
}

/// Registers every gauge in a fresh registry. Gauges sharing a name become one family.
pub fn registry(gauges: &[Gauge]) -> prometheus::Result<Registry> {
    let registry = Registry::new();
    let mut families: HashMap<&'static str, GaugeVec> = HashMap::new();
    for gauge in gauges {
        let family = match families.entry(gauge.name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let names: Vec<&str> = gauge.labels.iter().map(|(key, _)| *key).collect();
                let family = GaugeVec::new(gauge.opts(), names.as_slice())?;
                registry.register(Box::new(family.clone()))?;
                entry.insert(family)
            }
        };
        let values: Vec<&str> = gauge.labels.iter().map(|(_, value)| value.as_str()).collect();
        family
            .get_metric_with_label_values(values.as_slice())?
            .set(gauge.value);
    }
    Ok(registry)
}

/// Encodes gauges in the Prometheus text format, returning the body and its content type.
pub fn encode_text(gauges: &[Gauge]) -> prometheus::Result<(Vec<u8>, String)> {
    let registry = registry(gauges)?;
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

/// Everything known about a single backup once restic printed its summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawMetrics {
    pub backup_start_timestamp: f64,
    pub backup_end_timestamp: f64,
    pub errors: f64,
    pub new_files: f64,
    pub changed_files: f64,
    pub unmodified_files: f64,
    pub new_dirs: f64,
    pub changed_dirs: f64,
    pub unmodified_dirs: f64,
    pub data_transferred: f64,
    #[serde(rename = "mounted_PVCs")]
    pub mounted_pvcs: Vec<String>,
    pub id: String,

    #[serde(skip)]
    pub running_backup_duration: f64,
    #[serde(skip)]
    pub available_snapshots: f64,
    #[serde(skip)]
    pub folder: String,
    #[serde(skip)]
    pub hostname: String,
}

impl RawMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn from_summary(
        summary: &BackupSummary,
        errors: usize,
        folder: &str,
        hostname: &str,
        mounted_pvcs: Vec<String>,
        available_snapshots: usize,
        start: i64,
        end: i64,
    ) -> Self {
        Self {
            backup_start_timestamp: start as f64,
            backup_end_timestamp: end as f64,
            errors: errors as f64,
            new_files: summary.files_new as f64,
            changed_files: summary.files_changed as f64,
            unmodified_files: summary.files_unmodified as f64,
            new_dirs: summary.dirs_new as f64,
            changed_dirs: summary.dirs_changed as f64,
            unmodified_dirs: summary.dirs_unmodified as f64,
            data_transferred: summary.data_added as f64,
            mounted_pvcs,
            id: summary.snapshot_id.clone(),
            running_backup_duration: summary.total_duration,
            available_snapshots: available_snapshots as f64,
            folder: folder.to_string(),
            hostname: hostname.to_string(),
        }
    }

    fn gauges(&self) -> Vec<Gauge> {
        let labelled = |name, help, value| {
            Gauge::new(name, help, value)
                .label("pvc", self.folder.clone())
                .label("namespace", self.hostname.clone())
        };
        vec![
            labelled(
                "last_errors",
                "How many errors the backup or check had",
                self.errors,
            ),
            Gauge::new(
                "available_snapshots",
                "How many snapshots are available",
                self.available_snapshots,
            ),
            labelled(
                "new_files_during_backup",
                "How many new files were backed up during the last backup",
                self.new_files,
            ),
            labelled(
                "changed_files_during_backup",
                "How many changed files were backed up during the last backup",
                self.changed_files,
            ),
            labelled(
                "unmodified_files_during_backup",
                "How many files were skipped due to no modifications",
                self.unmodified_files,
            ),
            labelled(
                "new_directories_during_backup",
                "How many new directories were backed up during the last backup",
                self.new_dirs,
            ),
            labelled(
                "changed_directories_during_backup",
                "How many changed directories were backed up during the last backup",
                self.changed_dirs,
            ),
            labelled(
                "unmodified_directories_during_backup",
                "How many directories were skipped due to no modifications",
                self.unmodified_dirs,
            ),
            labelled(
                "data_transferred_during_backup",
                "Amount of data transferred during last backup",
                self.data_transferred,
            ),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupStats {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bucket_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_metrics: Option<RawMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Vec<Snapshot>>,
}

impl PrometheusProvider for BackupStats {
    fn to_prom(&self) -> Vec<Gauge> {
        self.backup_metrics
            .as_ref()
            .map(RawMetrics::gauges)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreStats {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub restore_location: String,
    #[serde(rename = "snapshot_ID", skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restored_files: Vec<String>,
}

/// Names of the directories directly below `backup_dir`, the volumes mounted for backup.
pub fn mounted_folders(backup_dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(dir = %backup_dir.display(), "stats mount dir doesn't exist, skipping stats");
            return Vec::new();
        }
        Err(e) => {
            tracing::error!(dir = %backup_dir.display(), "can't list mounted folders for stats: {e}");
            return Vec::new();
        }
    };
    let mut folders: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    folders.sort();
    folders
}

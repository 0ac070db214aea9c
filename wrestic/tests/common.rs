use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wrestic::ResticError;
use wrestic::args::Args;
use wrestic::config::Config;
use wrestic::restic::Restic;
use wrestic::s3::{ObjectInfo, ObjectReader, ObjectStore, UploadBody};
use wrestic::stats::{Gauge, PrometheusProvider, StatsHandler, WebhookProvider};

/// Writes an executable `/bin/sh` script standing in for restic or kubectl.
pub fn fake_engine(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Keeps every payload instead of sending it.
#[allow(dead_code)]
#[derive(Default)]
pub struct Recorder {
    pub webhooks: Mutex<Vec<serde_json::Value>>,
    pub gauges: Mutex<Vec<Gauge>>,
}

#[async_trait]
impl StatsHandler for Recorder {
    async fn send_prometheus(&self, stats: &dyn PrometheusProvider) -> wrestic::Result<()> {
        self.gauges.lock().unwrap().extend(stats.to_prom());
        Ok(())
    }

    async fn send_webhook(&self, stats: &dyn WebhookProvider) -> wrestic::Result<()> {
        let body = stats.to_json().unwrap();
        self.webhooks
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&body).unwrap());
        Ok(())
    }
}

/// A bucket kept in memory. A failing upload body leaves no object behind.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "restore"
    }

    async fn put(&self, key: &str, mut body: UploadBody) -> wrestic::Result<u64> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(|e| ResticError::stream("upload read", e))?;
        let size = data.len() as u64;
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(size)
    }

    async fn get(&self, key: &str) -> wrestic::Result<ObjectReader> {
        let data = self.objects.lock().unwrap().get(key).cloned();
        let data = data.ok_or_else(|| ResticError::ObjectStorage(format!("no object {key}")))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn list(&self) -> wrestic::Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                size: data.len() as i64,
            })
            .collect())
    }

    async fn delete_bucket(&self) -> wrestic::Result<()> {
        self.objects.lock().unwrap().clear();
        Ok(())
    }
}

#[allow(dead_code)]
pub fn restic(engine: &Path, backup_dir: &Path, stats: Arc<Recorder>) -> Restic {
    cancellable_restic(engine, backup_dir, stats, CancellationToken::new())
}

#[allow(dead_code)]
pub fn cancellable_restic(
    engine: &Path,
    backup_dir: &Path,
    stats: Arc<Recorder>,
    cancel: CancellationToken,
) -> Restic {
    let args = Args::try_parse_from([
        "wrestic",
        "--hostname",
        "ns",
        "--restic-bin",
        engine.to_str().unwrap(),
        "--restic-repository",
        "s3:http://minio:9000/backups",
        "--backup-dir",
        backup_dir.to_str().unwrap(),
    ])
    .unwrap();
    let config = Config::from_args(args).unwrap();
    Restic::new(&config, stats, cancel)
        .with_lock_retry(std::time::Duration::from_millis(10))
}

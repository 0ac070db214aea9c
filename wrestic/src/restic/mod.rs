//! Orchestration of restic invocations.

pub mod archive;
pub mod backup;
pub mod benign;
pub mod check;
pub mod command;
pub mod flags;
pub mod init;
pub mod locks;
pub mod output;
pub mod prune;
pub mod restore;
pub mod snapshots;

use crate::config::Config;
use crate::error::Result;
use crate::kubernetes::snapshots::{SnapshotStore, sync_snapshot_list};
use crate::stats::{BackupStats, RawMetrics, StatsHandler, mounted_folders};
use command::{Command, CommandOptions};
use common::Snapshot;
use flags::Flags;
use output::BackupSummary;
use rand::{Rng, distr::Alphanumeric};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// How long to wait before looking for locks again.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(35);

#[derive(Debug, Clone)]
struct ClientCert {
    cert: PathBuf,
    key: PathBuf,
    pem: PathBuf,
}

pub struct Restic {
    bin: PathBuf,
    hostname: String,
    repository: String,
    bucket: String,
    backup_dir: PathBuf,
    global_flags: Flags,
    client_cert: Option<ClientCert>,
    snapshots: Vec<Snapshot>,
    stats: Arc<dyn StatsHandler>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    cancel: CancellationToken,
    lock_retry: Duration,
}

impl Restic {
    pub fn new(config: &Config, stats: Arc<dyn StatsHandler>, cancel: CancellationToken) -> Self {
        let mut global_flags = Flags::new();
        if !config.restic_options.is_empty() {
            tracing::info!(options = ?config.restic_options, "using the following restic options");
            global_flags.add_flag("--option", config.restic_options.iter().cloned());
        }
        if let Some(ca) = &config.ca_cert {
            global_flags.add_flag("--cacert", [ca.display().to_string()]);
        }

        let client_cert = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                let suffix: String = rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(10)
                    .map(char::from)
                    .collect();
                let pem = config.var_dir.join(format!("restic.repo.{suffix}.pem"));
                global_flags.add_flag("--tls-client-cert", [pem.display().to_string()]);
                Some(ClientCert {
                    cert: cert.clone(),
                    key: key.clone(),
                    pem,
                })
            }
            _ => None,
        };

        Self {
            bin: config.restic_bin.clone(),
            hostname: config.hostname.clone(),
            repository: config.restic_repository.clone(),
            bucket: config.repository_name(),
            backup_dir: config.backup_dir.clone(),
            global_flags,
            client_cert,
            snapshots: Vec::new(),
            stats,
            snapshot_store: None,
            cancel,
            lock_retry: LOCK_RETRY_INTERVAL,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn with_lock_retry(mut self, interval: Duration) -> Self {
        self.lock_retry = interval;
        self
    }

    pub fn global_flags(&self) -> &Flags {
        &self.global_flags
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Writes the files referenced by the global flags. Must run before the first invocation.
    pub async fn prepare(&self) -> Result<()> {
        let Some(cc) = &self.client_cert else {
            return Ok(());
        };
        tracing::info!(pem = %cc.pem.display(), "generating client certificate bundle");
        let cert = tokio::fs::read(&cc.cert).await?;
        let key = tokio::fs::read(&cc.key).await?;
        let mut out = tokio::fs::File::create(&cc.pem).await?;
        out.write_all(&cert).await?;
        out.write_all(&key).await?;
        out.flush().await?;
        Ok(())
    }

    /// Options for `restic <command> <global flags> <local flags> <args>`.
    fn options(&self, name: &str, command: &str, local: Flags, args: Vec<String>) -> CommandOptions {
        let args = Flags::combine(&self.global_flags, &local).apply_to_command(command, args);
        CommandOptions::new(name, &self.bin, args)
    }

    fn command(&self, options: CommandOptions) -> Command {
        Command::new(options, self.cancel.clone())
    }

    /// Publishes the current snapshot list to the webhook and the cluster.
    pub async fn send_snapshot_list(&mut self) {
        if let Err(e) = self.list_snapshots(&[]).await {
            tracing::error!("cannot fetch current snapshot list for webhook: {e}");
        }
        let stats = BackupStats {
            name: self.hostname.clone(),
            bucket_name: self.bucket.clone(),
            backup_metrics: None,
            snapshots: Some(self.snapshots.clone()),
        };
        if let Err(e) = self.stats.send_webhook(&stats).await {
            tracing::error!("webhook send failed: {e}");
        }

        if let Some(store) = &self.snapshot_store {
            if let Err(e) = sync_snapshot_list(
                store.as_ref(),
                &self.snapshots,
                &self.hostname,
                &self.repository,
            )
            .await
            {
                tracing::error!("cannot sync snapshots to the cluster: {e}");
            }
        }
    }

    async fn send_backup_stats(
        &self,
        summary: &BackupSummary,
        errors: usize,
        folder: &str,
        start: i64,
        end: i64,
    ) {
        let metrics = RawMetrics::from_summary(
            summary,
            errors,
            folder,
            &self.hostname,
            mounted_folders(&self.backup_dir),
            self.snapshots.len(),
            start,
            end,
        );
        let stats = BackupStats {
            name: self.hostname.clone(),
            bucket_name: self.bucket.clone(),
            backup_metrics: Some(metrics),
            snapshots: None,
        };
        if let Err(e) = self.stats.send_webhook(&stats).await {
            tracing::error!("webhook send failed: {e}");
        }
        if let Err(e) = self.stats.send_prometheus(&stats).await {
            tracing::error!("prometheus send failed: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::args::Args;
    use crate::stats::Handler;
    use clap::Parser;

    pub fn config(extra: &[&str]) -> Config {
        let mut argv = vec!["wrestic", "--hostname", "ns"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap()
    }

    pub fn restic(extra: &[&str]) -> Restic {
        Restic::new(
            &config(extra),
            Arc::new(Handler::new("", "ns", "")),
            CancellationToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;

    #[test]
    fn test_global_flags() {
        let restic = restic(&[
            "--restic-options",
            "s3.connections=4,b2.connections=2",
            "--ca-cert",
            "/certs/ca.crt",
        ]);
        assert_eq!(
            restic.global_flags().apply_to_command("", Vec::<String>::new()),
            vec![
                "--option",
                "s3.connections=4",
                "--option",
                "b2.connections=2",
                "--cacert",
                "/certs/ca.crt"
            ]
        );
    }

    #[test]
    fn test_client_cert_pem_name() {
        let restic = restic(&[
            "--client-cert",
            "/certs/tls.crt",
            "--client-key",
            "/certs/tls.key",
            "--var-dir",
            "/tmp/k8up",
        ]);
        let args = restic.global_flags().apply_to_command("", Vec::<String>::new());
        assert_eq!(args[0], "--tls-client-cert");
        let name = args[1].strip_prefix("/tmp/k8up/restic.repo.").unwrap();
        let random = name.strip_suffix(".pem").unwrap();
        assert_eq!(random.len(), 10);
        assert!(random.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_cert_needs_key() {
        let restic = restic(&["--client-cert", "/certs/tls.crt"]);
        assert!(restic.global_flags().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_concatenates_pem() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        let key = dir.path().join("tls.key");
        std::fs::write(&cert, "CERT\n").unwrap();
        std::fs::write(&key, "KEY\n").unwrap();

        let restic = restic(&[
            "--client-cert",
            cert.to_str().unwrap(),
            "--client-key",
            key.to_str().unwrap(),
            "--var-dir",
            dir.path().to_str().unwrap(),
        ]);
        restic.prepare().await.unwrap();

        let args = restic.global_flags().apply_to_command("", Vec::<String>::new());
        assert_eq!(std::fs::read_to_string(&args[1]).unwrap(), "CERT\nKEY\n");
    }
}

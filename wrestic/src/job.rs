//! The job sequence of one worker run.

use crate::config::Config;
use crate::kubernetes::KubeClient;
use crate::kubernetes::pods::{BackupPod, PodLister};
use crate::restic::Restic;
use crate::restic::restore::RestoreOptions;
use crate::stats::Handler;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn pod_lister(config: &Config) -> PodLister {
    PodLister {
        backup_command_annotation: config.backup_command_annotation.clone(),
        backup_container_annotation: config.backup_container_annotation.clone(),
        file_extension_annotation: config.file_extension_annotation.clone(),
        namespace: config.hostname.clone(),
        target_pods: config.target_pods.iter().cloned().collect(),
        skip_pre_backup: config.skip_pre_backup,
    }
}

/// Runs the selected jobs, or a backup when none is selected. The first failing job ends the run.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<()> {
    let stats = Arc::new(Handler::new(
        &config.prom_url,
        &config.hostname,
        &config.webhook_url,
    ));
    let kube = match KubeClient::in_cluster() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!("kubernetes api unavailable, pod backups and snapshot sync are disabled: {e}");
            None
        }
    };

    let mut restic = Restic::new(config, stats, cancel);
    if let Some(kube) = &kube {
        restic = restic.with_snapshot_store(kube.clone());
    }

    restic
        .prepare()
        .await
        .context("failed to write the client certificate")?;
    restic
        .init()
        .await
        .context("failed to initialise the repository")?;
    restic
        .unlock(false)
        .await
        .context("failed to remove stale locks")?;
    // builds restic's cache
    restic
        .list_snapshots(&[])
        .await
        .context("failed to list snapshots")?;

    let tags = &config.tags;
    let mut selected = false;

    if config.do_check {
        selected = true;
        restic.wait_for_locks().await.context("check job failed")?;
        restic.check().await.context("check job failed")?;
    }

    if config.do_prune {
        selected = true;
        restic.wait_for_locks().await.context("prune job failed")?;
        restic
            .prune(&config.retention, tags)
            .await
            .context("prune job failed")?;
    }

    if config.do_restore {
        selected = true;
        restic
            .restore(
                config.restore_snap.as_deref(),
                &RestoreOptions::from_config(config),
                tags,
            )
            .await
            .context("restore job failed")?;
    }

    if config.do_archive {
        selected = true;
        restic
            .archive(&config.restore_s3, tags)
            .await
            .context("archive job failed")?;
    }

    if !selected {
        restic.wait_for_locks().await.context("backup job failed")?;
        let pods: Vec<BackupPod> = match &kube {
            Some(kube) => pod_lister(config)
                .list_pods(kube)
                .await
                .context("backup job failed")?,
            None => Vec::new(),
        };
        restic
            .backup(&config.backup_dir, &pods, &config.kubectl_bin, tags)
            .await
            .context("backup job failed")?;
    }

    Ok(())
}

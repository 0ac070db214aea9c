//! Backups of mounted volumes and of streams produced by backup commands in other pods.

use super::Restic;
use super::command::{CommandOptions, InputStream, Sink};
use super::flags::{Flags, tag_args};
use super::output::{OutputClassifier, StatusFormatter, ignore_status, print_status};
use crate::error::Result;
use crate::kubernetes::exec::ExecStream;
use crate::kubernetes::pods::BackupPod;
use crate::stats::Gauge;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

/// Directories directly below `dir`, sorted by name.
pub fn subdirectories(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            folders.push(entry.path());
        }
    }
    folders.sort();
    Ok(folders)
}

impl Restic {
    /// Backs up every exec source and every folder below `backup_dir`, one snapshot each,
    /// then publishes the snapshot list. The first failing source aborts the run.
    pub async fn backup(
        &mut self,
        backup_dir: &Path,
        pods: &[BackupPod],
        kubectl: &Path,
        tags: &[String],
    ) -> Result<()> {
        tracing::info!("starting backup");

        for pod in pods {
            self.exec_backup(pod, kubectl, tags).await?;
        }

        match subdirectories(backup_dir) {
            Ok(folders) => {
                for folder in folders {
                    self.folder_backup(&folder, tags).await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %backup_dir.display(), "backup dir does not exist, skipping");
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("backup finished, sending snapshot list");
        self.send_snapshot_list().await;
        Ok(())
    }

    async fn folder_backup(&self, folder: &Path, tags: &[String]) -> Result<()> {
        let source = folder.display().to_string();
        tracing::info!(folder = %source, "starting backup for folder");

        let local = Flags::new()
            .with("--host", self.hostname.as_str())
            .with_switch("--json");
        let mut args = vec![source.clone()];
        args.extend(tag_args(tags));
        let options = self.options("backup", "backup", local, args);

        self.run_backup(options, &source, print_status, None).await
    }

    async fn exec_backup(&self, pod: &BackupPod, kubectl: &Path, tags: &[String]) -> Result<()> {
        let filename = pod.virtual_filename();
        tracing::info!(
            pod = %pod.pod_name,
            filename = %filename,
            extension = %pod.file_extension,
            "starting stdin backup"
        );

        let mut exec = ExecStream::start(pod, kubectl, self.cancel.clone())?;
        let input = exec.take_reader()?;

        let local = Flags::new()
            .with("--host", self.hostname.as_str())
            .with_switch("--json")
            .with_switch("--stdin")
            .with("--stdin-filename", filename.as_str());
        let options = self.options("stdin backup", "backup", local, tag_args(tags));

        // progress percentages are meaningless for a stream of unknown size
        let backup = self
            .run_backup(options, &filename, ignore_status, Some(input))
            .await;
        let streamed = exec.finish().await;
        backup.and(streamed)
    }

    /// Runs one backup invocation and reports its summary.
    async fn run_backup(
        &self,
        options: CommandOptions,
        source: &str,
        status: StatusFormatter,
        input: Option<InputStream>,
    ) -> Result<()> {
        let start = Utc::now().timestamp();
        let (tx, mut rx) = oneshot::channel();
        let classifier = OutputClassifier::new(
            source,
            status,
            Box::new(move |summary, errors| {
                let _ = tx.send((summary, errors));
            }),
        );

        let mut options = options
            .stdout(Sink::lines(classifier.clone()))
            .stderr(Sink::lines(classifier.clone()));
        if let Some(input) = input {
            options = options.stdin(input);
        }

        let mut running = self.command(options).start()?;
        // all input has to reach restic before its exit is awaited
        let result = match running.input_done().await {
            Ok(()) => running.wait().await.map(|_| ()),
            Err(e) => Err(e),
        };

        classifier.finish();
        let summary = rx.try_recv().ok();
        match (summary, &result) {
            (Some((summary, errors)), Ok(())) => {
                let end = Utc::now().timestamp();
                self.send_backup_stats(&summary, errors, source, start, end)
                    .await;
            }
            _ => {
                // a summary from a failed run is not trusted, the failure counts as an error
                let errors = classifier.error_count() + usize::from(result.is_err());
                let gauges = vec![Gauge::last_errors(errors, source, &self.hostname)];
                if let Err(e) = self.stats.send_prometheus(&gauges).await {
                    tracing::error!("prometheus send failed: {e}");
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pvc-b")).unwrap();
        std::fs::create_dir(dir.path().join("pvc-a")).unwrap();
        std::fs::write(dir.path().join("lost+found.txt"), b"").unwrap();

        let folders = subdirectories(dir.path()).unwrap();
        assert_eq!(
            folders,
            vec![dir.path().join("pvc-a"), dir.path().join("pvc-b")]
        );
        assert_eq!(
            subdirectories(&dir.path().join("missing"))
                .unwrap_err()
                .kind(),
            std::io::ErrorKind::NotFound
        );
    }
}

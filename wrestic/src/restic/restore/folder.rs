use super::{RestoreOptions, single_file};
use crate::error::{ResticError, Result};
use crate::restic::Restic;
use crate::restic::benign::{Phase, Tally};
use crate::restic::command::Sink;
use crate::restic::flags::Flags;
use crate::stats::RestoreStats;
use common::Snapshot;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FOLDER_RESTORED_FILES: &str = "not supported for folder restores";

/// The part of a backed up path restic recreates below the restore target,
/// `/data/pvc/sub` becomes `data/pvc`.
pub fn skeleton_path(backup_path: &str) -> PathBuf {
    backup_path
        .split('/')
        .take(3)
        .filter(|s| !s.is_empty())
        .collect()
}

/// A temporary restore target whose leading directories point into the real restore dir.
/// Removed on drop, the restored data behind the link is kept.
#[derive(Debug)]
pub struct Skeleton {
    root: TempDir,
}

impl Skeleton {
    pub fn link(backup_path: &str, restore_dir: &Path) -> io::Result<Option<Self>> {
        let relative = skeleton_path(backup_path);
        if relative.as_os_str().is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(restore_dir)?;
        let root = tempfile::Builder::new().prefix("wrestic-restore-").tempdir()?;
        let link = root.path().join(relative);
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(restore_dir, &link)?;
        tracing::debug!(link = %link.display(), target = %restore_dir.display(), "linked restore path");
        Ok(Some(Self { root }))
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn remove(self) {
        let root = self.root.path().to_path_buf();
        if let Err(e) = self.root.close() {
            tracing::warn!(path = %root.display(), "cannot remove restore skeleton: {e}");
        }
    }
}

impl Restic {
    pub(crate) async fn folder_restore(
        &self,
        snapshot: &Snapshot,
        options: &RestoreOptions,
    ) -> Result<RestoreStats> {
        tracing::info!(dir = %options.restore_dir.display(), "restoring to folder");

        let skeleton = match snapshot.paths.first() {
            Some(path) if options.trim_path => {
                // a stdin backup is a single file at the root, nothing to trim
                let nodes = self.list_nodes(&snapshot.id).await?;
                if single_file(&nodes).is_some() {
                    None
                } else {
                    Skeleton::link(path, &options.restore_dir)?
                }
            }
            _ => None,
        };
        let target = skeleton
            .as_ref()
            .map(|s| s.root().to_path_buf())
            .unwrap_or_else(|| options.restore_dir.clone());

        let mut local = Flags::new().with("--target", target.display().to_string());
        if let Some(filter) = &options.filter {
            local.add_flag("--include", [filter.clone()]);
        }
        if options.verify {
            local.add_switch("--verify");
        }
        let tally = Tally::new();
        let command = self
            .options("restore", "restore", local, vec![snapshot.id.clone()])
            .stdout(Sink::Log)
            .stderr(tally.sink(Phase::Restore, "restore"));

        let result = self.command(command).run().await;
        if let Some(skeleton) = skeleton {
            skeleton.remove();
        }

        match result {
            Ok(_) => {}
            Err(ResticError::Execution { .. }) if tally.only_benign() => {
                tracing::info!("restore only reported ignorable errors");
            }
            Err(e) => return Err(e),
        }
        if tally.unignored() > 0 {
            return Err(ResticError::RestoreFailures(tally.unignored()));
        }

        Ok(RestoreStats {
            restore_location: options.restore_dir.display().to_string(),
            snapshot_id: snapshot.id.clone(),
            restored_files: vec![FOLDER_RESTORED_FILES.to_string()],
        })
    }
}

//! Restores of a snapshot into a directory or as a compressed archive into object storage.

pub mod compress;
pub mod folder;
pub mod s3;

use super::Restic;
use super::command::Sink;
use super::flags::Flags;
use super::snapshots::select_snapshot;
use crate::config::{Config, RestoreType, S3Destination};
use crate::error::{ResticError, Result};
use crate::stats::RestoreStats;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub restore_type: RestoreType,
    pub restore_dir: PathBuf,
    pub filter: Option<String>,
    pub verify: bool,
    /// Strip the leading path segments of the backup so the data lands at the root of `restore_dir`.
    pub trim_path: bool,
    pub s3: S3Destination,
}

impl RestoreOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restore_type: config.restore_type.unwrap_or(RestoreType::Folder),
            restore_dir: config.restore_dir.clone(),
            filter: config.restore_filter.clone(),
            verify: config.verify_restore,
            trim_path: config.restore_trim_path,
            s3: config.restore_s3.clone(),
        }
    }
}

/// One entry of `restic ls --json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub atime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ctime: Option<DateTime<Utc>>,
}

impl FileNode {
    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }

    pub fn is_dir(&self) -> bool {
        self.kind == "dir"
    }
}

/// Parses `restic ls --json`: the snapshot on the first line, one node per following line.
pub fn parse_nodes(raw: &[u8]) -> Result<Vec<FileNode>> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip(1)
        .map(|l| serde_json::from_str(l).map_err(|e| ResticError::decode("snapshot file list", e)))
        .collect()
}

/// The only node of a snapshot made by a stdin backup.
pub fn single_file(nodes: &[FileNode]) -> Option<&FileNode> {
    let mut files = nodes.iter().filter(|n| n.is_file());
    match (files.next(), files.next()) {
        (Some(file), None) if !nodes.iter().any(FileNode::is_dir) => Some(file),
        _ => None,
    }
}

impl Restic {
    /// Restores the snapshot `snapshot_id` (or the latest one) and reports where it went.
    pub async fn restore(
        &mut self,
        snapshot_id: Option<&str>,
        options: &RestoreOptions,
        tags: &[String],
    ) -> Result<()> {
        tracing::info!(restore_type = %options.restore_type, "restore initialised");
        self.list_snapshots(tags).await?;
        let snapshot = select_snapshot(&self.snapshots, snapshot_id)?.clone();
        tracing::info!(id = %snapshot.id, date = %snapshot.time, paths = ?snapshot.paths, "found snapshot");

        let stats = match options.restore_type {
            RestoreType::Folder => self.folder_restore(&snapshot, options).await?,
            RestoreType::S3 => self.s3_restore(&snapshot, &options.s3).await?,
        };
        self.send_restore_stats(&stats).await
    }

    pub(crate) async fn send_restore_stats(&self, stats: &RestoreStats) -> Result<()> {
        self.stats.send_webhook(stats).await
    }

    /// Lists every node of a snapshot.
    pub async fn list_nodes(&self, snapshot_id: &str) -> Result<Vec<FileNode>> {
        let local = Flags::new().with_switch("--json");
        let options = self
            .options("ls", "ls", local, vec![snapshot_id.to_string()])
            .stdout(Sink::Capture)
            .stderr(Sink::Log);
        let output = self.command(options).run().await?;
        parse_nodes(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{"time":"2024-05-01T10:00:00Z","tree":"t","paths":["/ns-postgres.sql"],"hostname":"ns","id":"aaa","struct_type":"snapshot"}
{"name":"ns-postgres.sql","type":"file","path":"/ns-postgres.sql","uid":999,"gid":999,"size":12,"mode":416,"mtime":"2024-05-01T09:59:00Z","atime":"2024-05-01T09:59:00Z","ctime":"2024-05-01T09:59:00Z","struct_type":"node"}
"#;

    const FOLDER: &str = r#"{"time":"2024-05-01T10:00:00Z","tree":"t","paths":["/data/pvc"],"hostname":"ns","id":"bbb","struct_type":"snapshot"}
{"name":"data","type":"dir","path":"/data","uid":0,"gid":0,"mode":2147484141,"struct_type":"node"}
{"name":"pvc","type":"dir","path":"/data/pvc","uid":0,"gid":0,"mode":2147484141,"struct_type":"node"}
{"name":"a.txt","type":"file","path":"/data/pvc/a.txt","uid":0,"gid":0,"size":3,"mode":420,"struct_type":"node"}
"#;

    #[test]
    fn test_single_file_snapshot() {
        let nodes = parse_nodes(SINGLE.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 1);
        let file = single_file(&nodes).unwrap();
        assert_eq!(file.path, "/ns-postgres.sql");
        assert_eq!(file.size, 12);
        assert_eq!(file.mode, 0o640);
        assert_eq!(file.uid, 999);
        assert!(file.mtime.is_some());
    }

    #[test]
    fn test_folder_snapshot() {
        let nodes = parse_nodes(FOLDER.as_bytes()).unwrap();
        assert_eq!(nodes.len(), 3);
        // one file, but inside directories
        assert!(single_file(&nodes).is_none());
    }

    #[test]
    fn test_malformed_node() {
        let raw = "{\"id\":\"x\"}\nnot json\n";
        assert!(matches!(
            parse_nodes(raw.as_bytes()),
            Err(ResticError::Decode { .. })
        ));
    }
}

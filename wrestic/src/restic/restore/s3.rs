//! Streaming restore into object storage: `restic dump | gzip [| tar] | upload`.

use super::{compress, single_file};
use crate::config::S3Destination;
use crate::error::{ResticError, Result};
use crate::restic::Restic;
use crate::restic::command::Sink;
use crate::restic::flags::Flags;
use crate::s3::{ObjectStore, S3Client, UploadBody, upload_pipe};
use crate::stats::RestoreStats;
use chrono::SecondsFormat;
use common::Snapshot;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Object key of the archive of one snapshot, stamped with the snapshot's time.
pub fn archive_name(snapshot: &Snapshot) -> String {
    format!(
        "backup-{}-{}-{}.tar.gz",
        snapshot.hostname,
        snapshot.source_name(),
        snapshot.time.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Waits for an upload whose pipe was abandoned and picks the error to report.
/// An upload that already gave up on its own caused the failure.
async fn abandoned(
    upload: JoinHandle<Result<u64>>,
    finished_first: bool,
    cause: ResticError,
) -> ResticError {
    match upload.await {
        Ok(Err(e)) if finished_first => e,
        Ok(Err(e)) => {
            tracing::debug!("upload stopped: {e}");
            cause
        }
        Ok(Ok(size)) => {
            tracing::warn!(size, "upload completed although the archive failed");
            cause
        }
        Err(e) => {
            tracing::error!("upload task failed: {e}");
            cause
        }
    }
}

impl Restic {
    pub(crate) async fn s3_restore(
        &self,
        snapshot: &Snapshot,
        dest: &S3Destination,
    ) -> Result<RestoreStats> {
        let store = Arc::new(S3Client::connect(dest).await?);
        self.archive_snapshot(snapshot, store, &dest.endpoint).await
    }

    /// Streams one snapshot as a gzipped archive into `store`.
    ///
    /// A snapshot holding exactly one file (a stdin backup) is wrapped into a tar entry carrying
    /// that file's metadata, anything else is dumped as restic's own tar stream.
    pub async fn archive_snapshot(
        &self,
        snapshot: &Snapshot,
        store: Arc<dyn ObjectStore>,
        endpoint: &str,
    ) -> Result<RestoreStats> {
        let nodes = self.list_nodes(&snapshot.id).await?;
        let entry = single_file(&nodes).cloned();
        let dump_path = match (&entry, snapshot.paths.first()) {
            (Some(file), _) => file.path.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => "/".to_string(),
        };

        let key = archive_name(snapshot);
        tracing::info!(
            bucket = %store.bucket(),
            key = %key,
            single_file = entry.is_some(),
            "restoring snapshot to object storage"
        );

        let (writer, reader) = upload_pipe(PIPE_CAPACITY);
        let abort = writer.abort_token();
        let upload = {
            let key = key.clone();
            let store = store.clone();
            let body: UploadBody = Box::new(reader);
            tokio::spawn(async move { store.put(&key, body).await })
        };

        let options = self
            .options("dump", "dump", Flags::new(), vec![snapshot.id.clone(), dump_path])
            .stdout(Sink::Piped)
            .stderr(Sink::Log);
        let mut dump = match self.command(options).start() {
            Ok(dump) => dump,
            Err(e) => {
                drop(writer);
                return Err(abandoned(upload, false, e).await);
            }
        };
        let Some(stdout) = dump.take_stdout() else {
            drop(writer);
            let e = ResticError::stream("dump", io::Error::other("dump output is not piped"));
            return Err(abandoned(upload, false, e).await);
        };

        let source = SyncIoBridge::new(stdout);
        let sink = SyncIoBridge::new(writer);
        let mut compressor = tokio::task::spawn_blocking(move || {
            let mut sink = sink;
            let written =
                compress::compress(source, &mut sink, entry.as_ref()).and_then(|s| s.flush());
            (written, sink)
        });

        let compressed = tokio::select! {
            joined = &mut compressor => joined,
            _ = self.cancel.cancelled() => {
                tracing::warn!(key = %key, "archive cancelled, stopping dump and upload");
                abort.cancel();
                // killing dump ends the compressor's input
                drop(dump);
                let _ = compressor.await;
                let e = ResticError::Cancelled { command: "dump".to_string() };
                return Err(abandoned(upload, false, e).await);
            }
        };
        let dumped = dump.wait().await;

        let (written, sink) = match compressed {
            Ok(done) => done,
            Err(e) => {
                let e = ResticError::stream("archive writer", io::Error::other(e));
                return Err(abandoned(upload, false, e).await);
            }
        };
        let outcome = written
            .map_err(|e| ResticError::stream("archive writer", e))
            .and(dumped.map(|_| ()));
        if let Err(e) = outcome {
            // a failed upload closes the pipe, which is what the writer saw
            let finished_first = upload.is_finished();
            drop(sink);
            return Err(abandoned(upload, finished_first, e).await);
        }

        // the pipe is closed only after the compressor wrote its trailer
        sink.into_inner()
            .close()
            .await
            .map_err(|e| ResticError::stream("upload pipe", e))?;

        let size = upload
            .await
            .map_err(|e| ResticError::stream("upload", io::Error::other(e)))??;
        tracing::info!(key = %key, size, "snapshot archived");

        Ok(RestoreStats {
            restore_location: format!("{}/{}", endpoint.trim_end_matches('/'), key),
            snapshot_id: snapshot.id.clone(),
            restored_files: nodes
                .iter()
                .filter(|n| n.is_file())
                .map(|n| n.path.clone())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_archive_name() {
        let snapshot = Snapshot {
            id: "aaa".to_string(),
            time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            tree: String::new(),
            paths: vec!["/data/pvc-web".to_string()],
            hostname: "ns".to_string(),
            username: String::new(),
            uid: 0,
            gid: 0,
            tags: Vec::new(),
        };
        assert_eq!(
            archive_name(&snapshot),
            "backup-ns-pvc-web-2024-05-01T10:00:00Z.tar.gz"
        );
    }
}

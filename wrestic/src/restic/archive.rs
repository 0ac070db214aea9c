use super::Restic;
use crate::config::S3Destination;
use crate::error::Result;
use crate::s3::{ObjectStore, S3Client};
use std::sync::Arc;

impl Restic {
    /// Copies the latest snapshot of every host and path into object storage, one at a time.
    pub async fn archive(&mut self, dest: &S3Destination, tags: &[String]) -> Result<()> {
        let store = Arc::new(S3Client::connect(dest).await?);
        self.archive_to(store, &dest.endpoint, tags).await
    }

    /// Like [`Restic::archive`], writing into an already connected store.
    pub async fn archive_to(
        &mut self,
        store: Arc<dyn ObjectStore>,
        endpoint: &str,
        tags: &[String],
    ) -> Result<()> {
        tracing::info!(bucket = %store.bucket(), "archiving latest snapshots");
        let snapshots = self.last_snapshots(tags).await?.to_vec();
        if snapshots.is_empty() {
            tracing::info!("no snapshots to archive");
            return Ok(());
        }

        for snapshot in &snapshots {
            tracing::info!(
                id = %snapshot.short_id(),
                host = %snapshot.hostname,
                paths = ?snapshot.paths,
                "archiving snapshot"
            );
            let stats = self
                .archive_snapshot(snapshot, store.clone(), endpoint)
                .await?;
            self.send_restore_stats(&stats).await?;
        }
        tracing::info!(count = snapshots.len(), "archive finished");
        Ok(())
    }
}

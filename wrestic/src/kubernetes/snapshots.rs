//! Mirrors restic snapshots into `snapshots.k8up.io` resources.

use super::KubeClient;
use crate::error::Result;
use async_trait::async_trait;
use common::{Snapshot, SnapshotResource, SnapshotResourceList};
use std::collections::HashSet;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Vec<SnapshotResource>>;
    async fn create(&self, resource: &SnapshotResource) -> Result<()>;
    async fn delete(&self, resource: &SnapshotResource) -> Result<()>;
}

fn collection_path(namespace: &str) -> String {
    format!("/apis/k8up.io/v1/namespaces/{namespace}/snapshots")
}

#[async_trait]
impl SnapshotStore for KubeClient {
    async fn list(&self, namespace: &str) -> Result<Vec<SnapshotResource>> {
        let list: SnapshotResourceList = self.get(&collection_path(namespace)).await?;
        Ok(list.items)
    }

    async fn create(&self, resource: &SnapshotResource) -> Result<()> {
        KubeClient::create(self, &collection_path(&resource.metadata.namespace), resource).await
    }

    async fn delete(&self, resource: &SnapshotResource) -> Result<()> {
        let path = format!(
            "{}/{}",
            collection_path(&resource.metadata.namespace),
            resource.metadata.name
        );
        KubeClient::delete(self, &path).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub deleted: usize,
}

/// Converts the snapshots of `namespace` into resources. Repositories can be shared between
/// namespaces, so snapshots of other hosts are dropped.
pub fn desired_resources(
    snapshots: &[Snapshot],
    namespace: &str,
    repository: &str,
) -> Vec<SnapshotResource> {
    snapshots
        .iter()
        .filter(|s| s.hostname == namespace)
        .map(|s| SnapshotResource::from_snapshot(s, namespace, repository))
        .collect()
}

/// Resources of `a` whose snapshot id is not in `b`.
fn difference<'a>(a: &'a [SnapshotResource], b: &[SnapshotResource]) -> Vec<&'a SnapshotResource> {
    let known: HashSet<&str> = b.iter().filter_map(SnapshotResource::id).collect();
    a.iter()
        .filter(|r| r.id().is_some_and(|id| !known.contains(id)))
        .collect()
}

/// Creates a resource for every snapshot that has none and deletes resources whose snapshot
/// is gone. Existing resources are never modified.
pub async fn sync_snapshot_list(
    store: &dyn SnapshotStore,
    snapshots: &[Snapshot],
    namespace: &str,
    repository: &str,
) -> Result<ReconcileReport> {
    let desired = desired_resources(snapshots, namespace, repository);
    let existing: Vec<SnapshotResource> = store
        .list(namespace)
        .await?
        .into_iter()
        .filter(|r| r.repository() == Some(repository))
        .collect();

    let mut report = ReconcileReport::default();
    for resource in difference(&desired, &existing) {
        store.create(resource).await?;
        report.created += 1;
    }
    for resource in difference(&existing, &desired) {
        store.delete(resource).await?;
        report.deleted += 1;
    }

    tracing::info!(
        namespace,
        repository,
        created = report.created,
        deleted = report.deleted,
        "synced snapshot resources"
    );
    Ok(report)
}

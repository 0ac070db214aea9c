use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SNAPSHOT_API_VERSION: &str = "k8up.io/v1";
pub const SNAPSHOT_KIND: &str = "Snapshot";

/// A snapshot as reported by `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    /// Ids are hex strings, the first eight characters are what restic prints as the short id.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(self.id.as_str())
    }

    /// Base name of the last backed up path, which is the PVC or virtual file name.
    pub fn source_name(&self) -> &str {
        self.paths
            .last()
            .map(|p| p.trim_end_matches('/'))
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// The `snapshots.k8up.io` custom resource mirroring one restic snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SnapshotSpec,
}

impl SnapshotResource {
    pub fn from_snapshot(snapshot: &Snapshot, namespace: &str, repository: &str) -> Self {
        Self {
            api_version: SNAPSHOT_API_VERSION.to_string(),
            kind: SNAPSHOT_KIND.to_string(),
            metadata: ObjectMeta {
                name: snapshot.short_id().to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            spec: SnapshotSpec {
                id: Some(snapshot.id.clone()),
                date: Some(snapshot.time),
                paths: Some(snapshot.paths.clone()),
                repository: Some(repository.to_string()),
            },
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.spec.id.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.spec.repository.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotResourceList {
    #[serde(default)]
    pub items: Vec<SnapshotResource>,
}

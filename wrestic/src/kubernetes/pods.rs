use super::KubeClient;
use crate::error::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    pub uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodMeta {
    pub name: String,
    pub uid: String,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Container {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodStatus {
    pub phase: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: PodMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Pod>,
}

/// A pod whose annotated command produces a backup stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPod {
    pub command: String,
    pub pod_name: String,
    pub container_name: String,
    pub namespace: String,
    pub file_extension: String,
}

impl BackupPod {
    /// The file name the stream is stored under in the snapshot.
    pub fn virtual_filename(&self) -> String {
        format!(
            "{}-{}{}",
            self.namespace, self.container_name, self.file_extension
        )
    }
}

#[derive(Debug, Clone)]
pub struct PodLister {
    pub backup_command_annotation: String,
    pub backup_container_annotation: String,
    pub file_extension_annotation: String,
    pub namespace: String,
    pub target_pods: HashSet<String>,
    pub skip_pre_backup: bool,
}

impl PodLister {
    pub async fn list_pods(&self, client: &KubeClient) -> Result<Vec<BackupPod>> {
        if self.skip_pre_backup {
            tracing::info!("pre-backup commands are disabled");
            return Ok(Vec::new());
        }
        tracing::info!(
            annotation = %self.backup_command_annotation,
            namespace = %self.namespace,
            "listing all pods"
        );
        let pods: PodList = client
            .get(&format!("/api/v1/namespaces/{}/pods", self.namespace))
            .await?;
        Ok(self.select(pods.items))
    }

    /// Running pods carrying a backup command, one per owner so replicas aren't backed up twice.
    pub fn select(&self, pods: Vec<Pod>) -> Vec<BackupPod> {
        let mut seen_owners = HashSet::new();
        let mut found = Vec::new();

        for pod in pods {
            if pod.status.phase != "Running" {
                continue;
            }
            if !self.target_pods.is_empty() && !self.target_pods.contains(&pod.metadata.name) {
                tracing::debug!(pod = %pod.metadata.name, "pod not in target pod list, skipping");
                continue;
            }
            let annotations = &pod.metadata.annotations;
            let Some(command) = annotations.get(&self.backup_command_annotation) else {
                continue;
            };
            let container = match annotations.get(&self.backup_container_annotation) {
                Some(name) => name.clone(),
                None => match pod.spec.containers.first() {
                    Some(c) => c.name.clone(),
                    None => continue,
                },
            };

            let owner = pod
                .metadata
                .owner_references
                .first()
                .map(|o| o.uid.clone())
                .unwrap_or_else(|| pod.metadata.uid.clone());
            if !seen_owners.insert(owner) {
                continue;
            }

            tracing::info!(namespace = %self.namespace, pod = %pod.metadata.name, "adding to backup list");
            found.push(BackupPod {
                command: command.clone(),
                pod_name: pod.metadata.name.clone(),
                container_name: container,
                namespace: self.namespace.clone(),
                file_extension: annotations
                    .get(&self.file_extension_annotation)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        found
    }
}

//! Local snapshots of the secrets and config maps a checkpointed pod mounts.
//!
//! A checkpoint has to start without any API access, so everything a parent pod pulls from the
//! API through its volumes is copied to disk ahead of time. Each resource lands in its own
//! directory, `<base>/<namespace>/<pod>/<resource>/`, with one file per data key. The
//! [`crate::sanitize`] module points the checkpoint's volumes at these directories.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use crate::pod::{CheckpointId, Pod};
use crate::store::{remove, remove_dir, write_if_different};

/// Fetches the API objects that pods reference through their volumes
#[async_trait::async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Get a secret by namespace and name
    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret>;

    /// Get a config map by namespace and name
    async fn config_map(&self, namespace: &str, name: &str) -> anyhow::Result<ConfigMap>;
}

/// The base directories snapshots are written under
#[derive(Clone, Debug)]
pub struct SnapshotPaths {
    secret_dir: PathBuf,
    configmap_dir: PathBuf,
}

impl SnapshotPaths {
    /// Returns snapshot paths rooted at the given secret and config map directories
    pub fn new(secret_dir: impl Into<PathBuf>, configmap_dir: impl Into<PathBuf>) -> Self {
        SnapshotPaths {
            secret_dir: secret_dir.into(),
            configmap_dir: configmap_dir.into(),
        }
    }

    /// The directory holding the keys of a secret mounted by the given pod
    pub fn secret(&self, namespace: &str, pod: &str, name: &str) -> PathBuf {
        self.secret_dir.join(namespace).join(pod).join(name)
    }

    /// The directory holding the keys of a config map mounted by the given pod
    pub fn config_map(&self, namespace: &str, pod: &str, name: &str) -> PathBuf {
        self.configmap_dir.join(namespace).join(pod).join(name)
    }

    fn pod_dirs(&self, id: &CheckpointId) -> [PathBuf; 2] {
        [
            self.secret_dir.join(id.namespace()).join(id.name()),
            self.configmap_dir.join(id.namespace()).join(id.name()),
        ]
    }
}

/// Persists the secret and config map data referenced by parent pods
pub struct ResourceSnapshotter {
    fetcher: Arc<dyn ObjectFetcher>,
    paths: SnapshotPaths,
}

impl ResourceSnapshotter {
    /// Returns a snapshotter fetching objects with the given fetcher
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, paths: SnapshotPaths) -> Self {
        ResourceSnapshotter { fetcher, paths }
    }

    /// The paths this snapshotter writes to
    pub fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    /// Snapshots every secret and config map volume of the pod. The first failure aborts the
    /// snapshot so the caller can skip writing a checkpoint that would be missing data.
    /// Volumes marked optional are skipped when they can't be fetched
    pub async fn snapshot_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let namespace = pod.namespace();
        let pod_name = pod.name();
        for vol in pod.volumes() {
            let (result, optional) = match (&vol.secret, &vol.config_map) {
                (Some(source), _) => match source.secret_name.as_deref() {
                    Some(name) => (
                        self.snapshot_secret(namespace, pod_name, name).await,
                        source.optional.unwrap_or(false),
                    ),
                    None => {
                        warn!(volume = %vol.name, pod = %pod.id(), "Secret volume has no name");
                        continue;
                    }
                },
                (None, Some(source)) => match source.name.as_deref() {
                    Some(name) => (
                        self.snapshot_config_map(namespace, pod_name, name).await,
                        source.optional.unwrap_or(false),
                    ),
                    None => {
                        warn!(volume = %vol.name, pod = %pod.id(), "ConfigMap volume has no name");
                        continue;
                    }
                },
                (None, None) => continue,
            };

            match result {
                Ok(_) => (),
                Err(e) if optional => {
                    debug!(error = %e, volume = %vol.name, pod = %pod.id(), "Skipping optional volume");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("unable to snapshot volume {} of pod {}", vol.name, pod.id())
                    })
                }
            }
        }
        Ok(())
    }

    /// Fetches a secret and writes each of its keys under the pod's secret directory. Returns
    /// the directory. When the secret can't be fetched nothing on disk is touched, so a
    /// previous snapshot keeps serving the checkpoint
    pub async fn snapshot_secret(
        &self,
        namespace: &str,
        pod: &str,
        name: &str,
    ) -> anyhow::Result<PathBuf> {
        let secret = self
            .fetcher
            .secret(namespace, name)
            .await
            .with_context(|| format!("unable to fetch secret {}/{}", namespace, name))?;
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, ByteString(value))| (key, value))
            .collect();

        let dir = self.paths.secret(namespace, pod, name);
        write_keys(&dir, data).await?;
        Ok(dir)
    }

    /// Fetches a config map and writes each of its keys (both `data` and `binaryData`) under the
    /// pod's config map directory. Returns the directory. When the config map can't be fetched
    /// nothing on disk is touched
    pub async fn snapshot_config_map(
        &self,
        namespace: &str,
        pod: &str,
        name: &str,
    ) -> anyhow::Result<PathBuf> {
        let config_map = self
            .fetcher
            .config_map(namespace, name)
            .await
            .with_context(|| format!("unable to fetch config map {}/{}", namespace, name))?;
        let binary_data = config_map
            .binary_data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, ByteString(value))| (key, value));
        let data = config_map
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.into_bytes()));

        let dir = self.paths.config_map(namespace, pod, name);
        write_keys(&dir, binary_data.chain(data).collect()).await?;
        Ok(dir)
    }

    /// Deletes every snapshot taken for the checkpoint
    pub async fn purge(&self, id: &CheckpointId) -> anyhow::Result<()> {
        for dir in self.paths.pod_dirs(id).iter() {
            if remove_dir(dir).await? {
                info!(checkpoint = %id, path = %dir.display(), "Removed checkpoint snapshots");
            }
        }
        Ok(())
    }
}

/// Writes one file per key into the directory and deletes files for keys that are gone
async fn write_keys(dir: &Path, data: BTreeMap<String, Vec<u8>>) -> anyhow::Result<()> {
    if let Some(bad) = data.keys().find(|k| !is_valid_key(k)) {
        return Err(anyhow::anyhow!(
            "refusing to write key {:?} into {}",
            bad,
            dir.display()
        ));
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("unable to create directory {}", dir.display()))?;

    let writes = data.iter().map(|(key, value)| {
        let file_path = dir.join(key);
        async move { write_if_different(&file_path, value).await }
    });
    futures::future::try_join_all(writes).await?;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let stale = entry
            .file_name()
            .to_str()
            .map(|name| !data.contains_key(name))
            .unwrap_or(true);
        if stale && entry.file_type().await?.is_file() {
            debug!(path = %entry.path().display(), "Removing stale snapshot key");
            remove(&entry.path()).await?;
        }
    }
    Ok(())
}

// Keys become file names, so anything that could escape the directory is rejected
fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key != "." && key != ".." && !key.contains('/') && !key.contains('\\')
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory stand-in for the API server
    #[derive(Default)]
    pub struct FakeFetcher {
        pub secrets: Mutex<BTreeMap<(String, String), Secret>>,
        pub config_maps: Mutex<BTreeMap<(String, String), ConfigMap>>,
    }

    impl FakeFetcher {
        pub fn with_secret(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
            let secret = Secret {
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                        .collect(),
                ),
                ..Default::default()
            };
            self.secrets
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), secret);
            self
        }

        pub fn with_config_map(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
            let config_map = ConfigMap {
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            };
            self.config_maps
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), config_map);
            self
        }
    }

    #[async_trait::async_trait]
    impl ObjectFetcher for FakeFetcher {
        async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("secrets \"{}\" not found", name))
        }

        async fn config_map(&self, namespace: &str, name: &str) -> anyhow::Result<ConfigMap> {
            self.config_maps
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("configmaps \"{}\" not found", name))
        }
    }
}

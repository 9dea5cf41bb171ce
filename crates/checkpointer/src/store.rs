//! On-disk storage for checkpoint manifests.
//!
//! Checkpoints live in two directories. The inactive directory is a staging area nobody else
//! reads. The active directory is the kubelet's static pod manifest directory, so anything
//! written there starts running. Because the kubelet reads that directory concurrently, every
//! write goes to a hidden temporary file first and is renamed over the target.
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod as KubePod;
use tracing::{debug, warn};

use crate::pod::{CheckpointId, Pod, PodKind, PodMap};

const MANIFEST_EXTENSION: &str = "json";
// Kubelet ignores hidden files in the manifest directory, so in-flight writes are never picked up
const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".tmp";

/// Errors that make the store unusable
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A directory the store depends on could not be created
    #[error("unable to create checkpoint directory {}: {source}", .path.display())]
    CreateDir {
        /// The directory that could not be created
        path: PathBuf,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// The active and inactive checkpoint manifest directories.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    active_dir: PathBuf,
    inactive_dir: PathBuf,
}

impl CheckpointStore {
    /// Returns a store using the given active (kubelet manifest) and inactive directories
    pub fn new(active_dir: impl Into<PathBuf>, inactive_dir: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            active_dir: active_dir.into(),
            inactive_dir: inactive_dir.into(),
        }
    }

    /// Creates both manifest directories if they don't exist. The checkpointer cannot do
    /// anything useful without them, so callers should treat an error here as fatal
    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [&self.active_dir, &self.inactive_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: dir.to_owned(),
                    source,
                })?;
        }
        Ok(())
    }

    /// The path of the active manifest for the given checkpoint
    pub fn active_path(&self, id: &CheckpointId) -> PathBuf {
        self.active_dir.join(id.manifest_file_name())
    }

    /// The path of the inactive manifest for the given checkpoint
    pub fn inactive_path(&self, id: &CheckpointId) -> PathBuf {
        self.inactive_dir.join(id.manifest_file_name())
    }

    /// All checkpoints currently in the active directory
    pub async fn list_active(&self) -> anyhow::Result<PodMap> {
        list_checkpoints(&self.active_dir).await
    }

    /// All checkpoints currently in the inactive directory
    pub async fn list_inactive(&self) -> anyhow::Result<PodMap> {
        list_checkpoints(&self.inactive_dir).await
    }

    /// Returns true if the staged manifest for the checkpoint is missing or differs from the
    /// given content
    pub async fn inactive_differs(&self, id: &CheckpointId, manifest: &[u8]) -> anyhow::Result<bool> {
        differs(&self.inactive_path(id), manifest).await
    }

    /// Writes the staged manifest for a checkpoint. Returns whether anything changed on disk
    pub async fn stage(&self, id: &CheckpointId, manifest: &[u8]) -> anyhow::Result<bool> {
        write_if_different(&self.inactive_path(id), manifest).await
    }

    /// Copies the staged manifest into the active directory. Returns whether anything changed on
    /// disk
    pub async fn activate(&self, id: &CheckpointId) -> anyhow::Result<bool> {
        let source = self.inactive_path(id);
        let manifest = tokio::fs::read(&source)
            .await
            .with_context(|| format!("unable to read staged checkpoint {}", source.display()))?;
        write_if_different(&self.active_path(id), &manifest).await
    }

    /// Removes the checkpoint from the active directory. Returns whether a manifest was removed
    pub async fn deactivate(&self, id: &CheckpointId) -> anyhow::Result<bool> {
        remove(&self.active_path(id)).await
    }

    /// Removes the staged manifest. Returns whether a manifest was removed
    pub async fn remove_inactive(&self, id: &CheckpointId) -> anyhow::Result<bool> {
        remove(&self.inactive_path(id)).await
    }
}

/// Serializes a checkpoint into its manifest representation
pub fn encode(pod: &Pod) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(pod.as_kube_pod())?)
}

/// Decodes every checkpoint manifest in the directory, keyed by checkpoint id. Files that fail
/// to decode are logged and skipped, as are manifests that aren't checkpoints (the active
/// directory is shared with other static pods). A missing directory has no checkpoints
pub async fn list_checkpoints(dir: &Path) -> anyhow::Result<PodMap> {
    let mut checkpoints = PodMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => return Ok(checkpoints),
        Err(e) => {
            return Err(e).with_context(|| format!("unable to read directory {}", dir.display()))
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_manifest_path(&path) {
            continue;
        }
        let pod = match read_manifest(&path).await {
            Ok(pod) => pod,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Skipping unreadable checkpoint manifest");
                continue;
            }
        };
        if pod.kind() != PodKind::Checkpoint {
            debug!(path = %path.display(), "Skipping manifest that is not a checkpoint");
            continue;
        }
        checkpoints.insert(pod.id(), pod);
    }
    Ok(checkpoints)
}

fn is_manifest_path(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().unwrap_or_default() == MANIFEST_EXTENSION
}

async fn read_manifest(path: &Path) -> anyhow::Result<Pod> {
    let raw = tokio::fs::read(path).await?;
    let pod: KubePod = serde_json::from_slice(&raw)?;
    Ok(Pod::new(pod))
}

/// Writes the content to the path unless the file already holds exactly that content. The write
/// is atomic: readers see either the old file or the new one, never a partial write. Returns
/// whether the file was written
pub async fn write_if_different(path: &Path, content: &[u8]) -> anyhow::Result<bool> {
    if !differs(path, content).await? {
        return Ok(false);
    }
    write_atomic(path, content.to_vec())
        .await
        .with_context(|| format!("unable to write {}", path.display()))?;
    Ok(true)
}

async fn differs(path: &Path, content: &[u8]) -> anyhow::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) => Ok(existing != content),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => Ok(true),
        Err(e) => Err(e).with_context(|| format!("unable to read {}", path.display())),
    }
}

async fn write_atomic(path: &Path, content: Vec<u8>) -> anyhow::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", path.display()))?;
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)?;
        file.write_all(&content)?;
        file.as_file().sync_all()?;
        file.persist(&path)?;
        Ok(())
    })
    .await?
}

/// Removes a file, treating a file that is already gone as success. Returns whether a file was
/// removed
pub async fn remove(path: &Path) -> anyhow::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("unable to remove {}", path.display())),
    }
}

/// Removes a directory and everything in it, treating a directory that is already gone as
/// success. Returns whether a directory was removed
pub async fn remove_dir(path: &Path) -> anyhow::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("unable to remove {}", path.display())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pod::CHECKPOINT_OF_ANNOTATION;

    fn checkpoint(namespace: &str, name: &str) -> Pod {
        let pod: KubePod = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "annotations": { CHECKPOINT_OF_ANNOTATION: name },
            },
            "spec": {
                "containers": [{ "name": "main", "image": "k8s.gcr.io/pause:3.5" }]
            }
        }))
        .unwrap();
        Pod::new(pod)
    }

    fn setup() -> (tempfile::TempDir, CheckpointStore) {
        let tempdir = tempfile::tempdir().expect("should be able to create tempdir");
        let store = CheckpointStore::new(
            tempdir.path().join("manifests"),
            tempdir.path().join("inactive-manifests"),
        );
        (tempdir, store)
    }

    #[tokio::test]
    async fn test_write_if_different_is_idempotent() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("kube-system-foo.json");

        assert!(write_if_different(&path, b"first").await.unwrap());
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(!write_if_different(&path, b"first").await.unwrap());
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
        assert!(write_if_different(&path, b"second").await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("kube-system-foo.json");
        write_if_different(&path, b"content").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(tempdir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["kube-system-foo.json".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_missing_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("nope.json");
        assert!(!remove(&path).await.unwrap());
        std::fs::write(&path, b"{}").unwrap();
        assert!(remove(&path).await.unwrap());
        assert!(!path.exists());
        assert!(!remove_dir(&tempdir.path().join("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_checkpoints_skips_bad_files() {
        let tempdir = tempfile::tempdir().unwrap();
        let dir = tempdir.path();
        let good = checkpoint("kube-system", "kube-apiserver");
        std::fs::write(dir.join("kube-system-kube-apiserver.json"), encode(&good).unwrap()).unwrap();
        std::fs::write(dir.join("kube-system-broken.json"), b"{not json").unwrap();
        std::fs::write(dir.join(".kube-system-kube-scheduler.json.tmp"), b"{}").unwrap();
        std::fs::write(dir.join("README.md"), b"hello").unwrap();
        let static_pod = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "etcd", "namespace": "kube-system" }
        });
        std::fs::write(dir.join("etcd.json"), serde_json::to_vec(&static_pod).unwrap()).unwrap();

        let checkpoints = list_checkpoints(dir).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(
            checkpoints.get(&CheckpointId::new("kube-system", "kube-apiserver")),
            Some(&good)
        );
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let tempdir = tempfile::tempdir().unwrap();
        let checkpoints = list_checkpoints(&tempdir.path().join("missing")).await.unwrap();
        assert!(checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_stage_activate_deactivate() {
        let (_tempdir, store) = setup();
        store.ensure_dirs().await.unwrap();
        let pod = checkpoint("kube-system", "kube-scheduler");
        let id = pod.id();
        let manifest = encode(&pod).unwrap();

        assert!(store.inactive_differs(&id, &manifest).await.unwrap());
        assert!(store.stage(&id, &manifest).await.unwrap());
        assert!(!store.inactive_differs(&id, &manifest).await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());

        assert!(store.activate(&id).await.unwrap());
        assert!(!store.activate(&id).await.unwrap());
        assert_eq!(std::fs::read(store.active_path(&id)).unwrap(), manifest);
        assert!(store.list_active().await.unwrap().contains_key(&id));

        assert!(store.deactivate(&id).await.unwrap());
        assert!(!store.deactivate(&id).await.unwrap());
        assert!(store.list_inactive().await.unwrap().contains_key(&id));

        assert!(store.remove_inactive(&id).await.unwrap());
        assert!(store.list_inactive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_without_staged_manifest_fails() {
        let (_tempdir, store) = setup();
        store.ensure_dirs().await.unwrap();
        let id = CheckpointId::new("kube-system", "missing");
        assert!(store.activate(&id).await.is_err());
        assert!(!store.active_path(&id).exists());
    }
}

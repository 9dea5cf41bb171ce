//! Turns a live parent pod into a checkpoint that the kubelet can run as a static pod.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Container, HostPathVolumeSource, PodSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::pod::{Pod, PodKind, CHECKPOINT_OF_ANNOTATION};
use crate::snapshot::SnapshotPaths;

/// Where the kubelet mounts the service account token
const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Produces standalone checkpoint pods from parent pods
#[derive(Clone, Debug)]
pub struct PodSanitizer {
    paths: SnapshotPaths,
}

impl PodSanitizer {
    /// Returns a sanitizer that points secret and config map volumes at the given snapshot paths
    pub fn new(paths: SnapshotPaths) -> Self {
        PodSanitizer { paths }
    }

    /// Sanitizes a parent pod into its checkpoint. A pod that already is a checkpoint is returned
    /// as is, so sanitizing is idempotent.
    ///
    /// The checkpoint keeps only the identifying metadata of the parent, is owned by the parent,
    /// carries no service account credentials, reads its secrets and config maps from the local
    /// snapshots and has no status.
    pub fn sanitize(&self, pod: &Pod) -> Pod {
        if pod.kind() == PodKind::Checkpoint {
            return pod.clone();
        }

        let name = pod.name().to_owned();
        let namespace = pod.namespace().to_owned();
        let mut checkpoint = pod.as_kube_pod().clone();

        let mut annotations = BTreeMap::new();
        annotations.insert(CHECKPOINT_OF_ANNOTATION.to_owned(), name.clone());
        checkpoint.metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: checkpoint.metadata.labels.take(),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_owned(),
                kind: "Pod".to_owned(),
                name: name.clone(),
                uid: pod.uid().unwrap_or_default().to_owned(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        };

        if let Some(spec) = checkpoint.spec.as_mut() {
            spec.service_account_name = None;
            spec.service_account = None;
            spec.automount_service_account_token = None;
            strip_service_account_token(spec);

            for vol in spec.volumes.iter_mut().flatten() {
                self.rewrite_volume(vol, &namespace, &name);
            }
        }

        checkpoint.status = None;
        Pod::new(checkpoint)
    }

    fn rewrite_volume(&self, vol: &mut Volume, namespace: &str, pod: &str) {
        let secret_name = vol.secret.as_ref().and_then(|s| s.secret_name.as_deref());
        let cm_name = vol.config_map.as_ref().and_then(|c| c.name.as_deref());
        let host_path = match (secret_name, cm_name) {
            (Some(secret_name), _) => self.paths.secret(namespace, pod, secret_name),
            (None, Some(cm_name)) => self.paths.config_map(namespace, pod, cm_name),
            (None, None) => return,
        };

        vol.secret = None;
        vol.config_map = None;
        vol.host_path = Some(HostPathVolumeSource {
            path: host_path.to_string_lossy().into_owned(),
            type_: None,
        });
    }
}

/// Removes the service account token mounts and any volume that only existed to back them
fn strip_service_account_token(spec: &mut PodSpec) {
    let mut token_volumes = BTreeSet::new();
    let mut other_volumes = BTreeSet::new();

    let containers = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten());
    for container in containers {
        strip_container_mounts(container, &mut token_volumes, &mut other_volumes);
    }

    if let Some(volumes) = spec.volumes.as_mut() {
        volumes.retain(|v| !token_volumes.contains(&v.name) || other_volumes.contains(&v.name));
    }
}

fn strip_container_mounts(
    container: &mut Container,
    token_volumes: &mut BTreeSet<String>,
    other_volumes: &mut BTreeSet<String>,
) {
    if let Some(mounts) = container.volume_mounts.as_mut() {
        mounts.retain(|m| {
            if m.mount_path.trim_end_matches('/') == SERVICE_ACCOUNT_MOUNT_PATH {
                token_volumes.insert(m.name.clone());
                false
            } else {
                other_volumes.insert(m.name.clone());
                true
            }
        });
    }
}

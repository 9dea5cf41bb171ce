//! `pod` is a collection of utilities surrounding the Kubernetes pod API, along with the
//! identity and classification used for checkpoints.
use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Pod as KubePod, Volume as KubeVolume};

/// Annotation a parent pod carries (with the value `"true"`) to request a checkpoint
pub const SHOULD_CHECKPOINT_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint";
/// Annotation set on every checkpoint, holding the name of the pod it was made from
pub const CHECKPOINT_OF_ANNOTATION: &str = "checkpointer.alpha.coreos.com/checkpoint-of";
/// Annotation the kubelet sets to the source a pod was loaded from
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
/// Annotation the kubelet sets on the API mirror of a static pod
pub const CONFIG_MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

const FILE_CONFIG_SOURCE: &str = "file";
const DEFAULT_NAMESPACE: &str = "default";

/// The identity of a checkpoint: the namespace and name of the parent pod.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId {
    namespace: String,
    name: String,
}

impl CheckpointId {
    /// Construct a new id from a namespace and pod name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        CheckpointId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The namespace of the parent pod
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name of the parent pod
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manifest file name used in both the active and inactive directories
    pub fn manifest_file_name(&self) -> String {
        format!("{}-{}.json", self.namespace, self.name)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a pod relates to checkpointing, decided once from its annotations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodKind {
    /// A pod eligible to have a checkpoint made of it
    Parent,
    /// A checkpoint made by this program. Checkpoints are never checkpointed again
    Checkpoint,
    /// A pod loaded from a manifest file on the node (or the API mirror of one)
    Static,
    /// Anything else
    Other,
}

impl PodKind {
    fn classify(annotations: &BTreeMap<String, String>) -> Self {
        if annotations.contains_key(CHECKPOINT_OF_ANNOTATION) {
            PodKind::Checkpoint
        } else if annotations.get(CONFIG_SOURCE_ANNOTATION).map(String::as_str)
            == Some(FILE_CONFIG_SOURCE)
            || annotations.contains_key(CONFIG_MIRROR_ANNOTATION)
        {
            PodKind::Static
        } else if annotations.get(SHOULD_CHECKPOINT_ANNOTATION).map(String::as_str) == Some("true")
        {
            PodKind::Parent
        } else {
            PodKind::Other
        }
    }
}

/// A Kubernetes Pod
///
/// This is a new type around the k8s_openapi Pod definition providing convenient accessor
/// methods. The [`PodKind`] is computed when the pod is wrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    inner: KubePod,
    kind: PodKind,
}

impl Pod {
    /// Construct a new Pod
    pub fn new(inner: KubePod) -> Self {
        let kind = PodKind::classify(inner.metadata.annotations.as_ref().unwrap_or(&EMPTY_MAP));
        Pod { inner, kind }
    }

    /// Get the name of the pod
    pub fn name(&self) -> &str {
        self.inner.metadata.name.as_deref().unwrap_or_default()
    }

    /// Get the pod's namespace
    ///
    /// Returns "default" if no namespace was explictily set
    pub fn namespace(&self) -> &str {
        self.inner
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// The checkpoint id this pod maps to
    pub fn id(&self) -> CheckpointId {
        CheckpointId::new(self.namespace(), self.name())
    }

    /// How this pod relates to checkpointing
    pub fn kind(&self) -> PodKind {
        self.kind
    }

    /// Whether this pod should have a checkpoint made of it
    pub fn is_parent(&self) -> bool {
        self.kind == PodKind::Parent
    }

    /// Get the pod's uid, if the API server assigned one
    pub fn uid(&self) -> Option<&str> {
        self.inner.metadata.uid.as_deref()
    }

    /// Get the pod volumes
    pub fn volumes(&self) -> &[KubeVolume] {
        self.inner
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or_default()
    }

    /// Get the pod's labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.inner.metadata.labels.as_ref().unwrap_or(&EMPTY_MAP)
    }

    ///  Get the pod's annotations
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.inner
            .metadata
            .annotations
            .as_ref()
            .unwrap_or(&EMPTY_MAP)
    }

    ///  Get a specific annotation from the pod
    pub fn get_annotation(&self, key: &str) -> Option<&str> {
        Some(self.annotations().get(key)?.as_str())
    }

    /// Turn the Pod into the Kubernetes API version of a Pod
    pub fn into_kube_pod(self) -> KubePod {
        self.inner
    }

    /// Turn a reference to a Pod into a reference to the Kubernetes API version of a Pod
    pub fn as_kube_pod(&self) -> &KubePod {
        &self.inner
    }
}

impl std::convert::From<KubePod> for Pod {
    fn from(api_pod: KubePod) -> Self {
        Self::new(api_pod)
    }
}

impl std::convert::From<Pod> for KubePod {
    fn from(pod: Pod) -> Self {
        pod.inner
    }
}

/// Pods keyed by the checkpoint id they map to
pub type PodMap = BTreeMap<CheckpointId, Pod>;

/// Collect the parent pods out of a list of pods, dropping everything else
pub fn parents(pods: impl IntoIterator<Item = KubePod>) -> PodMap {
    pods.into_iter()
        .map(Pod::new)
        .filter(Pod::is_parent)
        .map(|p| (p.id(), p))
        .collect()
}

lazy_static::lazy_static! {
    static ref EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();
}

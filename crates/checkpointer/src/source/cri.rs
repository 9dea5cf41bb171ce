//! The container runtime, queried over the CRI socket, as the source of which pods are really
//! running. Neither the kubelet nor the API server can be trusted for this: both may be down or
//! lagging exactly when a checkpoint is needed.
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use super::RuntimeSource;
use crate::pod::{CheckpointId, CHECKPOINT_OF_ANNOTATION};
use crate::runtime_api::v1alpha2::{
    runtime_service_client::RuntimeServiceClient, Container, ContainerFilter, ContainerState,
    ContainerStateValue, ListContainersRequest, ListPodSandboxRequest, PodSandbox,
    PodSandboxFilter, PodSandboxState, PodSandboxStateValue,
};

const UNIX_SCHEME: &str = "unix://";
// Labels the kubelet puts on every sandbox it creates
const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// Returns a new UNIX socket channel suitable for use with tonic generated gRPC clients. Every
/// request on the channel fails after `timeout`
async fn socket_channel<P: AsRef<Path>>(
    path: P,
    timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let p = path.as_ref().to_owned();

    // This is a dummy http endpoint needed for the Endpoint constructors, it is ignored by the
    // connector
    Endpoint::from_static("http://[::]:50051")
        .timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(p.clone())))
        .await
}

/// A client for the CRI runtime service
pub struct RuntimeClient {
    socket: PathBuf,
    timeout: Duration,
}

impl RuntimeClient {
    /// Returns a client for the runtime listening at `endpoint`, either a `unix://` URL or a bare
    /// socket path
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let socket = endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(endpoint);
        RuntimeClient {
            socket: PathBuf::from(socket),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl RuntimeSource for RuntimeClient {
    async fn running_pods(&self) -> anyhow::Result<BTreeSet<CheckpointId>> {
        let channel = socket_channel(&self.socket, self.timeout)
            .await
            .with_context(|| {
                format!("unable to connect to container runtime at {}", self.socket.display())
            })?;
        let mut client = RuntimeServiceClient::new(channel);

        let sandboxes = client
            .list_pod_sandbox(ListPodSandboxRequest {
                filter: Some(PodSandboxFilter {
                    state: Some(PodSandboxStateValue {
                        state: PodSandboxState::SandboxReady as i32,
                    }),
                    ..Default::default()
                }),
            })
            .await
            .context("unable to list pod sandboxes")?
            .into_inner()
            .items;
        let containers = client
            .list_containers(ListContainersRequest {
                filter: Some(ContainerFilter {
                    state: Some(ContainerStateValue {
                        state: ContainerState::ContainerRunning as i32,
                    }),
                    ..Default::default()
                }),
            })
            .await
            .context("unable to list containers")?
            .into_inner()
            .containers;

        let running = running_pods(&sandboxes, &containers);
        debug!(count = running.len(), "Listed running pods from the container runtime");
        Ok(running)
    }
}

/// Pods with a ready sandbox that has at least one running container. Sandboxes of checkpoints
/// are ignored so a running checkpoint never counts as its parent running
fn running_pods(sandboxes: &[PodSandbox], containers: &[Container]) -> BTreeSet<CheckpointId> {
    let with_running_containers: HashSet<&str> = containers
        .iter()
        .filter(|c| c.state == ContainerState::ContainerRunning as i32)
        .map(|c| c.pod_sandbox_id.as_str())
        .collect();

    sandboxes
        .iter()
        .filter(|s| s.state == PodSandboxState::SandboxReady as i32)
        .filter(|s| !s.annotations.contains_key(CHECKPOINT_OF_ANNOTATION))
        .filter(|s| with_running_containers.contains(s.id.as_str()))
        .filter_map(sandbox_pod_id)
        .collect()
}

fn sandbox_pod_id(sandbox: &PodSandbox) -> Option<CheckpointId> {
    let labels = (
        sandbox.labels.get(POD_NAMESPACE_LABEL),
        sandbox.labels.get(POD_NAME_LABEL),
    );
    match (labels, sandbox.metadata.as_ref()) {
        ((Some(namespace), Some(name)), _) => {
            Some(CheckpointId::new(namespace.as_str(), name.as_str()))
        }
        (_, Some(m)) => Some(CheckpointId::new(m.namespace.as_str(), m.name.as_str())),
        _ => None,
    }
}

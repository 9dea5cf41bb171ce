//! Configuration for the checkpointer
//!
//! The best way to configure the checkpointer is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::pod::CheckpointId;

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_KUBELET_URL: &str = "http://127.0.0.1:10255";
const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///var/run/dockershim.sock";
const DEFAULT_RUNTIME_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SNAPSHOT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const ACTIVE_MANIFEST_DIR: &str = "/etc/kubernetes/manifests";
const INACTIVE_MANIFEST_DIR: &str = "/etc/kubernetes/inactive-manifests";
const SECRET_DIR: &str = "/etc/kubernetes/checkpoint-secrets";
const CONFIGMAP_DIR: &str = "/etc/kubernetes/checkpoint-configmaps";

/// The configuration needed for the checkpointer to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// The name of the node the checkpointer runs on
    pub node_name: String,
    /// The name of the checkpointer's own pod
    pub pod_name: String,
    /// The namespace of the checkpointer's own pod
    pub pod_namespace: String,
    /// The base URL of the kubelet's read-only API
    pub kubelet_url: String,
    /// The CRI endpoint of the container runtime
    pub runtime_endpoint: String,
    /// How long a single container runtime request may take
    pub runtime_request_timeout: Duration,
    /// How long a single API server (or kubelet) request may take
    pub api_request_timeout: Duration,
    /// How long a checkpoint survives after its parent disappears from the API server
    pub grace_period: Duration,
    /// How long to sleep between reconciliation passes
    pub poll_interval: Duration,
    /// How often secrets and config maps of unchanged checkpoints are snapshotted again
    pub snapshot_refresh_interval: Duration,
    /// The kubelet's static pod manifest directory
    pub active_manifest_dir: PathBuf,
    /// Where checkpoints are staged before they are needed
    pub inactive_manifest_dir: PathBuf,
    /// Where secret snapshots are kept
    pub secret_dir: PathBuf,
    /// Where config map snapshots are kept
    pub configmap_dir: PathBuf,
}

impl Config {
    /// Returns a Config object set with all of the defaults for the checkpointer pod with the
    /// given name.
    pub fn default_config(pod_name: &str) -> anyhow::Result<Self> {
        Ok(Config {
            node_name: sanitize_hostname(&default_hostname()?),
            pod_name: pod_name.to_owned(),
            pod_namespace: DEFAULT_NAMESPACE.to_owned(),
            kubelet_url: DEFAULT_KUBELET_URL.to_owned(),
            runtime_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_owned(),
            runtime_request_timeout: DEFAULT_RUNTIME_REQUEST_TIMEOUT,
            api_request_timeout: DEFAULT_API_REQUEST_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            snapshot_refresh_interval: DEFAULT_SNAPSHOT_REFRESH_INTERVAL,
            active_manifest_dir: PathBuf::from(ACTIVE_MANIFEST_DIR),
            inactive_manifest_dir: PathBuf::from(INACTIVE_MANIFEST_DIR),
            secret_dir: PathBuf::from(SECRET_DIR),
            configmap_dir: PathBuf::from(CONFIGMAP_DIR),
        })
    }

    /// The checkpoint id of the checkpointer's own pod
    pub fn self_id(&self) -> CheckpointId {
        CheckpointId::new(self.pod_namespace.as_str(), self.pod_name.as_str())
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let node_name = match opts.node_name {
            Some(name) => name,
            None => sanitize_hostname(&default_hostname()?),
        };
        let grace_period = Duration::from_secs(opts.checkpoint_grace_period);
        if grace_period > crate::state::MAX_GRACE_PERIOD {
            anyhow::bail!(
                "--checkpoint-grace-period must be at most {} seconds",
                crate::state::MAX_GRACE_PERIOD.as_secs()
            );
        }

        Ok(Config {
            node_name,
            pod_name: opts.pod_name,
            pod_namespace: opts.pod_namespace,
            kubelet_url: opts.kubelet_url,
            runtime_endpoint: opts.runtime_endpoint,
            runtime_request_timeout: Duration::from_secs(opts.runtime_request_timeout),
            api_request_timeout: Duration::from_secs(opts.api_request_timeout),
            grace_period,
            poll_interval: Duration::from_secs(opts.poll_interval),
            snapshot_refresh_interval: Duration::from_secs(opts.snapshot_refresh_interval),
            active_manifest_dir: opts.active_manifest_dir,
            inactive_manifest_dir: opts.inactive_manifest_dir,
            secret_dir: opts.secret_dir,
            configmap_dir: opts.configmap_dir,
        })
    }
}

/// CLI options that can be configured for the checkpointer
///
/// These can be parsed from args using `Opts::from_args()`. Durations are in seconds
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "checkpoint",
    about = "Keeps node-local checkpoints of self-hosted control plane pods"
)]
pub struct Opts {
    #[structopt(
        long = "node-name",
        env = "NODE_NAME",
        help = "The name of this node in Kubernetes, defaults to the hostname of this machine"
    )]
    node_name: Option<String>,

    #[structopt(
        long = "checkpointer-pod-name",
        env = "POD_NAME",
        help = "The name of the checkpointer's own pod, usually set through the downward API"
    )]
    pod_name: String,

    #[structopt(
        long = "checkpointer-pod-namespace",
        env = "POD_NAMESPACE",
        default_value = DEFAULT_NAMESPACE,
        help = "The namespace of the checkpointer's own pod"
    )]
    pod_namespace: String,

    #[structopt(
        long = "kubelet-url",
        env = "KUBELET_URL",
        default_value = DEFAULT_KUBELET_URL,
        help = "The base URL of the kubelet's read-only API"
    )]
    kubelet_url: String,

    #[structopt(
        long = "runtime-endpoint",
        env = "RUNTIME_ENDPOINT",
        default_value = DEFAULT_RUNTIME_ENDPOINT,
        help = "The CRI endpoint of the container runtime"
    )]
    runtime_endpoint: String,

    #[structopt(
        long = "runtime-request-timeout",
        env = "RUNTIME_REQUEST_TIMEOUT",
        default_value = "120",
        help = "Timeout in seconds for container runtime requests"
    )]
    runtime_request_timeout: u64,

    #[structopt(
        long = "api-request-timeout",
        env = "API_REQUEST_TIMEOUT",
        default_value = "30",
        help = "Timeout in seconds for API server and kubelet requests"
    )]
    api_request_timeout: u64,

    #[structopt(
        long = "checkpoint-grace-period",
        env = "CHECKPOINT_GRACE_PERIOD",
        default_value = "60",
        help = "Seconds a checkpoint is kept after its parent pod is deleted from the API server"
    )]
    checkpoint_grace_period: u64,

    #[structopt(
        long = "poll-interval",
        env = "POLL_INTERVAL",
        default_value = "5",
        help = "Seconds to wait between reconciliation passes"
    )]
    poll_interval: u64,

    #[structopt(
        long = "snapshot-refresh-interval",
        env = "SNAPSHOT_REFRESH_INTERVAL",
        default_value = "60",
        help = "Seconds between refreshes of secret and config map snapshots"
    )]
    snapshot_refresh_interval: u64,

    #[structopt(
        long = "active-manifest-dir",
        env = "ACTIVE_MANIFEST_DIR",
        default_value = ACTIVE_MANIFEST_DIR,
        help = "The kubelet's static pod manifest directory"
    )]
    active_manifest_dir: PathBuf,

    #[structopt(
        long = "inactive-manifest-dir",
        env = "INACTIVE_MANIFEST_DIR",
        default_value = INACTIVE_MANIFEST_DIR,
        help = "The directory checkpoints are staged in"
    )]
    inactive_manifest_dir: PathBuf,

    #[structopt(
        long = "secret-dir",
        env = "CHECKPOINT_SECRET_DIR",
        default_value = SECRET_DIR,
        help = "The directory secret snapshots are kept in"
    )]
    secret_dir: PathBuf,

    #[structopt(
        long = "configmap-dir",
        env = "CHECKPOINT_CONFIGMAP_DIR",
        default_value = CONFIGMAP_DIR,
        help = "The directory config map snapshots are kept in"
    )]
    configmap_dir: PathBuf,
}

fn default_hostname() -> anyhow::Result<String> {
    hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname string"))
}

// Some hostnames (particularly local ones) can have uppercase letters, which is
// disallowed by the DNS spec used in kubernetes naming
fn sanitize_hostname(hostname: &str) -> String {
    hostname.to_lowercase()
}

//! The main loop tying the data sources to the reconciliation engine.
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::reconcile::{Decisions, Observation, ReconciliationEngine};
use crate::snapshot::{ResourceSnapshotter, SnapshotPaths};
use crate::source::{
    ApiServerClient, KubeletClient, PodSource, RuntimeClient, RuntimeSource,
};
use crate::store::CheckpointStore;

/// Periodically reconciles the checkpoints on this node.
///
/// Each pass gathers the running pods from the container runtime and the parent pods from the
/// kubelet and the API server concurrently, then hands everything to the
/// [`ReconciliationEngine`]. A source that fails does not stop the pass: the runtime and the
/// kubelet are treated as reporting nothing, the API server as unavailable.
pub struct Checkpointer {
    runtime: Arc<dyn RuntimeSource>,
    kubelet: Arc<dyn PodSource>,
    api: Arc<dyn PodSource>,
    store: CheckpointStore,
    engine: ReconciliationEngine,
    poll_interval: Duration,
}

impl Checkpointer {
    /// Create a checkpointer talking to the real kubelet, container runtime and API server
    pub fn new(config: &Config, kube_config: kube::Config) -> anyhow::Result<Self> {
        let client = kube::Client::try_from(kube_config)?;
        let api = Arc::new(ApiServerClient::new(
            client,
            config.node_name.as_str(),
            config.api_request_timeout,
        ));
        let kubelet = Arc::new(KubeletClient::new(
            &config.kubelet_url,
            config.api_request_timeout,
        )?);
        let runtime = Arc::new(RuntimeClient::new(
            &config.runtime_endpoint,
            config.runtime_request_timeout,
        ));

        let store = CheckpointStore::new(
            config.active_manifest_dir.clone(),
            config.inactive_manifest_dir.clone(),
        );
        let snapshotter = ResourceSnapshotter::new(
            api.clone(),
            SnapshotPaths::new(config.secret_dir.clone(), config.configmap_dir.clone()),
        );
        let engine = ReconciliationEngine::new(
            store.clone(),
            snapshotter,
            config.self_id(),
            config.grace_period,
            config.snapshot_refresh_interval,
        );

        Ok(Checkpointer::with_sources(
            runtime,
            kubelet,
            api,
            store,
            engine,
            config.poll_interval,
        ))
    }

    /// Create a checkpointer from already constructed parts. `store` must be the store the
    /// engine was built with
    pub fn with_sources(
        runtime: Arc<dyn RuntimeSource>,
        kubelet: Arc<dyn PodSource>,
        api: Arc<dyn PodSource>,
        store: CheckpointStore,
        engine: ReconciliationEngine,
        poll_interval: Duration,
    ) -> Self {
        Checkpointer {
            runtime,
            kubelet,
            api,
            store,
            engine,
            poll_interval,
        }
    }

    /// Run reconciliation passes until a shutdown signal is caught. The signal is only acted on
    /// between passes so a pass is never interrupted halfway through its writes.
    ///
    /// Fails right away if the manifest directories can't be created.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.store.ensure_dirs().await?;
        info!(poll_interval = ?self.poll_interval, "Starting checkpointer");

        let mut signal_task = tokio::spawn(start_signal_task()?);
        loop {
            if let Err(e) = self.run_once(Instant::now()).await {
                error!(error = ?e, "Reconciliation pass failed");
            }

            tokio::select! {
                res = &mut signal_task => {
                    match res {
                        Ok(Ok(())) => info!("Shutting down checkpointer"),
                        Ok(Err(e)) => error!(error = %e, "Signal task completed with error"),
                        Err(e) => error!(error = %e, "Signal task panicked"),
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Run a single reconciliation pass
    pub async fn run_once(&mut self, now: Instant) -> anyhow::Result<Decisions> {
        let (running, local, api) = tokio::join!(
            self.runtime.running_pods(),
            self.kubelet.pods(),
            self.api.pods()
        );

        let local_running = running.unwrap_or_else(|e| {
            warn!(error = ?e, "Unable to get running pods from the container runtime, assuming none are running");
            BTreeSet::new()
        });
        let local_parents = local.unwrap_or_else(|e| {
            warn!(error = ?e, "Unable to get pods from the kubelet, assuming it has none");
            Default::default()
        });
        let api_parents = match api {
            Ok(pods) => Some(pods),
            Err(e) => {
                warn!(error = ?e, "API server unavailable");
                None
            }
        };

        let span = tracing::info_span!(
            "reconcile",
            running = local_running.len(),
            local_parents = local_parents.len(),
            api_available = api_parents.is_some()
        );
        let observation = Observation {
            local_running,
            local_parents,
            api_parents,
        };
        self.engine.reconcile(now, observation).instrument(span).await
    }
}

/// Installs the SIGTERM handler before returning, so a termination request arriving mid-pass is
/// only acted on once the pass is done. The returned future resolves on SIGINT or SIGTERM.
fn start_signal_task() -> anyhow::Result<impl Future<Output = anyhow::Result<()>> + Send + 'static>
{
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            res = ctrl_c() => {
                res?;
                warn!("Caught keyboard interrupt.");
            }
            _ = terminate.recv() => warn!("Caught termination signal."),
        }
        Ok(())
    })
}

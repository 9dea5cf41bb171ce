//! The local kubelet's read-only API, which keeps working when the API server is down.
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod as KubePod;
use serde::Deserialize;
use tracing::debug;

use super::PodSource;
use crate::pod::{parents, PodMap};

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Option<Vec<KubePod>>,
}

/// Lists the pods the local kubelet knows about
pub struct KubeletClient {
    client: reqwest::Client,
    pods_url: String,
}

impl KubeletClient {
    /// Returns a client for the kubelet serving at `url`, typically the read-only port
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("unable to build kubelet client")?;
        Ok(KubeletClient {
            client,
            pods_url: format!("{}/pods", url.trim_end_matches('/')),
        })
    }
}

#[async_trait::async_trait]
impl PodSource for KubeletClient {
    async fn pods(&self) -> anyhow::Result<PodMap> {
        let body = self
            .client
            .get(&self.pods_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("unable to list pods from kubelet at {}", self.pods_url))?
            .bytes()
            .await?;
        let pods = decode_pod_list(&body)?;
        debug!(count = pods.len(), "Listed parent pods from the kubelet");
        Ok(pods)
    }
}

/// Decodes the kubelet's pod list into the parent pods it contains
fn decode_pod_list(body: &[u8]) -> anyhow::Result<PodMap> {
    let list: PodList =
        serde_json::from_slice(body).context("unable to decode pod list from kubelet")?;
    Ok(parents(list.items.unwrap_or_default()))
}

//! The Kubernetes API server as a source of truth for scheduled parent pods, and the place secrets
//! and config maps are fetched from for snapshots.
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::{ConfigMap, Pod as KubePod, Secret};
use kube::api::{Api, ListParams};
use tracing::debug;

use super::PodSource;
use crate::pod::{parents, PodMap};
use crate::snapshot::ObjectFetcher;

/// A client for the parts of the API server the checkpointer uses
#[derive(Clone)]
pub struct ApiServerClient {
    client: kube::Client,
    node_name: String,
    timeout: Duration,
}

impl ApiServerClient {
    /// Returns a client that lists pods scheduled to `node_name`. Every request gives up after
    /// `timeout`
    pub fn new(client: kube::Client, node_name: impl Into<String>, timeout: Duration) -> Self {
        ApiServerClient {
            client,
            node_name: node_name.into(),
            timeout,
        }
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = Result<T, kube::Error>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {:?}", self.timeout))
            .and_then(|res| res.map_err(anyhow::Error::from))
            .with_context(|| format!("unable to {}", what))
    }
}

#[async_trait::async_trait]
impl PodSource for ApiServerClient {
    async fn pods(&self) -> anyhow::Result<PodMap> {
        let api: Api<KubePod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let list = self
            .with_timeout("list pods from the API server", api.list(&lp))
            .await?;
        let pods = parents(list.items);
        debug!(count = pods.len(), node = %self.node_name, "Listed parent pods from the API server");
        Ok(pods)
    }
}

#[async_trait::async_trait]
impl ObjectFetcher for ApiServerClient {
    async fn secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.with_timeout("get secret", api.get(name)).await
    }

    async fn config_map(&self, namespace: &str, name: &str) -> anyhow::Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.with_timeout("get config map", api.get(name)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pod::{CheckpointId, SHOULD_CHECKPOINT_ANNOTATION};
    use futures::pin_mut;
    use http::{Request as HttpRequest, Response as HttpResponse};
    use hyper::Body;
    use kube::Client;
    use tower_test::mock;

    /// Creates a mock kubernetes API service that answers a single request with the given status
    /// and body, after handing the request to `check`
    fn mock_client<F>(
        status: u16,
        body: serde_json::Value,
        check: F,
    ) -> (Client, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(&HttpRequest<Body>) + Send + 'static,
    {
        let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let spawned = tokio::spawn(async move {
            pin_mut!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            check(&request);
            send.send_response(
                HttpResponse::builder()
                    .status(status)
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            );
        });
        (Client::new(mock_service, "default"), spawned)
    }

    #[tokio::test]
    async fn test_pods_lists_parents_on_node() {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": { "resourceVersion": "10" },
            "items": [
                {
                    "metadata": {
                        "name": "kube-apiserver-abcde",
                        "namespace": "kube-system",
                        "annotations": { SHOULD_CHECKPOINT_ANNOTATION: "true" },
                    },
                },
                {
                    "metadata": { "name": "coredns-12345", "namespace": "kube-system" },
                },
            ],
        });
        let (client, spawned) = mock_client(200, body, |request| {
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(request.uri().path(), "/api/v1/pods");
            let query = request.uri().query().unwrap_or_default();
            assert!(query.contains("fieldSelector=spec.nodeName%3Dmaster-0"), "{}", query);
        });

        let api = ApiServerClient::new(client, "master-0", Duration::from_secs(5));
        let pods = api.pods().await.unwrap();
        spawned.await.unwrap();

        assert_eq!(pods.len(), 1);
        assert!(pods.contains_key(&CheckpointId::new("kube-system", "kube-apiserver-abcde")));
    }

    #[tokio::test]
    async fn test_pods_error_is_reported() {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Failure",
            "message": "etcdserver: request timed out",
            "reason": "InternalError",
            "code": 500,
        });
        let (client, spawned) = mock_client(500, body, |_| ());

        let api = ApiServerClient::new(client, "master-0", Duration::from_secs(5));
        assert!(api.pods().await.is_err());
        spawned.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_secret() {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "kube-apiserver", "namespace": "kube-system" },
            "data": { "tls.key": "a2V5" },
        });
        let (client, spawned) = mock_client(200, body, |request| {
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/kube-system/secrets/kube-apiserver"
            );
        });

        let api = ApiServerClient::new(client, "master-0", Duration::from_secs(5));
        let secret = api.secret("kube-system", "kube-apiserver").await.unwrap();
        spawned.await.unwrap();

        let data = secret.data.unwrap();
        assert_eq!(data["tls.key"].0, b"key".to_vec());
    }

    #[tokio::test]
    async fn test_fetch_config_map() {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "apiserver-config", "namespace": "kube-system" },
            "data": { "config.yaml": "x: 1" },
        });
        let (client, spawned) = mock_client(200, body, |request| {
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/kube-system/configmaps/apiserver-config"
            );
        });

        let api = ApiServerClient::new(client, "master-0", Duration::from_secs(5));
        let config_map = api
            .config_map("kube-system", "apiserver-config")
            .await
            .unwrap();
        spawned.await.unwrap();
        assert_eq!(config_map.data.unwrap()["config.yaml"], "x: 1");
    }
}

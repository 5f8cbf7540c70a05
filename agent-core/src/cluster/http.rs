//! REST-backed [`ClusterApi`] implementation.

use super::types::*;
use super::ClusterApi;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const STRATEGIC_MERGE: &str = "application/strategic-merge-patch+json";

pub struct HttpCluster {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpCluster {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build cluster http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    /// Build a client from the in-cluster service account mount and the
    /// `KUBERNETES_SERVICE_*` environment.
    pub fn in_cluster() -> Result<Self> {
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("read service account token")?
            .trim()
            .to_string();
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set (not running in a cluster?)")?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Ok(ca) = std::fs::read(dir.join("ca.crt")) {
            let cert = reqwest::Certificate::from_pem(&ca).context("parse cluster CA")?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().context("build cluster http client")?;

        Ok(Self {
            base_url: format!("https://{host}:{port}"),
            token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        Self::decode(path, resp).await
    }

    async fn list<T: DeserializeOwned + Default>(&self, path: &str) -> Result<Vec<T>> {
        let list: List<T> = self.get_json(path).await?;
        Ok(list.items)
    }

    async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{path}: HTTP {status}: {body}");
        }
        resp.json().await.with_context(|| format!("{path}: decode response"))
    }

    async fn expect_success(path: &str, resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{path}: HTTP {status}: {body}");
        }
        Ok(())
    }
}

fn workload_path(kind: WorkloadKind, namespace: &str) -> String {
    format!("/apis/apps/v1/namespaces/{namespace}/{}", kind.plural())
}

#[async_trait]
impl ClusterApi for HttpCluster {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.list("/api/v1/namespaces").await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        self.list(&format!("/api/v1/namespaces/{namespace}/pods")).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list("/api/v1/nodes").await
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        self.list(&workload_path(kind, namespace)).await
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        self.get_json(&format!("{}/{name}", workload_path(kind, namespace))).await
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        self.get_json(&format!(
            "/apis/apps/v1/namespaces/{namespace}/replicasets/{name}"
        ))
        .await
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        self.list(&format!(
            "/api/v1/namespaces/{namespace}/persistentvolumeclaims"
        ))
        .await
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>> {
        self.list("/api/v1/persistentvolumes").await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{name}");
        let mut req = self.request(reqwest::Method::DELETE, &path);
        if let Some(grace) = grace_period_seconds {
            req = req.json(&json!({
                "apiVersion": "v1",
                "kind": "DeleteOptions",
                "gracePeriodSeconds": grace,
            }));
        }
        Self::expect_success(&path, req.send().await?).await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims/{name}");
        let resp = self.request(reqwest::Method::DELETE, &path).send().await?;
        Self::expect_success(&path, resp).await
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let path = format!("{}/{name}", workload_path(kind, namespace));
        let resp = self.request(reqwest::Method::DELETE, &path).send().await?;
        Self::expect_success(&path, resp).await
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        let path = format!("{}/{name}", workload_path(kind, namespace));
        let resp = self
            .request(reqwest::Method::PATCH, &path)
            .header(reqwest::header::CONTENT_TYPE, STRATEGIC_MERGE)
            .body(patch.to_string())
            .send()
            .await?;
        Self::expect_success(&path, resp).await
    }

    async fn patch_node(&self, name: &str, patch: Value) -> Result<()> {
        let path = format!("/api/v1/nodes/{name}");
        let resp = self
            .request(reqwest::Method::PATCH, &path)
            .header(reqwest::header::CONTENT_TYPE, STRATEGIC_MERGE)
            .body(patch.to_string())
            .send()
            .await?;
        Self::expect_success(&path, resp).await
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> Result<i32> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}/scale");
        let scale: Value = self.get_json(&path).await?;
        Ok(scale
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32)
    }

    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}/scale");
        let mut scale: Value = self.get_json(&path).await?;
        scale["spec"]["replicas"] = json!(replicas);
        let resp = self
            .request(reqwest::Method::PUT, &path)
            .json(&scale)
            .send()
            .await?;
        Self::expect_success(&path, resp).await
    }
}

//! The Kubernetes API seam.
//!
//! Analyzers and the command executor talk to [`ClusterApi`], never to the
//! API server directly. [`HttpCluster`] implements the trait against the
//! REST API with the in-cluster service account; [`fake::FakeCluster`] is an
//! in-memory double for tests.

mod http;
mod types;

pub mod fake;

pub use http::HttpCluster;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload>;
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet>;
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;
    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;
    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    /// Strategic-merge patch against a workload.
    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()>;
    async fn patch_node(&self, name: &str, patch: Value) -> Result<()>;

    /// Read `spec.replicas` from the deployment's scale subresource.
    async fn get_scale(&self, namespace: &str, name: &str) -> Result<i32>;
    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
}

//! In-memory [`ClusterApi`] double for tests.
//!
//! Seed it with resources, run the code under test, then inspect the
//! recorded mutations. `fail_with` makes every call return the given error,
//! for exercising failure absorption.

use super::types::*;
use super::ClusterApi;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    namespaces: Vec<Namespace>,
    pods: Vec<Pod>,
    nodes: Vec<Node>,
    workloads: Vec<(WorkloadKind, Workload)>,
    replica_sets: Vec<ReplicaSet>,
    pvcs: Vec<PersistentVolumeClaim>,
    pvs: Vec<PersistentVolume>,
    scales: HashMap<(String, String), i32>,
    fail_with: Option<String>,

    deleted_pods: Vec<(String, String, Option<i64>)>,
    deleted_pvcs: Vec<(String, String)>,
    deleted_workloads: Vec<(WorkloadKind, String, String)>,
    workload_patches: Vec<(WorkloadKind, String, String, Value)>,
    node_patches: Vec<(String, Value)>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, name: &str) -> &Self {
        self.state.lock().namespaces.push(Namespace {
            metadata: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
        });
        self
    }

    pub fn add_pod(&self, pod: Pod) -> &Self {
        self.state.lock().pods.push(pod);
        self
    }

    pub fn add_node(&self, node: Node) -> &Self {
        self.state.lock().nodes.push(node);
        self
    }

    pub fn add_workload(&self, kind: WorkloadKind, workload: Workload) -> &Self {
        self.state.lock().workloads.push((kind, workload));
        self
    }

    pub fn add_replica_set(&self, rs: ReplicaSet) -> &Self {
        self.state.lock().replica_sets.push(rs);
        self
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) -> &Self {
        self.state.lock().pvcs.push(pvc);
        self
    }

    pub fn add_pv(&self, pv: PersistentVolume) -> &Self {
        self.state.lock().pvs.push(pv);
        self
    }

    pub fn set_scale(&self, namespace: &str, name: &str, replicas: i32) -> &Self {
        self.state
            .lock()
            .scales
            .insert((namespace.into(), name.into()), replicas);
        self
    }

    /// Make every subsequent call fail with this message.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().fail_with = Some(message.into());
    }

    pub fn deleted_pods(&self) -> Vec<(String, String, Option<i64>)> {
        self.state.lock().deleted_pods.clone()
    }

    pub fn deleted_pvcs(&self) -> Vec<(String, String)> {
        self.state.lock().deleted_pvcs.clone()
    }

    pub fn deleted_workloads(&self) -> Vec<(WorkloadKind, String, String)> {
        self.state.lock().deleted_workloads.clone()
    }

    pub fn workload_patches(&self) -> Vec<(WorkloadKind, String, String, Value)> {
        self.state.lock().workload_patches.clone()
    }

    pub fn node_patches(&self) -> Vec<(String, Value)> {
        self.state.lock().node_patches.clone()
    }

    pub fn scale(&self, namespace: &str, name: &str) -> Option<i32> {
        self.state
            .lock()
            .scales
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    fn check_failure(state: &FakeState) -> Result<()> {
        match &state.fail_with {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state.namespaces.clone())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state
            .pods
            .iter()
            .filter(|p| p.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state.nodes.clone())
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state
            .workloads
            .iter()
            .filter(|(k, w)| *k == kind && w.metadata.namespace == namespace)
            .map(|(_, w)| w.clone())
            .collect())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Workload> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .workloads
            .iter()
            .find(|(k, w)| {
                *k == kind && w.metadata.namespace == namespace && w.metadata.name == name
            })
            .map(|(_, w)| w.clone())
            .ok_or_else(|| anyhow!("{} {namespace}/{name} not found", kind.as_str()))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .replica_sets
            .iter()
            .find(|rs| rs.metadata.namespace == namespace && rs.metadata.name == name)
            .cloned()
            .ok_or_else(|| anyhow!("ReplicaSet {namespace}/{name} not found"))
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state
            .pvcs
            .iter()
            .filter(|p| p.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state.pvs.clone())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .deleted_pods
            .push((namespace.into(), name.into(), grace_period_seconds));
        state
            .pods
            .retain(|p| !(p.metadata.namespace == namespace && p.metadata.name == name));
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state.deleted_pvcs.push((namespace.into(), name.into()));
        state
            .pvcs
            .retain(|p| !(p.metadata.namespace == namespace && p.metadata.name == name));
        Ok(())
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .deleted_workloads
            .push((kind, namespace.into(), name.into()));
        state.workloads.retain(|(k, w)| {
            !(*k == kind && w.metadata.namespace == namespace && w.metadata.name == name)
        });
        Ok(())
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .workload_patches
            .push((kind, namespace.into(), name.into(), patch));
        Ok(())
    }

    async fn patch_node(&self, name: &str, patch: Value) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state.node_patches.push((name.into(), patch));
        Ok(())
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> Result<i32> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        state
            .scales
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| anyhow!("deployments/scale {namespace}/{name} not found"))
    }

    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        match state.scales.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(current) => {
                *current = replicas;
                Ok(())
            }
            None => bail!("deployments/scale {namespace}/{name} not found"),
        }
    }
}

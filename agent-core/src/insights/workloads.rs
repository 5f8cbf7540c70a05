//! Workload-scoped analyzers: probes, readiness, crashloops, limits.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;

use super::{make_fingerprint, Analyzer, Insight, Severity};
use crate::cluster::{ClusterApi, WorkloadKind};

/// Restart count at which a container is flagged even without a
/// CrashLoopBackOff state.
const HIGH_RESTART_THRESHOLD: i32 = 5;

const WORKLOAD_KINDS: &[WorkloadKind] = &[
    WorkloadKind::Deployment,
    WorkloadKind::StatefulSet,
    WorkloadKind::DaemonSet,
];

pub struct MissingProbesAnalyzer;

#[async_trait]
impl Analyzer for MissingProbesAnalyzer {
    fn name(&self) -> &'static str {
        "missing_probes"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let mut insights = Vec::new();
        for &kind in WORKLOAD_KINDS {
            for workload in cluster.list_workloads(kind, namespace).await? {
                let missing: Vec<&str> = workload
                    .spec
                    .template
                    .spec
                    .containers
                    .iter()
                    .filter(|c| c.readiness_probe.is_none() || c.liveness_probe.is_none())
                    .map(|c| c.name.as_str())
                    .collect();
                if missing.is_empty() {
                    continue;
                }
                let name = &workload.metadata.name;
                insights.push(Insight {
                    analyzer: self.name().into(),
                    category: "reliability".into(),
                    severity: Severity::Warning,
                    title: format!("{kind} {name:?} has containers without probes"),
                    description: format!(
                        "Container(s) {} lack readiness/liveness probes. Without probes, Kubernetes cannot detect container health issues.",
                        missing.join(", ")
                    ),
                    target_kind: kind.as_str().into(),
                    target_namespace: namespace.into(),
                    target_name: name.clone(),
                    fingerprint: make_fingerprint(self.name(), kind.as_str(), namespace, name),
                    proposed_action: String::new(),
                    proposed_params: Default::default(),
                    auto_remediable: false,
                });
            }
        }
        Ok(insights)
    }
}

pub struct UnreadyWorkloadsAnalyzer;

#[async_trait]
impl Analyzer for UnreadyWorkloadsAnalyzer {
    fn name(&self) -> &'static str {
        "unready_workloads"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let mut insights = Vec::new();
        // DaemonSets have no spec.replicas; only replicated workloads apply.
        for kind in [WorkloadKind::Deployment, WorkloadKind::StatefulSet] {
            for workload in cluster.list_workloads(kind, namespace).await? {
                let desired = workload.spec.replicas.unwrap_or(0);
                if desired == 0 {
                    continue;
                }
                let ready = workload.status.ready_replicas;
                if ready >= desired {
                    continue;
                }
                let name = &workload.metadata.name;
                insights.push(Insight {
                    analyzer: self.name().into(),
                    category: "reliability".into(),
                    severity: Severity::Warning,
                    title: format!("{kind} {name:?} has {ready}/{desired} ready"),
                    description: format!(
                        "Only {ready} of {desired} desired replicas are ready. This may indicate resource pressure, failed scheduling, or container issues."
                    ),
                    target_kind: kind.as_str().into(),
                    target_namespace: namespace.into(),
                    target_name: name.clone(),
                    fingerprint: make_fingerprint(self.name(), kind.as_str(), namespace, name),
                    proposed_action: String::new(),
                    proposed_params: Default::default(),
                    auto_remediable: false,
                });
            }
        }
        Ok(insights)
    }
}

pub struct CrashloopingAnalyzer;

#[async_trait]
impl Analyzer for CrashloopingAnalyzer {
    fn name(&self) -> &'static str {
        "crashlooping"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let pods = cluster.list_pods(namespace).await?;

        let mut insights = Vec::new();
        for pod in pods {
            for cs in &pod.status.container_statuses {
                let is_crashloop = cs
                    .state
                    .waiting
                    .as_ref()
                    .is_some_and(|w| w.reason == "CrashLoopBackOff");
                let high_restarts = cs.restart_count >= HIGH_RESTART_THRESHOLD;
                if !is_crashloop && !high_restarts {
                    continue;
                }

                // Resolve the owning workload so multiple pods of one
                // deployment collapse into one insight.
                let mut target_kind = "Pod".to_string();
                let mut target_name = pod.metadata.name.clone();
                for owner in &pod.metadata.owner_references {
                    match owner.kind.as_str() {
                        "ReplicaSet" => {
                            if let Ok(rs) = cluster.get_replica_set(namespace, &owner.name).await {
                                for rs_owner in &rs.metadata.owner_references {
                                    if rs_owner.kind == "Deployment" {
                                        target_kind = "Deployment".into();
                                        target_name = rs_owner.name.clone();
                                    }
                                }
                            }
                        }
                        "StatefulSet" | "DaemonSet" => {
                            target_kind = owner.kind.clone();
                            target_name = owner.name.clone();
                        }
                        _ => {}
                    }
                }

                let (title, description) = if is_crashloop {
                    (
                        format!("{target_kind} {target_name:?} has crashlooping pods"),
                        "One or more pods are in CrashLoopBackOff. Check logs for the root cause."
                            .to_string(),
                    )
                } else {
                    (
                        format!(
                            "{target_kind} {target_name:?} pods have {}+ restarts",
                            cs.restart_count
                        ),
                        format!(
                            "Pods have restarted {}+ times, indicating instability.",
                            cs.restart_count
                        ),
                    )
                };
                let severity = if !is_crashloop && cs.restart_count < 10 {
                    Severity::Warning
                } else {
                    Severity::Action
                };

                insights.push(Insight {
                    analyzer: self.name().into(),
                    category: "reliability".into(),
                    severity,
                    title,
                    description,
                    target_kind: target_kind.clone(),
                    target_namespace: namespace.into(),
                    target_name: target_name.clone(),
                    fingerprint: make_fingerprint(self.name(), &target_kind, namespace, &target_name),
                    proposed_action: String::new(),
                    proposed_params: Default::default(),
                    auto_remediable: false,
                });
                // One insight per pod is enough.
                break;
            }
        }

        // Multiple pods may resolve to the same workload.
        let mut seen = HashSet::new();
        insights.retain(|i| seen.insert(i.fingerprint.clone()));
        Ok(insights)
    }
}

pub struct MissingLimitsAnalyzer;

#[async_trait]
impl Analyzer for MissingLimitsAnalyzer {
    fn name(&self) -> &'static str {
        "missing_limits"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let mut insights = Vec::new();
        for &kind in WORKLOAD_KINDS {
            for workload in cluster.list_workloads(kind, namespace).await? {
                let missing: Vec<&str> = workload
                    .spec
                    .template
                    .spec
                    .containers
                    .iter()
                    .filter(|c| !c.resources.has_limit("memory"))
                    .map(|c| c.name.as_str())
                    .collect();
                if missing.is_empty() {
                    continue;
                }
                let name = &workload.metadata.name;
                insights.push(Insight {
                    analyzer: self.name().into(),
                    category: "hygiene".into(),
                    severity: Severity::Suggestion,
                    title: format!("{kind} {name:?} has no memory limits"),
                    description: format!(
                        "Container(s) {} have no memory limits. Without limits, a container can consume all available memory on the node.",
                        missing.join(", ")
                    ),
                    target_kind: kind.as_str().into(),
                    target_namespace: namespace.into(),
                    target_name: name.clone(),
                    fingerprint: make_fingerprint(self.name(), kind.as_str(), namespace, name),
                    proposed_action: "tune_resource_limits".into(),
                    proposed_params: json!({"cpu_limit": "250m", "memory_limit": "256Mi"})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    auto_remediable: false,
                });
            }
        }
        Ok(insights)
    }
}

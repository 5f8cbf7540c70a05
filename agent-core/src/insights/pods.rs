//! Pod-scoped analyzers: finished pods, stuck deletions, evictions, and
//! image pull failures.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;

use super::{make_fingerprint, Analyzer, Insight, Severity};
use crate::cluster::ClusterApi;

/// `Succeeded`/`Failed` pods older than this are clutter.
fn stale_pod_age() -> Duration {
    Duration::hours(1)
}

/// Pods deleting longer than this are stuck on a finalizer or kubelet.
fn stuck_terminating_age() -> Duration {
    Duration::minutes(10)
}

pub struct StalePodsAnalyzer;

#[async_trait]
impl Analyzer for StalePodsAnalyzer {
    fn name(&self) -> &'static str {
        "stale_pods"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let pods = cluster.list_pods(namespace).await?;
        let cutoff = Utc::now() - stale_pod_age();

        let mut insights = Vec::new();
        for pod in pods {
            let phase = pod.status.phase.as_str();
            if phase != "Succeeded" && phase != "Failed" {
                continue;
            }
            let Some(start_time) = pod.status.start_time else {
                continue;
            };
            if start_time > cutoff {
                continue;
            }

            let name = &pod.metadata.name;
            insights.push(Insight {
                analyzer: self.name().into(),
                category: "hygiene".into(),
                severity: Severity::Suggestion,
                title: format!("{phase} pod {name:?} can be cleaned up"),
                description: format!(
                    "Pod has been in {phase} state since {}. It is no longer running and can be safely deleted.",
                    start_time.to_rfc3339()
                ),
                target_kind: "Pod".into(),
                target_namespace: namespace.into(),
                target_name: name.clone(),
                fingerprint: make_fingerprint(self.name(), "Pod", namespace, name),
                proposed_action: "delete_pod".into(),
                proposed_params: json!({"pod_status": phase}).as_object().cloned().unwrap_or_default(),
                auto_remediable: true,
            });
        }
        Ok(insights)
    }
}

pub struct StuckTerminatingAnalyzer;

#[async_trait]
impl Analyzer for StuckTerminatingAnalyzer {
    fn name(&self) -> &'static str {
        "stuck_terminating"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let pods = cluster.list_pods(namespace).await?;
        let cutoff = Utc::now() - stuck_terminating_age();

        let mut insights = Vec::new();
        for pod in pods {
            let Some(deleted_at) = pod.metadata.deletion_timestamp else {
                continue;
            };
            if deleted_at > cutoff {
                continue;
            }
            let stuck_minutes = (Utc::now() - deleted_at).num_minutes();

            let name = &pod.metadata.name;
            insights.push(Insight {
                analyzer: self.name().into(),
                category: "reliability".into(),
                severity: Severity::Action,
                title: format!("Pod {name:?} stuck terminating for {stuck_minutes}min"),
                description: format!(
                    "Pod has had deletionTimestamp set since {} but has not terminated. This usually indicates a stuck finalizer or unresponsive kubelet.",
                    deleted_at.to_rfc3339()
                ),
                target_kind: "Pod".into(),
                target_namespace: namespace.into(),
                target_name: name.clone(),
                fingerprint: make_fingerprint(self.name(), "Pod", namespace, name),
                proposed_action: "force_delete_pod".into(),
                proposed_params: json!({
                    "reason": "stuck_terminating",
                    "stuck_since": deleted_at.to_rfc3339(),
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
                auto_remediable: true,
            });
        }
        Ok(insights)
    }
}

pub struct EvictedPodsAnalyzer;

#[async_trait]
impl Analyzer for EvictedPodsAnalyzer {
    fn name(&self) -> &'static str {
        "evicted_pods"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let pods = cluster.list_pods(namespace).await?;

        let mut insights = Vec::new();
        for pod in pods {
            if pod.status.reason != "Evicted" {
                continue;
            }
            let name = &pod.metadata.name;
            insights.push(Insight {
                analyzer: self.name().into(),
                category: "hygiene".into(),
                severity: Severity::Suggestion,
                title: format!("Evicted pod {name:?} can be cleaned up"),
                description: "Pod was evicted by the kubelet (usually due to node resource pressure). It is defunct and can be safely deleted.".into(),
                target_kind: "Pod".into(),
                target_namespace: namespace.into(),
                target_name: name.clone(),
                fingerprint: make_fingerprint(self.name(), "Pod", namespace, name),
                proposed_action: "delete_pod".into(),
                proposed_params: json!({"pod_status": "Evicted"}).as_object().cloned().unwrap_or_default(),
                auto_remediable: true,
            });
        }
        Ok(insights)
    }
}

pub struct ImagePullIssuesAnalyzer;

#[async_trait]
impl Analyzer for ImagePullIssuesAnalyzer {
    fn name(&self) -> &'static str {
        "image_pull_issues"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let pods = cluster.list_pods(namespace).await?;

        let mut insights = Vec::new();
        for pod in pods {
            let mut issues = Vec::new();
            let mut reason = "";
            for cs in &pod.status.container_statuses {
                if let Some(waiting) = &cs.state.waiting {
                    if waiting.reason == "ImagePullBackOff" || waiting.reason == "ErrImagePull" {
                        issues.push(format!("{} ({})", cs.name, cs.image));
                        reason = match waiting.reason.as_str() {
                            "ErrImagePull" => "ErrImagePull",
                            _ => "ImagePullBackOff",
                        };
                    }
                }
            }
            if issues.is_empty() {
                continue;
            }

            let name = &pod.metadata.name;
            insights.push(Insight {
                analyzer: self.name().into(),
                category: "reliability".into(),
                severity: Severity::Action,
                title: format!("Pod {name:?} cannot pull image"),
                description: format!(
                    "Container(s) {} are stuck in {reason}. Check the image name, tag, and registry credentials.",
                    issues.join(", ")
                ),
                target_kind: "Pod".into(),
                target_namespace: namespace.into(),
                target_name: name.clone(),
                fingerprint: make_fingerprint(self.name(), "Pod", namespace, name),
                proposed_action: String::new(),
                proposed_params: Default::default(),
                auto_remediable: false,
            });
        }
        Ok(insights)
    }
}

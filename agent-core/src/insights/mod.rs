//! Cluster insight engine.
//!
//! Analyzers are pure over the cluster snapshot: each reads only the
//! resources it needs for one namespace and returns zero or more insights
//! with deterministic fingerprints. The engine sweeps all non-excluded
//! namespaces, absorbs per-analyzer failures, deduplicates by fingerprint,
//! and orders by severity.

mod nodes;
mod pods;
mod reporter;
mod storage;
mod workloads;

pub use nodes::ResourcePressureAnalyzer;
pub use pods::{
    EvictedPodsAnalyzer, ImagePullIssuesAnalyzer, StalePodsAnalyzer, StuckTerminatingAnalyzer,
};
pub use reporter::InsightReporter;
pub use storage::StalePvAffinityAnalyzer;
pub use workloads::{
    CrashloopingAnalyzer, MissingLimitsAnalyzer, MissingProbesAnalyzer, UnreadyWorkloadsAnalyzer,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::cluster::ClusterApi;

/// Severity ordering is the sort order: actionable issues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Action,
    Warning,
    Suggestion,
    Info,
}

/// A single detected condition in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insight {
    pub analyzer: String,
    pub category: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub target_kind: String,
    pub target_namespace: String,
    pub target_name: String,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proposed_action: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub proposed_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_remediable: bool,
}

/// Stable identifier for deduplication and set-diff:
/// `hex(SHA256("analyzer:kind:namespace:name"))[..16]`.
pub fn make_fingerprint(analyzer: &str, kind: &str, namespace: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{analyzer}:{kind}:{namespace}:{name}"));
    hex::encode(&hasher.finalize()[..8])
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>>;
}

/// Namespaces skipped by default: mutating or flagging control-plane
/// workloads is never useful from this agent.
pub fn default_excluded_namespaces() -> Vec<String> {
    ["kube-system", "kube-public", "kube-node-lease"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub struct InsightEngine {
    analyzers: Vec<Box<dyn Analyzer>>,
    exclude_namespaces: HashSet<String>,
}

impl InsightEngine {
    /// Engine with all built-in analyzers.
    pub fn new(exclude_namespaces: impl IntoIterator<Item = String>) -> Self {
        Self::with_analyzers(
            vec![
                Box::new(StalePodsAnalyzer),
                Box::new(StuckTerminatingAnalyzer),
                Box::new(EvictedPodsAnalyzer),
                Box::new(StalePvAffinityAnalyzer),
                Box::new(MissingProbesAnalyzer),
                Box::new(UnreadyWorkloadsAnalyzer),
                Box::new(CrashloopingAnalyzer),
                Box::new(ResourcePressureAnalyzer),
                Box::new(ImagePullIssuesAnalyzer),
                Box::new(MissingLimitsAnalyzer),
            ],
            exclude_namespaces,
        )
    }

    pub fn with_analyzers(
        analyzers: Vec<Box<dyn Analyzer>>,
        exclude_namespaces: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            analyzers,
            exclude_namespaces: exclude_namespaces.into_iter().collect(),
        }
    }

    /// Run every analyzer across every non-excluded namespace. Analyzer
    /// failures are logged and skipped for that namespace only.
    pub async fn analyze(&self, cluster: &dyn ClusterApi) -> Vec<Insight> {
        let namespaces = match cluster.list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(error) => {
                tracing::error!(
                    target = "tb_agent::insights",
                    error = %error,
                    "failed to list namespaces for analysis"
                );
                return Vec::new();
            }
        };

        let mut insights = Vec::new();
        for namespace in &namespaces {
            let namespace = namespace.metadata.name.as_str();
            if self.exclude_namespaces.contains(namespace) {
                continue;
            }
            for analyzer in &self.analyzers {
                match analyzer.analyze(cluster, namespace).await {
                    Ok(found) => insights.extend(found),
                    Err(error) => {
                        tracing::warn!(
                            target = "tb_agent::insights",
                            analyzer = analyzer.name(),
                            namespace,
                            error = %error,
                            "analyzer failed"
                        );
                    }
                }
            }
        }

        // Cluster-scoped analyzers run once per namespace; collapse the
        // identical findings they produce.
        let mut seen = HashSet::new();
        insights.retain(|insight| seen.insert(insight.fingerprint.clone()));

        insights.sort_by_key(|insight| insight.severity);
        insights
    }
}

/// Sorted fingerprint list for a sweep's insights.
pub fn active_fingerprints(insights: &[Insight]) -> Vec<String> {
    let mut fps: Vec<String> = insights.iter().map(|i| i.fingerprint.clone()).collect();
    fps.sort();
    fps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::{ObjectMeta, Pod, PodStatus};

    #[test]
    fn fingerprint_is_deterministic_and_16_hex_chars() {
        let a = make_fingerprint("stale_pods", "Pod", "default", "web-1");
        let b = make_fingerprint("stale_pods", "Pod", "default", "web-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, make_fingerprint("stale_pods", "Pod", "default", "web-2"));
        assert_ne!(a, make_fingerprint("evicted_pods", "Pod", "default", "web-1"));
    }

    #[test]
    fn severity_sorts_action_first() {
        assert!(Severity::Action < Severity::Warning);
        assert!(Severity::Warning < Severity::Suggestion);
        assert!(Severity::Suggestion < Severity::Info);
    }

    #[test]
    fn active_fingerprints_are_sorted() {
        let mut insight = Insight {
            analyzer: "x".into(),
            category: "hygiene".into(),
            severity: Severity::Info,
            title: String::new(),
            description: String::new(),
            target_kind: "Pod".into(),
            target_namespace: "default".into(),
            target_name: "a".into(),
            fingerprint: "ffff".into(),
            proposed_action: String::new(),
            proposed_params: Map::new(),
            auto_remediable: false,
        };
        let mut other = insight.clone();
        other.fingerprint = "0000".into();
        insight.fingerprint = "ffff".into();
        assert_eq!(active_fingerprints(&[insight, other]), vec!["0000", "ffff"]);
    }

    #[tokio::test]
    async fn excluded_namespaces_are_skipped() {
        let cluster = FakeCluster::new();
        cluster.add_namespace("kube-system").add_namespace("default");
        cluster.add_pod(Pod {
            metadata: ObjectMeta {
                name: "evicted-1".into(),
                namespace: "kube-system".into(),
                ..Default::default()
            },
            status: PodStatus {
                phase: "Failed".into(),
                reason: "Evicted".into(),
                ..Default::default()
            },
            ..Default::default()
        });

        let engine = InsightEngine::new(default_excluded_namespaces());
        let insights = engine.analyze(&cluster).await;
        assert!(insights.is_empty(), "kube-system pod should be ignored: {insights:?}");
    }

    #[tokio::test]
    async fn namespace_listing_failure_yields_empty_sweep() {
        let cluster = FakeCluster::new();
        cluster.fail_with("apiserver down");
        let engine = InsightEngine::new(default_excluded_namespaces());
        assert!(engine.analyze(&cluster).await.is_empty());
    }
}

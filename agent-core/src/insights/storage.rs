//! Storage analyzer: PVCs bound to volumes pinned on vanished nodes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::{make_fingerprint, Analyzer, Insight, Severity};
use crate::cluster::{pv_hostname_affinity, ClusterApi};

pub struct StalePvAffinityAnalyzer;

#[async_trait]
impl Analyzer for StalePvAffinityAnalyzer {
    fn name(&self) -> &'static str {
        "stale_pv_affinity"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, namespace: &str) -> Result<Vec<Insight>> {
        let node_names: HashSet<String> = cluster
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| n.metadata.name)
            .collect();
        let pvcs = cluster.list_pvcs(namespace).await?;
        let pvs: HashMap<String, _> = cluster
            .list_pvs()
            .await?
            .into_iter()
            .map(|pv| (pv.metadata.name.clone(), pv))
            .collect();

        let mut insights = Vec::new();
        for pvc in pvcs {
            if pvc.spec.volume_name.is_empty() {
                continue;
            }
            let Some(pv) = pvs.get(&pvc.spec.volume_name) else {
                continue;
            };

            let affinity_nodes = pv_hostname_affinity(pv);
            if affinity_nodes.is_empty() {
                continue;
            }
            if affinity_nodes.iter().any(|n| node_names.contains(n)) {
                continue;
            }

            let name = &pvc.metadata.name;
            insights.push(Insight {
                analyzer: self.name().into(),
                category: "reliability".into(),
                severity: Severity::Action,
                title: format!("PVC {name:?} bound to PV with stale node affinity"),
                description: format!(
                    "PV {:?} has nodeAffinity to [{}] but none of these nodes exist in the cluster. Pods using this PVC cannot schedule. Delete the PVC to allow reprovisioning.",
                    pv.metadata.name,
                    affinity_nodes.join(", ")
                ),
                target_kind: "PersistentVolumeClaim".into(),
                target_namespace: namespace.into(),
                target_name: name.clone(),
                fingerprint: make_fingerprint(
                    self.name(),
                    "PersistentVolumeClaim",
                    namespace,
                    name,
                ),
                proposed_action: "delete_pvc".into(),
                proposed_params: json!({
                    "pv_name": pv.metadata.name,
                    "stale_nodes": affinity_nodes,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::{
        Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectMeta,
        PersistentVolume, PersistentVolumeClaim, PvSpec, PvcSpec, VolumeNodeAffinity,
    };

    fn pv_pinned_to(name: &str, hostname: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
            spec: PvSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: vec![NodeSelectorRequirement {
                                key: "kubernetes.io/hostname".into(),
                                operator: "In".into(),
                                values: vec![hostname.into()],
                            }],
                        }],
                    }),
                }),
            },
        }
    }

    fn pvc(namespace: &str, name: &str, volume: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec: PvcSpec {
                volume_name: volume.into(),
            },
        }
    }

    #[tokio::test]
    async fn flags_pvc_bound_to_vanished_node() {
        let cluster = FakeCluster::new();
        cluster.add_node(Node {
            metadata: ObjectMeta {
                name: "node-live".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        cluster.add_pv(pv_pinned_to("pv-orphan", "node-gone"));
        cluster.add_pv(pv_pinned_to("pv-good", "node-live"));
        cluster.add_pvc(pvc("default", "data-orphan", "pv-orphan"));
        cluster.add_pvc(pvc("default", "data-good", "pv-good"));
        cluster.add_pvc(pvc("default", "unbound", ""));

        let insights = StalePvAffinityAnalyzer.analyze(&cluster, "default").await.unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].target_name, "data-orphan");
        assert_eq!(insights[0].proposed_action, "delete_pvc");
        assert!(insights[0].description.contains("node-gone"));
        assert!(insights[0].auto_remediable);
    }

    #[tokio::test]
    async fn pv_without_affinity_is_ignored() {
        let cluster = FakeCluster::new();
        cluster.add_pv(PersistentVolume {
            metadata: ObjectMeta {
                name: "pv-any".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        cluster.add_pvc(pvc("default", "data", "pv-any"));

        let insights = StalePvAffinityAnalyzer.analyze(&cluster, "default").await.unwrap();
        assert!(insights.is_empty());
    }
}

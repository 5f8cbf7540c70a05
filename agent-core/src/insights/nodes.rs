//! Node pressure analyzer.

use anyhow::Result;
use async_trait::async_trait;

use super::{make_fingerprint, Analyzer, Insight, Severity};
use crate::cluster::ClusterApi;

pub struct ResourcePressureAnalyzer;

#[async_trait]
impl Analyzer for ResourcePressureAnalyzer {
    fn name(&self) -> &'static str {
        "resource_pressure"
    }

    async fn analyze(&self, cluster: &dyn ClusterApi, _namespace: &str) -> Result<Vec<Insight>> {
        let nodes = cluster.list_nodes().await?;

        let mut insights = Vec::new();
        for node in nodes {
            let name = &node.metadata.name;
            for cond in &node.status.conditions {
                if cond.status != "True" {
                    continue;
                }
                // Per-condition analyzer keys keep the fingerprints distinct
                // when one node is under several kinds of pressure.
                let (fp_key, pressure, severity) = match cond.condition_type.as_str() {
                    "MemoryPressure" => ("resource_pressure_mem", "memory", Severity::Action),
                    "DiskPressure" => ("resource_pressure_disk", "disk", Severity::Action),
                    "PIDPressure" => ("resource_pressure_pid", "PID", Severity::Warning),
                    _ => continue,
                };

                insights.push(Insight {
                    analyzer: self.name().into(),
                    category: "performance".into(),
                    severity,
                    title: format!("Node {name:?} under {pressure} pressure"),
                    description: format!(
                        "Node has {} condition. Message: {}",
                        cond.condition_type, cond.message
                    ),
                    target_kind: "Node".into(),
                    target_namespace: String::new(),
                    target_name: name.clone(),
                    fingerprint: make_fingerprint(fp_key, "Node", "", name),
                    proposed_action: String::new(),
                    proposed_params: Default::default(),
                    auto_remediable: false,
                });
            }
        }
        Ok(insights)
    }
}

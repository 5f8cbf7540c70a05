//! Dispatch of approved cluster mutations.
//!
//! Commands arrive either over the gateway (signed frames of type
//! `command`) or from the HTTP poll endpoint. The action set is closed;
//! anything else returns a structured "unknown action" failure. API errors
//! become failed results, never panics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cluster::{ClusterApi, WorkloadKind};

/// Defaults patched in by `tune_resource_limits` when parameters omit them.
const DEFAULT_CPU_LIMIT: &str = "250m";
const DEFAULT_MEMORY_LIMIT: &str = "256Mi";

/// An approved command from the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub target_kind: String,
    #[serde(default)]
    pub target_namespace: String,
    #[serde(default)]
    pub target_name: String,
    /// Forward-compatible parameter map; new actions add keys without
    /// changing the wire contract.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        CommandResult {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        CommandResult {
            success: false,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        if let Value::Object(map) = details {
            self.details = Some(map);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

pub struct Executor {
    cluster: Arc<dyn ClusterApi>,
}

impl Executor {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn execute(&self, cmd: &Command) -> CommandResult {
        tracing::info!(
            target = "tb_agent::commands",
            id = %cmd.id,
            action = %cmd.action,
            kind = %cmd.target_kind,
            ns = %cmd.target_namespace,
            name = %cmd.target_name,
            "executing command"
        );

        let result = match cmd.action.as_str() {
            "delete_pod" => self.delete_pod(cmd, None).await,
            "force_delete_pod" => self.delete_pod(cmd, Some(0)).await,
            "restart_deployment" => self.restart_deployment(cmd).await,
            "scale" => self.scale(cmd).await,
            "delete_deployment" => self.delete_deployment(cmd).await,
            "delete_pvc" => self.delete_pvc(cmd).await,
            "cordon_node" => self.set_cordon(cmd, true).await,
            "uncordon_node" => self.set_cordon(cmd, false).await,
            "tune_resource_limits" => self.tune_resource_limits(cmd).await,
            other => CommandResult::fail(format!("unknown action: {other}")),
        };

        tracing::info!(
            target = "tb_agent::commands",
            id = %cmd.id,
            success = result.success,
            message = %result.message,
            "command result"
        );
        result
    }

    async fn delete_pod(&self, cmd: &Command, grace: Option<i64>) -> CommandResult {
        match self
            .cluster
            .delete_pod(&cmd.target_namespace, &cmd.target_name, grace)
            .await
        {
            Ok(()) if grace == Some(0) => CommandResult::ok(format!(
                "Pod {}/{} force-deleted (gracePeriod=0)",
                cmd.target_namespace, cmd.target_name
            )),
            Ok(()) => CommandResult::ok(format!(
                "Pod {}/{} deleted",
                cmd.target_namespace, cmd.target_name
            )),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    async fn restart_deployment(&self, cmd: &Command) -> CommandResult {
        let restarted_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let patch = json!({
            "spec": {"template": {"metadata": {"annotations": {
                "kubectl.kubernetes.io/restartedAt": restarted_at,
            }}}}
        });
        match self
            .cluster
            .patch_workload(
                WorkloadKind::Deployment,
                &cmd.target_namespace,
                &cmd.target_name,
                patch,
            )
            .await
        {
            Ok(()) => CommandResult::ok(format!(
                "Deployment {}/{} restarted (rollout triggered at {restarted_at})",
                cmd.target_namespace, cmd.target_name
            )),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    async fn scale(&self, cmd: &Command) -> CommandResult {
        let Some(raw) = cmd.parameters.get("replicas") else {
            return CommandResult::fail("missing 'replicas' parameter");
        };
        let Some(replicas) = raw.as_i64() else {
            return CommandResult::fail(format!("invalid replicas value: {raw}"));
        };
        if replicas < 0 || replicas > i32::MAX as i64 {
            return CommandResult::fail(format!("invalid replicas value: {replicas}"));
        }
        let new_replicas = replicas as i32;

        let old_replicas = match self
            .cluster
            .get_scale(&cmd.target_namespace, &cmd.target_name)
            .await
        {
            Ok(current) => current,
            Err(err) => return CommandResult::fail(err.to_string()),
        };
        if let Err(err) = self
            .cluster
            .update_scale(&cmd.target_namespace, &cmd.target_name, new_replicas)
            .await
        {
            return CommandResult::fail(err.to_string());
        }

        CommandResult::ok(format!(
            "Deployment {}/{} scaled from {old_replicas} to {new_replicas}",
            cmd.target_namespace, cmd.target_name
        ))
        .with_details(json!({
            "old_replicas": old_replicas,
            "new_replicas": new_replicas,
        }))
    }

    async fn delete_deployment(&self, cmd: &Command) -> CommandResult {
        match self
            .cluster
            .delete_workload(
                WorkloadKind::Deployment,
                &cmd.target_namespace,
                &cmd.target_name,
            )
            .await
        {
            Ok(()) => CommandResult::ok(format!(
                "Deployment {}/{} deleted",
                cmd.target_namespace, cmd.target_name
            )),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    async fn delete_pvc(&self, cmd: &Command) -> CommandResult {
        match self
            .cluster
            .delete_pvc(&cmd.target_namespace, &cmd.target_name)
            .await
        {
            Ok(()) => CommandResult::ok(format!(
                "PVC {}/{} deleted",
                cmd.target_namespace, cmd.target_name
            )),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    async fn set_cordon(&self, cmd: &Command, cordon: bool) -> CommandResult {
        let patch = json!({"spec": {"unschedulable": cordon}});
        match self.cluster.patch_node(&cmd.target_name, patch).await {
            Ok(()) => CommandResult::ok(format!(
                "Node {} {}",
                cmd.target_name,
                if cordon { "cordoned" } else { "uncordoned" }
            )),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    /// Patch default limits into containers that lack them; containers that
    /// already carry both limits are left untouched.
    async fn tune_resource_limits(&self, cmd: &Command) -> CommandResult {
        let Some(kind) = WorkloadKind::parse(&cmd.target_kind) else {
            return CommandResult::fail(format!("unsupported kind: {}", cmd.target_kind));
        };

        let cpu_limit = cmd
            .parameters
            .get("cpu_limit")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CPU_LIMIT);
        let memory_limit = cmd
            .parameters
            .get("memory_limit")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_MEMORY_LIMIT);

        let workload = match self
            .cluster
            .get_workload(kind, &cmd.target_namespace, &cmd.target_name)
            .await
        {
            Ok(w) => w,
            Err(err) => return CommandResult::fail(err.to_string()),
        };

        let mut containers = Vec::new();
        for container in &workload.spec.template.spec.containers {
            let has_memory = container.resources.has_limit("memory");
            let has_cpu = container.resources.has_limit("cpu");
            if has_memory && has_cpu {
                continue;
            }
            let mut limits = Map::new();
            if !has_memory {
                limits.insert("memory".into(), memory_limit.into());
            }
            if !has_cpu {
                limits.insert("cpu".into(), cpu_limit.into());
            }
            containers.push(json!({
                "name": container.name,
                "resources": {"limits": limits},
            }));
        }

        if containers.is_empty() {
            return CommandResult::ok(format!(
                "{kind} {}/{} already has all resource limits set",
                cmd.target_namespace, cmd.target_name
            ));
        }
        let patched = containers.len();

        let patch = json!({
            "spec": {"template": {"spec": {"containers": containers}}}
        });
        if let Err(err) = self
            .cluster
            .patch_workload(kind, &cmd.target_namespace, &cmd.target_name, patch)
            .await
        {
            return CommandResult::fail(err.to_string());
        }

        CommandResult::ok(format!(
            "{kind} {}/{} limits set (cpu={cpu_limit}, memory={memory_limit}) for {patched} container(s)",
            cmd.target_namespace, cmd.target_name
        ))
        .with_details(json!({
            "patched_containers": patched,
            "cpu_limit": cpu_limit,
            "memory_limit": memory_limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::{
        Container, ObjectMeta, PodSpec, PodTemplateSpec, ResourceRequirements, Workload,
        WorkloadSpec,
    };

    fn command(action: &str, kind: &str, namespace: &str, name: &str) -> Command {
        Command {
            id: "cmd-1".into(),
            action: action.into(),
            target_kind: kind.into(),
            target_namespace: namespace.into(),
            target_name: name.into(),
            parameters: Map::new(),
        }
    }

    fn workload_with_containers(namespace: &str, name: &str, containers: Vec<Container>) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec: WorkloadSpec {
                replicas: Some(1),
                template: PodTemplateSpec {
                    spec: PodSpec {
                        containers,
                        ..Default::default()
                    },
                },
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delete_pod_and_force_delete_use_grace_period() {
        let cluster = Arc::new(FakeCluster::new());
        let executor = Executor::new(cluster.clone());

        let result = executor.execute(&command("delete_pod", "Pod", "default", "web-1")).await;
        assert!(result.success);
        assert_eq!(result.message, "Pod default/web-1 deleted");

        let result = executor
            .execute(&command("force_delete_pod", "Pod", "default", "web-2"))
            .await;
        assert!(result.success);
        assert_eq!(result.message, "Pod default/web-2 force-deleted (gracePeriod=0)");

        assert_eq!(
            cluster.deleted_pods(),
            vec![
                ("default".to_string(), "web-1".to_string(), None),
                ("default".to_string(), "web-2".to_string(), Some(0)),
            ]
        );
    }

    #[tokio::test]
    async fn scale_validates_and_reports_old_and_new() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_scale("default", "api", 3);
        let executor = Executor::new(cluster.clone());

        let mut cmd = command("scale", "Deployment", "default", "api");
        let result = executor.execute(&cmd).await;
        assert!(!result.success);
        assert_eq!(result.message, "missing 'replicas' parameter");

        cmd.parameters.insert("replicas".into(), json!(-2));
        let result = executor.execute(&cmd).await;
        assert!(!result.success);
        assert!(result.message.contains("invalid replicas value"));

        cmd.parameters.insert("replicas".into(), json!(5));
        let result = executor.execute(&cmd).await;
        assert!(result.success);
        assert_eq!(result.message, "Deployment default/api scaled from 3 to 5");
        assert_eq!(cluster.scale("default", "api"), Some(5));
        let details = result.details.unwrap();
        assert_eq!(details["old_replicas"], json!(3));
        assert_eq!(details["new_replicas"], json!(5));
    }

    #[tokio::test]
    async fn restart_deployment_patches_restarted_at_annotation() {
        let cluster = Arc::new(FakeCluster::new());
        let executor = Executor::new(cluster.clone());

        let result = executor
            .execute(&command("restart_deployment", "Deployment", "default", "api"))
            .await;
        assert!(result.success);

        let patches = cluster.workload_patches();
        assert_eq!(patches.len(), 1);
        let annotation = patches[0]
            .3
            .pointer("/spec/template/metadata/annotations/kubectl.kubernetes.io~1restartedAt");
        assert!(annotation.is_some());
    }

    #[tokio::test]
    async fn cordon_and_uncordon_patch_unschedulable() {
        let cluster = Arc::new(FakeCluster::new());
        let executor = Executor::new(cluster.clone());

        let result = executor.execute(&command("cordon_node", "Node", "", "node-a")).await;
        assert_eq!(result.message, "Node node-a cordoned");
        let result = executor
            .execute(&command("uncordon_node", "Node", "", "node-a"))
            .await;
        assert_eq!(result.message, "Node node-a uncordoned");

        let patches = cluster.node_patches();
        assert_eq!(patches[0].1.pointer("/spec/unschedulable"), Some(&json!(true)));
        assert_eq!(patches[1].1.pointer("/spec/unschedulable"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn tune_limits_patches_only_unlimited_containers() {
        let cluster = Arc::new(FakeCluster::new());
        let mut limited = ResourceRequirements::default();
        limited.limits.insert("memory".into(), "512Mi".into());
        limited.limits.insert("cpu".into(), "500m".into());
        cluster.add_workload(
            WorkloadKind::Deployment,
            workload_with_containers(
                "default",
                "api",
                vec![
                    Container {
                        name: "app".into(),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".into(),
                        resources: limited,
                        ..Default::default()
                    },
                ],
            ),
        );
        let executor = Executor::new(cluster.clone());

        let result = executor
            .execute(&command("tune_resource_limits", "Deployment", "default", "api"))
            .await;
        assert!(result.success);
        assert!(result.message.contains("for 1 container(s)"));

        let patches = cluster.workload_patches();
        let containers = patches[0].3.pointer("/spec/template/spec/containers").unwrap();
        assert_eq!(containers.as_array().unwrap().len(), 1);
        assert_eq!(containers[0]["name"], "app");
        assert_eq!(containers[0]["resources"]["limits"]["memory"], "256Mi");
        assert_eq!(containers[0]["resources"]["limits"]["cpu"], "250m");
    }

    #[tokio::test]
    async fn tune_limits_no_op_when_everything_limited() {
        let cluster = Arc::new(FakeCluster::new());
        let mut limited = ResourceRequirements::default();
        limited.limits.insert("memory".into(), "512Mi".into());
        limited.limits.insert("cpu".into(), "500m".into());
        cluster.add_workload(
            WorkloadKind::StatefulSet,
            workload_with_containers(
                "default",
                "db",
                vec![Container {
                    name: "postgres".into(),
                    resources: limited,
                    ..Default::default()
                }],
            ),
        );
        let executor = Executor::new(cluster.clone());

        let result = executor
            .execute(&command("tune_resource_limits", "StatefulSet", "default", "db"))
            .await;
        assert!(result.success);
        assert!(result.message.contains("already has all resource limits set"));
        assert!(cluster.workload_patches().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_structured_failure() {
        let executor = Executor::new(Arc::new(FakeCluster::new()));
        let result = executor.execute(&command("drain_node", "Node", "", "node-a")).await;
        assert!(!result.success);
        assert_eq!(result.message, "unknown action: drain_node");
    }

    #[tokio::test]
    async fn api_errors_become_failed_results() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_with("connection refused");
        let executor = Executor::new(cluster);

        let result = executor.execute(&command("delete_pod", "Pod", "default", "web")).await;
        assert!(!result.success);
        assert!(result.message.contains("connection refused"));
    }
}

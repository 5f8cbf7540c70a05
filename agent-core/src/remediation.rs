//! Bounded auto-remediation.
//!
//! Auto-remediable insights pass through an action allowlist and a
//! two-level rate limiter before anything executes: a sliding one-hour
//! window caps total remediations (a safety net against a systemic false
//! positive), and a per-resource cooldown stops the agent from hammering
//! one troubled resource while still allowing remediation of others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterApi;
use crate::insights::Insight;

/// Sliding window width for the global limit.
const WINDOW: Duration = Duration::from_secs(60 * 60);
/// Default cap on remediations per window.
pub const DEFAULT_MAX_PER_HOUR: usize = 5;
/// Default per-resource cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// The complete set of actions auto-remediation may execute. Analyzers may
/// propose anything; everything else is reported but never run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationAction {
    DeletePod,
    ForceDeletePod,
    DeletePvc,
}

impl RemediationAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "delete_pod" => Some(Self::DeletePod),
            "force_delete_pod" => Some(Self::ForceDeletePod),
            "delete_pvc" => Some(Self::DeletePvc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeletePod => "delete_pod",
            Self::ForceDeletePod => "force_delete_pod",
            Self::DeletePvc => "delete_pvc",
        }
    }
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sliding-window plus per-resource rate limiter.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    max_per_hour: usize,
    cooldown: Duration,
}

#[derive(Default)]
struct BreakerState {
    recent: Vec<Instant>,
    resource_cooldowns: HashMap<String, Instant>,
}

fn resource_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

impl CircuitBreaker {
    pub fn new(max_per_hour: usize, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            max_per_hour,
            cooldown,
        }
    }

    /// True when the window already holds `max_per_hour` remediations.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(cutoff) = Instant::now().checked_sub(WINDOW) {
            state.recent.retain(|t| *t > cutoff);
        }
        state.recent.len() >= self.max_per_hour
    }

    /// True when this specific resource was remediated within the cooldown.
    pub fn is_on_cooldown(&self, kind: &str, namespace: &str, name: &str) -> bool {
        let state = self.state.lock();
        state
            .resource_cooldowns
            .get(&resource_key(kind, namespace, name))
            .is_some_and(|last| last.elapsed() < self.cooldown)
    }

    /// Note a successful remediation for rate limiting.
    pub fn record(&self, kind: &str, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.recent.push(now);
        state
            .resource_cooldowns
            .insert(resource_key(kind, namespace, name), now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationResult {
    pub action: String,
    pub target_kind: String,
    pub target_namespace: String,
    pub target_name: String,
    pub insight_fingerprint: String,
    pub reason: String,
    pub success: bool,
    pub message: String,
    pub dry_run: bool,
}

/// Executes auto-remediable insights under the breaker's limits.
pub struct Remediator {
    cluster: Arc<dyn ClusterApi>,
    breaker: Arc<CircuitBreaker>,
    dry_run: bool,
}

impl Remediator {
    pub fn new(cluster: Arc<dyn ClusterApi>, breaker: Arc<CircuitBreaker>, dry_run: bool) -> Self {
        Self {
            cluster,
            breaker,
            dry_run,
        }
    }

    /// Process a sweep's insights in order and return the results.
    pub async fn remediate(&self, insights: &[Insight]) -> Vec<RemediationResult> {
        let mut results = Vec::new();

        for insight in insights {
            if !insight.auto_remediable {
                continue;
            }
            let Some(action) = RemediationAction::parse(&insight.proposed_action) else {
                continue;
            };

            if self.breaker.is_open() {
                tracing::warn!(
                    target = "tb_agent::remediation",
                    "circuit breaker open, skipping remaining remediations"
                );
                break;
            }
            if self.breaker.is_on_cooldown(
                &insight.target_kind,
                &insight.target_namespace,
                &insight.target_name,
            ) {
                tracing::debug!(
                    target = "tb_agent::remediation",
                    kind = %insight.target_kind,
                    ns = %insight.target_namespace,
                    name = %insight.target_name,
                    "resource on cooldown, skipping"
                );
                continue;
            }

            let result = self.execute(action, insight).await;
            if result.success && !self.dry_run {
                self.breaker.record(
                    &insight.target_kind,
                    &insight.target_namespace,
                    &insight.target_name,
                );
            }
            results.push(result);
        }

        if !results.is_empty() {
            let succeeded = results.iter().filter(|r| r.success).count();
            tracing::info!(
                target = "tb_agent::remediation",
                succeeded,
                failed = results.len() - succeeded,
                dry_run = self.dry_run,
                "remediation complete"
            );
        }
        results
    }

    async fn execute(&self, action: RemediationAction, insight: &Insight) -> RemediationResult {
        let mut result = RemediationResult {
            action: action.as_str().into(),
            target_kind: insight.target_kind.clone(),
            target_namespace: insight.target_namespace.clone(),
            target_name: insight.target_name.clone(),
            insight_fingerprint: insight.fingerprint.clone(),
            reason: insight.title.clone(),
            success: false,
            message: String::new(),
            dry_run: self.dry_run,
        };

        if self.dry_run {
            tracing::info!(
                target = "tb_agent::remediation",
                action = %action,
                kind = %insight.target_kind,
                ns = %insight.target_namespace,
                name = %insight.target_name,
                "[DRY RUN] would execute"
            );
            result.success = true;
            result.message = format!("[DRY RUN] {action} skipped");
            return result;
        }

        let namespace = &insight.target_namespace;
        let name = &insight.target_name;
        let outcome = match action {
            RemediationAction::DeletePod => self.cluster.delete_pod(namespace, name, None).await,
            RemediationAction::ForceDeletePod => {
                self.cluster.delete_pod(namespace, name, Some(0)).await
            }
            RemediationAction::DeletePvc => self.cluster.delete_pvc(namespace, name).await,
        };

        match outcome {
            Ok(()) => {
                result.success = true;
                result.message = format!("auto-remediated: {action} {namespace}/{name}");
                tracing::info!(
                    target = "tb_agent::remediation",
                    action = %action,
                    ns = %namespace,
                    name = %name,
                    "remediated"
                );
            }
            Err(error) => {
                result.message = format!("failed to {action} {namespace}/{name}: {error}");
                tracing::error!(
                    target = "tb_agent::remediation",
                    action = %action,
                    error = %error,
                    "remediation failed"
                );
            }
        }
        result
    }
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    agent_token: &'a str,
    remediations: &'a [RemediationResult],
}

/// Uploads remediation results to an upstream.
pub struct RemediationReporter {
    base_url: String,
    token: String,
    anon_key: String,
    http: reqwest::Client,
}

impl RemediationReporter {
    pub fn new(base_url: &str, token: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            anon_key: anon_key.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client"),
        }
    }

    pub async fn report(&self, results: &[RemediationResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut req = self
            .http
            .post(format!(
                "{}/functions/v1/cluster-remediations/report",
                self.base_url
            ))
            .header("Content-Type", "application/json");
        if !self.anon_key.is_empty() {
            req = req
                .header("Authorization", format!("Bearer {}", self.anon_key))
                .header("apikey", &self.anon_key);
        }

        let resp = req
            .json(&ReportRequest {
                agent_token: &self.token,
                remediations: results,
            })
            .send()
            .await
            .context("remediation report request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("report failed (HTTP {status}): {body}");
        }
        tracing::info!(
            target = "tb_agent::remediation",
            count = results.len(),
            "remediation results reported"
        );
        Ok(())
    }
}

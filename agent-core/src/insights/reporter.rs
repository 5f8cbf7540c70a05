//! Incremental insight sync.
//!
//! The reporter remembers the fingerprint set of the last successful sync.
//! An unchanged sweep skips the upload entirely; the control plane uses the
//! fingerprint set of each sync to auto-close insights no longer present.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{active_fingerprints, Insight};

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    agent_token: &'a str,
    insights: &'a [Insight],
    active_fingerprints: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub upserted: i64,
    #[serde(default)]
    pub auto_resolved: i64,
}

pub struct InsightReporter {
    base_url: String,
    token: String,
    anon_key: String,
    http: reqwest::Client,
    last_fingerprints: Mutex<Option<String>>,
}

impl InsightReporter {
    pub fn new(base_url: &str, token: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            anon_key: anon_key.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client"),
            last_fingerprints: Mutex::new(None),
        }
    }

    /// Upload a sweep. Returns true if the upload was performed, false when
    /// it was skipped because the fingerprint set is unchanged.
    pub async fn report(&self, insights: &[Insight]) -> Result<bool> {
        let fingerprints = active_fingerprints(insights);
        let key = fingerprints.join(",");
        if self.last_fingerprints.lock().as_deref() == Some(key.as_str()) {
            tracing::debug!(
                target = "tb_agent::insights",
                count = insights.len(),
                "insights unchanged, skipping sync"
            );
            return Ok(false);
        }

        let mut req = self
            .http
            .post(format!("{}/functions/v1/cluster-insights/sync", self.base_url))
            .header("Content-Type", "application/json");
        if !self.anon_key.is_empty() {
            req = req
                .header("Authorization", format!("Bearer {}", self.anon_key))
                .header("apikey", &self.anon_key);
        }

        let resp = req
            .json(&SyncRequest {
                agent_token: &self.token,
                insights,
                active_fingerprints: &fingerprints,
            })
            .send()
            .await
            .context("insight sync request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("sync failed (HTTP {status}): {body}");
        }
        let result: SyncResponse = resp.json().await.context("parse sync response")?;

        *self.last_fingerprints.lock() = Some(key);
        tracing::info!(
            target = "tb_agent::insights",
            upserted = result.upserted,
            auto_resolved = result.auto_resolved,
            "insights synced"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{make_fingerprint, Severity};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn insight(name: &str) -> Insight {
        Insight {
            analyzer: "stale_pods".into(),
            category: "hygiene".into(),
            severity: Severity::Suggestion,
            title: format!("pod {name} is stale"),
            description: String::new(),
            target_kind: "Pod".into(),
            target_namespace: "default".into(),
            target_name: name.into(),
            fingerprint: make_fingerprint("stale_pods", "Pod", "default", name),
            proposed_action: "delete_pod".into(),
            proposed_params: Default::default(),
            auto_remediable: true,
        }
    }

    #[tokio::test]
    async fn identical_sweeps_sync_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/cluster-insights/sync"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"upserted": 1, "auto_resolved": 0})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reporter = InsightReporter::new(&server.uri(), "tok", "anon");
        let sweep = vec![insight("web-1")];
        assert!(reporter.report(&sweep).await.unwrap());
        assert!(!reporter.report(&sweep).await.unwrap());
    }

    #[tokio::test]
    async fn changed_fingerprint_set_triggers_sync() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/cluster-insights/sync"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"upserted": 1, "auto_resolved": 0})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let reporter = InsightReporter::new(&server.uri(), "tok", "anon");
        assert!(reporter.report(&[insight("web-1")]).await.unwrap());
        assert!(reporter
            .report(&[insight("web-1"), insight("web-2")])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_sync_does_not_update_last_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/cluster-insights/sync"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let reporter = InsightReporter::new(&server.uri(), "tok", "anon");
        let sweep = vec![insight("web-1")];
        assert!(reporter.report(&sweep).await.is_err());
        // The set was not recorded, so the retry still uploads.
        assert!(reporter.report(&sweep).await.is_err());
    }

    #[tokio::test]
    async fn empty_sweep_still_syncs_to_auto_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/functions/v1/cluster-insights/sync"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"upserted": 0, "auto_resolved": 3})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let reporter = InsightReporter::new(&server.uri(), "tok", "anon");
        assert!(reporter.report(&[insight("web-1")]).await.unwrap());
        assert!(reporter.report(&[]).await.unwrap());
        assert!(!reporter.report(&[]).await.unwrap());
    }
}

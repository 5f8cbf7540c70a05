//! Scan report upload: a single-upstream client and the multi-upstream
//! fan-out.
//!
//! Every configured upstream receives an independent copy of every report,
//! with its own token substituted. Success is "at least one upstream
//! returned 2xx"; individual failures are logged with the upstream's name
//! and never block the others.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Upstream;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestMeta {
    pub version: String,
    pub duration_ms: u64,
    pub phases: Vec<String>,
    pub source_host: String,
}

/// Request body for `POST {base}/functions/v1/edge-ingest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    pub agent_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Value>,
    pub meta: IngestMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub resource_count: i64,
    #[serde(default)]
    pub phases: Vec<String>,
}

/// Client for one ingest upstream.
pub struct UploadClient {
    base_url: String,
    token: String,
    anon_key: String,
    http: reqwest::Client,
}

impl UploadClient {
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

    pub async fn upload(&self, req: &IngestRequest) -> Result<IngestResponse> {
        // This upstream's own token, regardless of what the caller built.
        let mut req = req.clone();
        req.agent_token = self.token.clone();

        let mut http_req = self
            .http
            .post(format!("{}/functions/v1/edge-ingest", self.base_url))
            .header("Content-Type", "application/json");
        if !self.anon_key.is_empty() {
            http_req = http_req
                .header("Authorization", format!("Bearer {}", self.anon_key))
                .header("apikey", &self.anon_key);
        }

        let resp = http_req.json(&req).send().await.context("ingest request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("ingest failed (HTTP {status}): {body}");
        }
        resp.json().await.context("parse ingest response")
    }
}

/// Parallel fan-out to every configured upstream.
pub struct MultiUploader {
    upstreams: Vec<(String, UploadClient)>,
}

impl MultiUploader {
    pub fn new(upstreams: &[Upstream]) -> Self {
        Self {
            upstreams: upstreams
                .iter()
                .map(|u| {
                    (
                        u.name.clone(),
                        UploadClient::new(&u.url, &u.token, &u.anon_key),
                    )
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Upload to all upstreams concurrently; returns the first successful
    /// response. Fails only when every upstream fails.
    pub async fn upload(&self, req: &IngestRequest) -> Result<IngestResponse> {
        if self.upstreams.is_empty() {
            bail!("no upstreams configured");
        }

        let uploads = self
            .upstreams
            .iter()
            .map(|(name, client)| async move { (name.as_str(), client.upload(req).await) });
        let outcomes = futures_util::future::join_all(uploads).await;

        let mut first_response = None;
        let mut errors = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(resp) => {
                    tracing::info!(
                        target = "tb_agent::upload",
                        upstream = name,
                        session_id = %resp.session_id,
                        cluster_id = %resp.cluster_id,
                        resources = resp.resource_count,
                        "uploaded"
                    );
                    if first_response.is_none() {
                        first_response = Some(resp);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "tb_agent::upload",
                        upstream = name,
                        error = %error,
                        "upstream upload failed"
                    );
                    errors.push(format!("{name}: {error}"));
                }
            }
        }

        match first_response {
            Some(resp) => Ok(resp),
            None => bail!("all upstreams failed: {}", errors.join("; ")),
        }
    }
}

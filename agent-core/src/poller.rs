//! HTTP command poll / complete against the control plane.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::commands::{Command, CommandResult, CompletionStatus};

#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    agent_token: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct PollResponse {
    #[serde(default)]
    commands: Vec<Command>,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    agent_token: &'a str,
    command_id: &'a str,
    status: CompletionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

/// Fetches approved commands and acknowledges their results.
pub struct CommandPoller {
    base_url: String,
    token: String,
    anon_key: String,
    http: reqwest::Client,
}

impl CommandPoller {
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

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        if !self.anon_key.is_empty() {
            req = req
                .header("Authorization", format!("Bearer {}", self.anon_key))
                .header("apikey", &self.anon_key);
        }
        req
    }

    /// Fetch approved commands. A 404 means the function is not deployed on
    /// this upstream yet and is not an error.
    pub async fn poll(&self) -> Result<Vec<Command>> {
        let resp = self
            .post("/functions/v1/cluster-commands/poll")
            .json(&PollRequest {
                agent_token: &self.token,
            })
            .send()
            .await
            .context("command poll request")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("poll failed (HTTP {status}): {body}");
        }

        let result: PollResponse = resp.json().await.context("parse poll response")?;
        if !result.commands.is_empty() {
            tracing::info!(
                target = "tb_agent::commands",
                count = result.commands.len(),
                "commands polled"
            );
        }
        Ok(result.commands)
    }

    /// Acknowledge one command's outcome.
    pub async fn complete(
        &self,
        command_id: &str,
        status: CompletionStatus,
        result: Option<&CommandResult>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let resp = self
            .post("/functions/v1/cluster-commands/complete")
            .json(&CompleteRequest {
                agent_token: &self.token,
                command_id,
                status,
                result,
                error_message,
            })
            .send()
            .await
            .context("command complete request")?;

        let http_status = resp.status();
        if !http_status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("complete failed (HTTP {http_status}): {body}");
        }
        Ok(())
    }
}

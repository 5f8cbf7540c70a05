use anyhow::{bail, Result};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default cap on concurrent terminal sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default idle timeout before a terminal session is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Permissions an agent may be granted.
pub const PERMISSION_SCAN: &str = "scan";
pub const PERMISSION_TERMINAL: &str = "terminal";

/// A single SaaS target (staging, production, a partner mirror, ...).
/// Matches the `TB_UPSTREAMS` JSON format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub url: String,
    pub token: String,
    #[serde(rename = "anonKey")]
    pub anon_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// Parse a JSON array of upstream configs (the `TB_UPSTREAMS` value).
pub fn parse_upstreams(data: &str) -> Result<Vec<Upstream>> {
    let upstreams: Vec<Upstream> = serde_json::from_str(data)?;
    Ok(upstreams)
}

/// Immutable agent identity, created once at startup.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Opaque authentication token presented to the gateway and upstreams.
    pub token: String,
    /// Identifier used in heartbeats and session authorization checks.
    pub host_id: String,
    pub cluster_id: String,
    pub gateway_url: String,
    pub upstreams: Vec<Upstream>,
    permissions: HashSet<String>,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    /// Control-plane verification key. When absent, inbound frames are
    /// dispatched without signature checks (gateway-trusted mode).
    pub verifying_key: Option<VerifyingKey>,
}

impl AgentIdentity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: String,
        host_id: String,
        cluster_id: String,
        gateway_url: String,
        upstreams: Vec<Upstream>,
        permissions: impl IntoIterator<Item = String>,
        max_sessions: Option<usize>,
        idle_timeout: Option<Duration>,
        verifying_key: Option<VerifyingKey>,
    ) -> Result<Self> {
        let permissions: HashSet<String> = permissions.into_iter().collect();
        for p in &permissions {
            if p != PERMISSION_SCAN && p != PERMISSION_TERMINAL {
                bail!("unknown permission {p:?} (valid: scan, terminal)");
            }
        }
        Ok(Self {
            token,
            host_id,
            cluster_id,
            gateway_url,
            upstreams,
            permissions,
            max_sessions: max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
            idle_timeout: idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            verifying_key,
        })
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_list() {
        let raw = r#"[
            {"name":"prod","url":"https://prod.example.dev","token":"tok_p","anonKey":"anon_p"},
            {"name":"staging","url":"https://staging.example.dev","token":"tok_s","anonKey":"anon_s","permissions":["scan"]}
        ]"#;
        let upstreams = parse_upstreams(raw).unwrap();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams[0].name, "prod");
        assert_eq!(upstreams[1].permissions, vec!["scan"]);
    }

    #[test]
    fn rejects_unknown_permission() {
        let err = AgentIdentity::new(
            "tok".into(),
            "h1".into(),
            "c1".into(),
            String::new(),
            vec![],
            ["root".to_string()],
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown permission"));
    }

    #[test]
    fn defaults_applied() {
        let id = AgentIdentity::new(
            "tok".into(),
            "h1".into(),
            "c1".into(),
            String::new(),
            vec![],
            ["terminal".to_string()],
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(id.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(id.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(id.has_permission("terminal"));
        assert!(!id.has_permission("scan"));
    }
}

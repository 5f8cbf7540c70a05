//! Gateway wire protocol: message types and terminal-target validation.
//!
//! All frames are JSON text. Inbound messages may additionally carry the
//! signing envelope fields (`signature`, `timestamp`, `nonce`, `user_id`,
//! `origin`); those are stripped by the verifier before these structs are
//! decoded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

pub const TYPE_SESSION_OPEN: &str = "session.open";
pub const TYPE_SESSION_CLOSE: &str = "session.close";
pub const TYPE_SESSION_READY: &str = "session.ready";
pub const TYPE_SESSION_ERROR: &str = "session.error";
pub const TYPE_PTY_INPUT: &str = "pty.input";
pub const TYPE_PTY_OUTPUT: &str = "pty.output";
pub const TYPE_PTY_RESIZE: &str = "pty.resize";
pub const TYPE_HEARTBEAT: &str = "agent.heartbeat";
pub const TYPE_COMMAND: &str = "command";

/// First-pass decode to determine the message type.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionOpenMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "hostId", default)]
    pub host_id: String,
    #[serde(rename = "clusterId", default)]
    pub cluster_id: String,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
    #[serde(default)]
    pub target: Option<TerminalTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCloseMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyInputMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyResizeMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Outbound frames, serialized with their `type` tag.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "session.ready")]
    SessionReady {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    #[serde(rename = "pty.output")]
    PtyOutput {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Base64-encoded PTY bytes; terminal output is not guaranteed UTF-8.
        data: String,
    },
    #[serde(rename = "agent.heartbeat")]
    Heartbeat {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "clusterId")]
        cluster_id: String,
        timestamp: i64,
    },
}

/// Where a terminal session attaches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalTarget {
    /// One of "host", "lima", "docker", "k8s-pod".
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub namespace: String,
    /// Lima VM name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shell: String,
    /// Container runtime binary: "docker" or "podman".
    #[serde(default)]
    pub runtime: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid target type: {0:?}")]
    InvalidType(String),
    #[error("invalid shell: {0:?}")]
    InvalidShell(String),
    #[error("invalid runtime: {0:?}")]
    InvalidRuntime(String),
    #[error("{field} name too long ({len} chars, max {MAX_NAME_LEN})")]
    NameTooLong { field: &'static str, len: usize },
    #[error("invalid {field} name: {value:?}")]
    InvalidName { field: &'static str, value: String },
}

const ALLOWED_TARGET_TYPES: &[&str] = &["host", "lima", "docker", "k8s-pod"];
const ALLOWED_SHELLS: &[&str] = &["/bin/bash", "/bin/sh", "/bin/zsh", ""];
const ALLOWED_RUNTIMES: &[&str] = &["docker", "podman", ""];
const MAX_NAME_LEN: usize = 253;

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static regex"))
}

/// Validate every field of a terminal target before it reaches an argv slot.
///
/// Names that fail the pattern (shell metacharacters, path traversal, a
/// leading `-` that an exec would read as a flag) are rejected here; nothing
/// downstream ever concatenates them into a shell string.
pub fn validate_terminal_target(target: &TerminalTarget) -> Result<(), TargetError> {
    if !ALLOWED_TARGET_TYPES.contains(&target.target_type.as_str()) {
        return Err(TargetError::InvalidType(target.target_type.clone()));
    }
    if !ALLOWED_SHELLS.contains(&target.shell.as_str()) {
        return Err(TargetError::InvalidShell(target.shell.clone()));
    }
    if !ALLOWED_RUNTIMES.contains(&target.runtime.as_str()) {
        return Err(TargetError::InvalidRuntime(target.runtime.clone()));
    }

    for (field, value) in [
        ("container", &target.container),
        ("pod", &target.pod),
        ("namespace", &target.namespace),
        ("name", &target.name),
    ] {
        if value.is_empty() {
            continue;
        }
        if value.len() > MAX_NAME_LEN {
            return Err(TargetError::NameTooLong {
                field,
                len: value.len(),
            });
        }
        if !name_re().is_match(value) {
            return Err(TargetError::InvalidName {
                field,
                value: value.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_target(container: &str) -> TerminalTarget {
        TerminalTarget {
            target_type: "docker".into(),
            container: container.into(),
            runtime: "docker".into(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_plain_host_target() {
        let target = TerminalTarget {
            target_type: "host".into(),
            shell: "/bin/bash".into(),
            ..Default::default()
        };
        assert!(validate_terminal_target(&target).is_ok());
    }

    #[test]
    fn rejects_unknown_type() {
        let target = TerminalTarget {
            target_type: "ssh".into(),
            ..Default::default()
        };
        assert_eq!(
            validate_terminal_target(&target),
            Err(TargetError::InvalidType("ssh".into()))
        );
    }

    #[test]
    fn rejects_arbitrary_shell_path() {
        let target = TerminalTarget {
            target_type: "host".into(),
            shell: "/usr/bin/python3".into(),
            ..Default::default()
        };
        assert_eq!(
            validate_terminal_target(&target),
            Err(TargetError::InvalidShell("/usr/bin/python3".into()))
        );
    }

    #[test]
    fn rejects_runtime_outside_allowlist() {
        let mut target = docker_target("web");
        target.runtime = "/usr/bin/python3".into();
        assert_eq!(
            validate_terminal_target(&target),
            Err(TargetError::InvalidRuntime("/usr/bin/python3".into()))
        );
    }

    #[test]
    fn rejects_injection_characters_in_names() {
        for bad in ["a;rm -rf /", "a|b", "a&b", "a b", "../etc", "-c", "a$(x)"] {
            let target = docker_target(bad);
            assert!(
                validate_terminal_target(&target).is_err(),
                "container name {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overlong_name() {
        let target = docker_target(&"a".repeat(254));
        assert_eq!(
            validate_terminal_target(&target),
            Err(TargetError::NameTooLong {
                field: "container",
                len: 254
            })
        );
    }

    #[test]
    fn accepts_dns_style_names() {
        for ok in ["web-1", "db.primary", "pod_0", "A9"] {
            let target = docker_target(ok);
            assert!(validate_terminal_target(&target).is_ok(), "{ok:?}");
        }
    }

    #[test]
    fn envelope_routes_by_type() {
        for (raw, want) in [
            (
                r#"{"type":"session.open","sessionId":"s1","hostId":"h1","clusterId":"c1","cols":80,"rows":24}"#,
                TYPE_SESSION_OPEN,
            ),
            (r#"{"type":"pty.input","sessionId":"s1","data":"ls\n"}"#, TYPE_PTY_INPUT),
            (
                r#"{"type":"pty.resize","sessionId":"s1","cols":120,"rows":40}"#,
                TYPE_PTY_RESIZE,
            ),
            (r#"{"type":"session.close","sessionId":"s1"}"#, TYPE_SESSION_CLOSE),
        ] {
            let env: Envelope = serde_json::from_str(raw).unwrap();
            assert_eq!(env.msg_type, want);
        }
    }

    #[test]
    fn heartbeat_serializes_with_camel_case_tag() {
        let frame = Outbound::Heartbeat {
            agent_id: "agent-1".into(),
            cluster_id: "c1".into(),
            timestamp: 1_700_000_000,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "agent.heartbeat");
        assert_eq!(value["agentId"], "agent-1");
        assert_eq!(value["clusterId"], "c1");
    }

    #[test]
    fn session_open_parses_optional_target() {
        let raw = r#"{"type":"session.open","sessionId":"s2","hostId":"h1",
            "target":{"type":"docker","container":"web","runtime":"podman"}}"#;
        let msg: SessionOpenMessage = serde_json::from_str(raw).unwrap();
        let target = msg.target.unwrap();
        assert_eq!(target.target_type, "docker");
        assert_eq!(target.runtime, "podman");
    }
}

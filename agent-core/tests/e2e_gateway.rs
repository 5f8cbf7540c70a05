//! End-to-end exercise of the gateway path: a local WebSocket double plays
//! the control plane, signs commands, and observes the agent's replies.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use agent_core::agent::{Agent, AgentConfig};
use agent_core::identity::AgentIdentity;
use agent_core::scan::Profile;
use agent_core::signing;

fn control_plane_key() -> SigningKey {
    SigningKey::from_bytes(&[9u8; 32])
}

fn sign_frame(command: Value, nonce: &str) -> String {
    let signed = signing::sign(
        &control_plane_key(),
        command.to_string().as_bytes(),
        chrono::Utc::now().timestamp(),
        nonce,
        "admin",
        "saas",
    )
    .unwrap();
    String::from_utf8(signed).unwrap()
}

struct GatewayDouble {
    to_agent: mpsc::Sender<String>,
    from_agent: mpsc::Receiver<Value>,
}

impl GatewayDouble {
    /// Accept one agent connection and bridge frames over channels.
    async fn start(listener: TcpListener) -> Self {
        let (to_agent, mut to_agent_rx) = mpsc::channel::<String>(16);
        let (from_agent_tx, from_agent) = mpsc::channel::<Value>(64);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    frame = to_agent_rx.recv() => {
                        match frame {
                            Some(text) => {
                                if write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str(&text) {
                                    if from_agent_tx.send(value).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                }
            }
        });

        Self { to_agent, from_agent }
    }

    /// Wait for the next frame of the given type, skipping heartbeats and
    /// unrelated output.
    async fn expect_frame(&mut self, msg_type: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_agent.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {msg_type}"))
                .expect("gateway double closed");
            if frame["type"] == msg_type {
                return frame;
            }
        }
    }

    /// Collect pty.output frames until the decoded stream contains `needle`.
    async fn collect_output_until(&mut self, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut collected = String::new();
        loop {
            let frame = tokio::time::timeout_at(deadline, self.from_agent.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for output {needle:?}: {collected}"))
                .expect("gateway double closed");
            if frame["type"] != "pty.output" {
                continue;
            }
            let bytes = BASE64.decode(frame["data"].as_str().unwrap()).unwrap();
            collected.push_str(&String::from_utf8_lossy(&bytes));
            if collected.contains(needle) {
                return collected;
            }
        }
    }
}

#[tokio::test]
async fn signed_session_lifecycle_over_the_wire() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let audit_dir = tempfile::tempdir().unwrap();

    let identity = AgentIdentity::new(
        "tok_e2e".into(),
        "host-e2e".into(),
        "c1".into(),
        format!("ws://{addr}"),
        vec![],
        ["terminal".to_string()],
        Some(4),
        Some(Duration::from_secs(600)),
        Some(control_plane_key().verifying_key()),
    )
    .unwrap();
    let agent = Arc::new(
        Agent::new(AgentConfig {
            identity,
            audit_path: audit_dir.path().join("audit.log"),
            profile: Profile::Minimal,
            scan_interval: Duration::from_secs(3600),
            version: "test".into(),
            cluster: None,
            dry_run: false,
            allow_insecure_gateway: true,
            max_remediations_per_hour: None,
        })
        .unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_task = tokio::spawn(agent.clone().run(shutdown_rx));
    let mut gateway = GatewayDouble::start(listener).await;

    // Liveness arrives on the fixed cadence without any prompting.
    let heartbeat = gateway.expect_frame("agent.heartbeat").await;
    assert_eq!(heartbeat["agentId"], "host-e2e");
    assert_eq!(heartbeat["clusterId"], "c1");

    // Scenario: a properly signed session.open allocates a PTY.
    let open = json!({
        "type": "session.open",
        "sessionId": "s1",
        "hostId": "host-e2e",
        "cols": 80,
        "rows": 24,
        "target": {"type": "host", "shell": "/bin/sh"},
    });
    gateway
        .to_agent
        .send(sign_frame(open.clone(), "nonce-open-1"))
        .await
        .unwrap();
    let ready = gateway.expect_frame("session.ready").await;
    assert_eq!(ready["sessionId"], "s1");

    // Input flows to the shell; output comes back base64-encoded.
    let input = json!({
        "type": "pty.input",
        "sessionId": "s1",
        "data": "echo wire-$((40+2))\n",
    });
    gateway
        .to_agent
        .send(sign_frame(input, "nonce-input-1"))
        .await
        .unwrap();
    gateway.collect_output_until("wire-42").await;

    // Scenario: the same signed frame replayed is rejected, opens nothing,
    // and leaves a BLOCKED audit entry.
    gateway
        .to_agent
        .send(sign_frame(open, "nonce-open-1"))
        .await
        .unwrap();
    let error = gateway.expect_frame("session.error").await;
    assert_eq!(error["sessionId"], "s1");
    assert!(error["error"]
        .as_str()
        .unwrap()
        .contains("duplicate nonce (replay detected)"));
    assert_eq!(agent.sessions().len(), 1);

    // Close and shut down.
    gateway
        .to_agent
        .send(sign_frame(
            json!({"type": "session.close", "sessionId": "s1"}),
            "nonce-close-1",
        ))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !agent.sessions().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session was not closed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent_task)
        .await
        .expect("agent did not unwind")
        .unwrap()
        .unwrap();

    let audit_log = std::fs::read_to_string(audit_dir.path().join("audit.log")).unwrap();
    assert!(audit_log.contains("SESSION_OPEN"));
    assert!(audit_log.contains("BLOCKED"));
    assert!(audit_log.contains("duplicate nonce (replay detected)"));
    assert!(audit_log.contains("SESSION_CLOSE"));
    assert_eq!(
        agent_core::audit::verify_chain(&audit_dir.path().join("audit.log")).unwrap(),
        Ok(audit_log.lines().filter(|l| !l.trim().is_empty()).count())
    );
}

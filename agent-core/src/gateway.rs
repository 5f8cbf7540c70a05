//! Persistent control-plane WebSocket client.
//!
//! Maintains one bidirectional connection to the gateway: dials with the
//! agent token in the `Authorization` header (never the URL query),
//! reconnects with capped exponential backoff plus jitter, emits heartbeats
//! on a fixed cadence, and funnels all writes through a single writer so
//! the socket never sees concurrent senders. Inbound frames are forwarded
//! raw; the agent loop owns verification and dispatch.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::Outbound;

/// Inbound frames larger than this are dropped to bound memory.
pub const MAX_INBOUND_FRAME: usize = 1024 * 1024;
/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// WebSocket dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for a single socket write; a stalled peer forces a reconnect.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub struct GatewayClient {
    url: String,
    token: String,
    agent_id: String,
    cluster_id: String,
}

impl GatewayClient {
    /// `allow_insecure` permits `ws://` endpoints (local development); the
    /// default rejects any non-TLS scheme.
    pub fn new(
        url: &str,
        token: impl Into<String>,
        agent_id: impl Into<String>,
        cluster_id: impl Into<String>,
        allow_insecure: bool,
    ) -> Result<Self> {
        let url = normalize_gateway_url(url, allow_insecure)?;
        Ok(Self {
            url,
            token: token.into(),
            agent_id: agent_id.into(),
            cluster_id: cluster_id.into(),
        })
    }

    /// Run until shutdown. Inbound text frames go to `inbound_tx`; frames
    /// from `outbound_rx` and heartbeats are written to the socket.
    pub async fn run(
        &self,
        inbound_tx: mpsc::Sender<String>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt = 0u32;
        let mut has_connected = false;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let stream = tokio::select! {
                dialed = self.dial() => dialed,
                _ = shutdown.changed() => return,
            };

            match stream {
                Ok(ws) => {
                    tracing::info!(
                        target = "tb_agent::gateway",
                        endpoint = %redact_endpoint(&self.url),
                        status = if has_connected { "reconnected" } else { "connected" },
                        "gateway connection established"
                    );
                    has_connected = true;
                    attempt = 0;

                    let disconnect = self
                        .serve_connection(ws, &inbound_tx, &mut outbound_rx, &mut shutdown)
                        .await;
                    if !disconnect {
                        // Cooperative shutdown.
                        return;
                    }
                    tracing::warn!(target = "tb_agent::gateway", "gateway connection lost");
                }
                Err(error) => {
                    tracing::warn!(
                        target = "tb_agent::gateway",
                        endpoint = %redact_endpoint(&self.url),
                        error = %error,
                        "gateway dial failed"
                    );
                }
            }

            attempt += 1;
            let delay = reconnect_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn dial(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("build gateway request")?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token)
                .parse()
                .context("token is not a valid header value")?,
        );

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_INBOUND_FRAME);
        config.max_frame_size = Some(MAX_INBOUND_FRAME);

        let (ws, _) = tokio::time::timeout(
            DIAL_TIMEOUT,
            tokio_tungstenite::connect_async_with_config(request, Some(config), false),
        )
        .await
        .context("gateway dial timed out")??;
        Ok(ws)
    }

    /// Serve one connection. Returns true when the peer disconnected (so the
    /// caller reconnects), false on cooperative shutdown.
    async fn serve_connection<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        inbound_tx: &mpsc::Sender<String>,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Flush already-queued frames before closing; each write
                    // is still bounded by the write deadline.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if !Self::write_frame(&mut write, &frame).await {
                            break;
                        }
                    }
                    let _ = write.close().await;
                    return false;
                }

                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.close().await;
                        return false;
                    };
                    if !Self::write_frame(&mut write, &frame).await {
                        return true;
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = Outbound::Heartbeat {
                        agent_id: self.agent_id.clone(),
                        cluster_id: self.cluster_id.clone(),
                        timestamp: chrono::Utc::now().timestamp(),
                    };
                    if !Self::write_frame(&mut write, &frame).await {
                        return true;
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_INBOUND_FRAME {
                                tracing::warn!(
                                    target = "tb_agent::gateway",
                                    size = text.len(),
                                    "dropping oversized inbound frame"
                                );
                                continue;
                            }
                            if inbound_tx.send(text).await.is_err() {
                                let _ = write.close().await;
                                return false;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            tracing::debug!(
                                target = "tb_agent::gateway",
                                "ignoring binary frame"
                            );
                        }
                        Some(Ok(Message::Close(_))) | None => return true,
                        Some(Err(error)) => {
                            tracing::warn!(target = "tb_agent::gateway", error = %error, "ws read error");
                            return true;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn write_frame<S>(
        write: &mut futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<S>,
            Message,
        >,
        frame: &Outbound,
    ) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(target = "tb_agent::gateway", error = %error, "frame serialize failed");
                return true;
            }
        };
        match tokio::time::timeout(WRITE_DEADLINE, write.send(Message::Text(text))).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(target = "tb_agent::gateway", error = %error, "ws write failed");
                false
            }
            Err(_) => {
                tracing::warn!(target = "tb_agent::gateway", "ws write deadline exceeded");
                false
            }
        }
    }
}

/// Normalize a gateway endpoint to a WebSocket URL, refusing plaintext
/// schemes unless explicitly allowed.
pub fn normalize_gateway_url(raw: &str, allow_insecure: bool) -> Result<String> {
    let raw = raw.trim();
    let normalized = if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{raw}")
    };

    if normalized.starts_with("ws://") && !allow_insecure {
        bail!("insecure gateway scheme ws:// (pass allow_insecure to permit)");
    }

    let url = Url::parse(&normalized).context("invalid gateway url")?;
    Ok(url.to_string())
}

/// Exponential backoff: 1 s, 2 s, 4 s, ... capped at 60 s, ±10% jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let bounded = base_ms.min(60_000);
    let spread = bounded / 10;
    let jitter = rand::thread_rng().gen_range(0..=2 * spread) as i64 - spread as i64;
    Duration::from_millis((bounded as i64 + jitter) as u64)
}

fn redact_endpoint(url: &str) -> &str {
    url.split_once('?').map(|(prefix, _)| prefix).unwrap_or(url)
}

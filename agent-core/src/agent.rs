//! The agent process: composes every subsystem under one cancellation
//! scope.
//!
//! Three long-running duties share the scope: the scan loop (discovery and
//! upload), the gateway loop (decode, verify, dispatch), and the cluster
//! pipeline (insight sweep, incremental sync, bounded auto-remediation,
//! command polling). Flipping the shutdown signal unwinds all of them;
//! sessions are torn down and the outbound queue is drained with a
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::cluster::ClusterApi;
use crate::commands::{Command, CommandResult, CompletionStatus, Executor};
use crate::gateway::GatewayClient;
use crate::identity::{AgentIdentity, PERMISSION_SCAN};
use crate::insights::{default_excluded_namespaces, InsightEngine, InsightReporter};
use crate::poller::CommandPoller;
use crate::protocol::{
    self, Envelope, Outbound, PtyInputMessage, PtyResizeMessage, SessionCloseMessage,
    SessionOpenMessage,
};
use crate::remediation::{
    CircuitBreaker, RemediationReporter, Remediator, DEFAULT_COOLDOWN, DEFAULT_MAX_PER_HOUR,
};
use crate::scan::{Profile, ScanLoop, ScanLoopConfig};
use crate::sessions::SessionMultiplexer;
use crate::signing::Verifier;
use crate::upload::MultiUploader;

/// Depth of the outbound wire queue.
const OUTBOUND_DEPTH: usize = 64;
/// Depth of the inbound frame queue.
const INBOUND_DEPTH: usize = 256;
/// Command poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct AgentConfig {
    pub identity: AgentIdentity,
    pub audit_path: std::path::PathBuf,
    /// Scan profile + interval; scanning is skipped without the `scan`
    /// permission or without upstreams.
    pub profile: Profile,
    pub scan_interval: Duration,
    pub version: String,
    /// Cluster API; absent outside Kubernetes.
    pub cluster: Option<Arc<dyn ClusterApi>>,
    pub dry_run: bool,
    pub allow_insecure_gateway: bool,
    pub max_remediations_per_hour: Option<usize>,
}

pub struct Agent {
    identity: Arc<AgentIdentity>,
    audit: Arc<AuditLogger>,
    verifier: Option<Verifier>,
    mux: Arc<SessionMultiplexer>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    gateway: Option<GatewayClient>,
    scan_loop: Option<ScanLoop>,
    cluster: Option<ClusterPipeline>,
}

struct ClusterPipeline {
    executor: Executor,
    poller: Option<CommandPoller>,
    engine: InsightEngine,
    insight_reporter: Option<InsightReporter>,
    remediator: Remediator,
    remediation_reporter: Option<RemediationReporter>,
    cluster: Arc<dyn ClusterApi>,
    interval: Duration,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let identity = Arc::new(config.identity);
        let audit = Arc::new(AuditLogger::open(&config.audit_path).context("open audit log")?);
        let verifier = identity.verifying_key.as_ref().map(|key| Verifier::new(*key));

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let mux = SessionMultiplexer::new(identity.clone(), outbound_tx.clone(), audit.clone());

        let gateway = if identity.gateway_url.is_empty() {
            None
        } else {
            Some(GatewayClient::new(
                &identity.gateway_url,
                &identity.token,
                &identity.host_id,
                &identity.cluster_id,
                config.allow_insecure_gateway,
            )?)
        };

        let scan_loop = if identity.has_permission(PERMISSION_SCAN) && !identity.upstreams.is_empty()
        {
            Some(ScanLoop::new(
                ScanLoopConfig {
                    profile: config.profile,
                    interval: config.scan_interval,
                    version: config.version.clone(),
                },
                Some(MultiUploader::new(&identity.upstreams)),
            ))
        } else {
            None
        };

        let cluster = config.cluster.map(|cluster| {
            // Pollers and reporters talk to the first upstream; fan-out is
            // only for scan reports.
            let primary = identity.upstreams.first();
            let breaker = Arc::new(CircuitBreaker::new(
                config.max_remediations_per_hour.unwrap_or(DEFAULT_MAX_PER_HOUR),
                DEFAULT_COOLDOWN,
            ));
            ClusterPipeline {
                executor: Executor::new(cluster.clone()),
                poller: primary.map(|u| CommandPoller::new(&u.url, &u.token, &u.anon_key)),
                engine: InsightEngine::new(default_excluded_namespaces()),
                insight_reporter: primary.map(|u| InsightReporter::new(&u.url, &u.token, &u.anon_key)),
                remediator: Remediator::new(cluster.clone(), breaker, config.dry_run),
                remediation_reporter: primary
                    .map(|u| RemediationReporter::new(&u.url, &u.token, &u.anon_key)),
                cluster,
                interval: config.scan_interval,
            }
        });

        Ok(Self {
            identity,
            audit,
            verifier,
            mux,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            gateway,
            scan_loop,
            cluster,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionMultiplexer> {
        &self.mux
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(INBOUND_DEPTH);

        if self.gateway.is_some() {
            let outbound_rx = self
                .outbound_rx
                .lock()
                .take()
                .context("agent already running")?;
            let agent = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let gateway = agent.gateway.as_ref().expect("checked above");
                gateway.run(inbound_tx, outbound_rx, shutdown).await;
            });
        }

        {
            let mux = self.mux.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { mux.run_reaper(shutdown).await });
        }

        if self.scan_loop.is_some() {
            let agent = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                agent
                    .scan_loop
                    .as_ref()
                    .expect("checked above")
                    .run(shutdown)
                    .await;
            });
        }

        if self.cluster.is_some() {
            let agent = self.clone();
            let shutdown_pipeline = shutdown.clone();
            tasks.spawn(async move { agent.run_cluster_pipeline(shutdown_pipeline).await });
            let agent = self.clone();
            let shutdown_poller = shutdown.clone();
            tasks.spawn(async move { agent.run_command_poller(shutdown_poller).await });
        }

        // Inbound dispatch is the agent's own duty on this task.
        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                frame = inbound_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(&frame).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        self.mux.close_all();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Decode, verify, and dispatch one inbound frame.
    pub async fn handle_frame(&self, raw: &str) {
        let (command_bytes, user_id, origin) = match &self.verifier {
            Some(verifier) => {
                let (command, verification) = verifier.verify(raw.as_bytes());
                if !verification.valid {
                    let reason = verification
                        .reason
                        .unwrap_or_else(|| "verification failed".into());
                    tracing::warn!(
                        target = "tb_agent::agent",
                        reason = %reason,
                        user_id = %verification.user_id,
                        "rejected unsigned or invalid frame"
                    );
                    let session_id = extract_session_id(raw);
                    self.audit_log(
                        AuditEntry::new(session_id.clone().unwrap_or_default(), AuditEventType::Blocked)
                            .with_actor(&verification.user_id, &verification.origin)
                            .with_reason(&reason),
                    );
                    if let Some(session_id) = session_id {
                        let _ = self
                            .outbound_tx
                            .send(Outbound::SessionError {
                                session_id,
                                error: reason,
                            })
                            .await;
                    }
                    return;
                }
                (
                    command.expect("valid verification carries the command"),
                    verification.user_id,
                    verification.origin,
                )
            }
            None => (raw.as_bytes().to_vec(), String::new(), String::new()),
        };

        let envelope: Envelope = match serde_json::from_slice(&command_bytes) {
            Ok(env) => env,
            Err(error) => {
                tracing::debug!(target = "tb_agent::agent", error = %error, "undecodable frame");
                return;
            }
        };

        match envelope.msg_type.as_str() {
            protocol::TYPE_SESSION_OPEN => {
                let Ok(msg) = serde_json::from_slice::<SessionOpenMessage>(&command_bytes) else {
                    return;
                };
                if let Err(error) = self.mux.open(&msg, &user_id, &origin).await {
                    let reason = error.to_string();
                    tracing::warn!(
                        target = "tb_agent::agent",
                        session = %msg.session_id,
                        reason = %reason,
                        "session open rejected"
                    );
                    self.audit_log(
                        AuditEntry::new(&msg.session_id, AuditEventType::Blocked)
                            .with_actor(&user_id, &origin)
                            .with_reason(&reason),
                    );
                    let _ = self
                        .outbound_tx
                        .send(Outbound::SessionError {
                            session_id: msg.session_id,
                            error: reason,
                        })
                        .await;
                }
            }
            protocol::TYPE_PTY_INPUT => {
                let Ok(msg) = serde_json::from_slice::<PtyInputMessage>(&command_bytes) else {
                    return;
                };
                if let Err(error) = self.mux.input(&msg.session_id, msg.data.as_bytes()) {
                    let _ = self
                        .outbound_tx
                        .send(Outbound::SessionError {
                            session_id: msg.session_id,
                            error: error.to_string(),
                        })
                        .await;
                }
            }
            protocol::TYPE_PTY_RESIZE => {
                let Ok(msg) = serde_json::from_slice::<PtyResizeMessage>(&command_bytes) else {
                    return;
                };
                if let Err(error) = self.mux.resize(&msg.session_id, msg.cols, msg.rows) {
                    tracing::debug!(
                        target = "tb_agent::agent",
                        session = %msg.session_id,
                        error = %error,
                        "resize failed"
                    );
                }
            }
            protocol::TYPE_SESSION_CLOSE => {
                let Ok(msg) = serde_json::from_slice::<SessionCloseMessage>(&command_bytes) else {
                    return;
                };
                let _ = self.mux.close(&msg.session_id);
            }
            protocol::TYPE_COMMAND => {
                let Ok(cmd) = serde_json::from_slice::<Command>(&command_bytes) else {
                    return;
                };
                self.audit_log(
                    AuditEntry::new("", AuditEventType::Command)
                        .with_actor(&user_id, &origin)
                        .with_reason(format!(
                            "{} {}/{}/{}",
                            cmd.action, cmd.target_kind, cmd.target_namespace, cmd.target_name
                        )),
                );
                let Some(pipeline) = &self.cluster else {
                    tracing::warn!(
                        target = "tb_agent::agent",
                        action = %cmd.action,
                        "command received but no cluster is configured"
                    );
                    return;
                };
                let result = pipeline.executor.execute(&cmd).await;
                self.acknowledge(pipeline, &cmd, &result).await;
            }
            other => {
                tracing::debug!(target = "tb_agent::agent", msg_type = other, "ignoring unknown message type");
            }
        }
    }

    async fn acknowledge(&self, pipeline: &ClusterPipeline, cmd: &Command, result: &CommandResult) {
        if cmd.id.is_empty() {
            return;
        }
        let Some(poller) = &pipeline.poller else {
            return;
        };
        let status = if result.success {
            CompletionStatus::Completed
        } else {
            CompletionStatus::Failed
        };
        let error_message = (!result.success).then(|| result.message.clone());
        if let Err(error) = poller
            .complete(&cmd.id, status, Some(result), error_message.as_deref())
            .await
        {
            tracing::warn!(target = "tb_agent::agent", error = %error, "command completion failed");
        }
    }

    /// Insight sweep, incremental sync, then bounded auto-remediation.
    async fn run_cluster_pipeline(&self, mut shutdown: watch::Receiver<bool>) {
        let pipeline = self.cluster.as_ref().expect("cluster pipeline configured");
        let mut tick = tokio::time::interval(pipeline.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let insights = pipeline.engine.analyze(pipeline.cluster.as_ref()).await;
                    if let Some(reporter) = &pipeline.insight_reporter {
                        if let Err(error) = reporter.report(&insights).await {
                            tracing::warn!(target = "tb_agent::agent", error = %error, "insight sync failed");
                        }
                    }

                    let results = pipeline.remediator.remediate(&insights).await;
                    if let Some(reporter) = &pipeline.remediation_reporter {
                        if let Err(error) = reporter.report(&results).await {
                            tracing::warn!(target = "tb_agent::agent", error = %error, "remediation report failed");
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn run_command_poller(&self, mut shutdown: watch::Receiver<bool>) {
        let pipeline = self.cluster.as_ref().expect("cluster pipeline configured");
        let Some(poller) = &pipeline.poller else {
            return;
        };
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let commands = match poller.poll().await {
                        Ok(commands) => commands,
                        Err(error) => {
                            tracing::warn!(target = "tb_agent::agent", error = %error, "command poll failed");
                            continue;
                        }
                    };
                    for cmd in commands {
                        self.audit_log(
                            AuditEntry::new("", AuditEventType::Command).with_reason(format!(
                                "{} {}/{}/{}",
                                cmd.action, cmd.target_kind, cmd.target_namespace, cmd.target_name
                            )),
                        );
                        let result = pipeline.executor.execute(&cmd).await;
                        self.acknowledge(pipeline, &cmd, &result).await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn audit_log(&self, entry: AuditEntry) {
        if let Err(error) = self.audit.log(entry) {
            tracing::warn!(target = "tb_agent::agent", error = %error, "audit write failed");
        }
    }
}

fn extract_session_id(raw: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw)
        .ok()?
        .get("sessionId")?
        .as_str()
        .map(String::from)
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("host_id", &self.identity.host_id)
            .field("sessions", &self.mux.len())
            .finish()
    }
}

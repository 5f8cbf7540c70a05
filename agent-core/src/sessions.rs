//! Concurrent terminal session multiplexer.
//!
//! Owns the session map and every PTY lifecycle: permission and host
//! checks, target validation, the global cap, per-session output pumps, the
//! idle reaper, and teardown on shutdown. Input for a single session is
//! applied in arrival order because the agent dispatches from one inbound
//! loop; output from different sessions interleaves freely on the outbound
//! channel, each frame carrying its session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::identity::{AgentIdentity, PERMISSION_TERMINAL};
use crate::protocol::{
    validate_terminal_target, Outbound, SessionOpenMessage, TargetError, TerminalTarget,
};
use crate::pty::{PtyEvent, PtySession};

/// Reaper scan cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("terminal permission not granted")]
    PermissionDenied,
    #[error("session host mismatch")]
    HostMismatch,
    #[error("session already exists")]
    AlreadyExists,
    #[error("session limit reached ({0})")]
    LimitReached(usize),
    #[error("{0}")]
    InvalidTarget(#[from] TargetError),
    #[error("unknown session {0:?}")]
    UnknownSession(String),
    #[error(transparent)]
    Spawn(anyhow::Error),
    #[error("session i/o failed: {0}")]
    Io(anyhow::Error),
}

struct SessionHandle {
    pty: Arc<PtySession>,
    last_input: Mutex<Instant>,
    done_tx: watch::Sender<bool>,
    user_id: String,
    origin: String,
}

pub struct SessionMultiplexer {
    identity: Arc<AgentIdentity>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    outbound: mpsc::Sender<Outbound>,
    audit: Arc<AuditLogger>,
}

impl SessionMultiplexer {
    pub fn new(
        identity: Arc<AgentIdentity>,
        outbound: mpsc::Sender<Outbound>,
        audit: Arc<AuditLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            sessions: Mutex::new(HashMap::new()),
            outbound,
            audit,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Open a session and emit `session.ready`. Every check runs before any
    /// subprocess is spawned.
    pub async fn open(
        self: &Arc<Self>,
        msg: &SessionOpenMessage,
        user_id: &str,
        origin: &str,
    ) -> Result<(), SessionError> {
        if !self.identity.has_permission(PERMISSION_TERMINAL) {
            return Err(SessionError::PermissionDenied);
        }
        if !msg.host_id.is_empty() && msg.host_id != self.identity.host_id {
            return Err(SessionError::HostMismatch);
        }

        let target = msg.target.clone().unwrap_or(TerminalTarget {
            target_type: "host".into(),
            ..Default::default()
        });
        validate_terminal_target(&target)?;

        {
            let sessions = self.sessions.lock();
            if sessions.contains_key(&msg.session_id) {
                return Err(SessionError::AlreadyExists);
            }
            if sessions.len() >= self.identity.max_sessions {
                return Err(SessionError::LimitReached(self.identity.max_sessions));
            }
        }

        let (pty, output_rx) =
            PtySession::spawn(&target, msg.cols, msg.rows).map_err(SessionError::Spawn)?;
        let (done_tx, _) = watch::channel(false);
        let handle = Arc::new(SessionHandle {
            pty: Arc::new(pty),
            last_input: Mutex::new(Instant::now()),
            done_tx,
            user_id: user_id.to_string(),
            origin: origin.to_string(),
        });

        {
            let mut sessions = self.sessions.lock();
            // A racing open may have won the slot while the PTY spawned.
            if sessions.contains_key(&msg.session_id) {
                handle.pty.close();
                return Err(SessionError::AlreadyExists);
            }
            if sessions.len() >= self.identity.max_sessions {
                handle.pty.close();
                return Err(SessionError::LimitReached(self.identity.max_sessions));
            }
            sessions.insert(msg.session_id.clone(), handle.clone());
        }

        self.audit_log(
            AuditEntry::new(&msg.session_id, AuditEventType::SessionOpen)
                .with_actor(user_id, origin),
        );

        let mux = Arc::clone(self);
        let session_id = msg.session_id.clone();
        tokio::spawn(async move {
            mux.pump_output(session_id, output_rx).await;
        });

        let _ = self
            .outbound
            .send(Outbound::SessionReady {
                session_id: msg.session_id.clone(),
            })
            .await;
        Ok(())
    }

    /// Forward PTY output until the pump ends, then tear the session down.
    async fn pump_output(self: Arc<Self>, session_id: String, mut rx: mpsc::Receiver<PtyEvent>) {
        let mut close_reason = "session ended";
        while let Some(event) = rx.recv().await {
            match event {
                PtyEvent::Output(chunk) => {
                    // Blocking send: backpressure reaches the pump thread
                    // through this bounded channel.
                    if self
                        .outbound
                        .send(Outbound::PtyOutput {
                            session_id: session_id.clone(),
                            data: BASE64.encode(&chunk),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                PtyEvent::RateLimitExceeded => {
                    tracing::warn!(
                        target = "tb_agent::sessions",
                        session = %session_id,
                        "output rate limit exceeded, terminating session"
                    );
                    let _ = self
                        .outbound
                        .send(Outbound::SessionError {
                            session_id: session_id.clone(),
                            error: "output rate limit exceeded".into(),
                        })
                        .await;
                    close_reason = "output rate limit exceeded";
                    break;
                }
            }
        }
        self.remove(&session_id, close_reason);
    }

    /// Deliver input bytes. Input refreshes the idle clock.
    pub fn input(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let handle = self.lookup(session_id)?;
        *handle.last_input.lock() = Instant::now();
        handle.pty.write_all(data).map_err(SessionError::Io)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let handle = self.lookup(session_id)?;
        handle.pty.resize(cols, rows).map_err(SessionError::Io)
    }

    pub fn close(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = {
            let mut sessions = self.sessions.lock();
            sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?
        };
        self.teardown(session_id, &handle, "closed by control plane");
        Ok(())
    }

    /// Subscribe to a session's done signal.
    pub fn done(&self, session_id: &str) -> Option<watch::Receiver<bool>> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|h| h.done_tx.subscribe())
    }

    pub fn close_all(&self) {
        let drained: Vec<(String, Arc<SessionHandle>)> =
            self.sessions.lock().drain().collect();
        for (id, handle) in drained {
            self.teardown(&id, &handle, "agent shutdown");
        }
    }

    /// Close sessions whose last input is older than the idle timeout.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.identity.idle_timeout;
        let expired: Vec<(String, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, h)| h.last_input.lock().elapsed() > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|h| (id, h)))
                .collect()
        };
        let count = expired.len();
        for (id, handle) in expired {
            tracing::info!(target = "tb_agent::sessions", session = %id, "closing idle session");
            self.teardown(&id, &handle, "idle timeout");
        }
        count
    }

    /// Periodic idle sweep until shutdown.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.reap_idle();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    /// Remove a session that ended on its own (EOF or rate kill).
    fn remove(&self, session_id: &str, reason: &str) {
        let handle = self.sessions.lock().remove(session_id);
        if let Some(handle) = handle {
            self.teardown(session_id, &handle, reason);
        }
    }

    fn teardown(&self, session_id: &str, handle: &SessionHandle, reason: &str) {
        handle.pty.close();
        let _ = handle.done_tx.send(true);
        self.audit_log(
            AuditEntry::new(session_id, AuditEventType::SessionClose)
                .with_actor(&handle.user_id, &handle.origin)
                .with_reason(reason),
        );
    }

    fn audit_log(&self, entry: AuditEntry) {
        if let Err(error) = self.audit.log(entry) {
            tracing::warn!(target = "tb_agent::sessions", error = %error, "audit write failed");
        }
    }
}

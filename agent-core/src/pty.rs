//! A single pseudo-terminal session.
//!
//! Spawns the target shell attached to a PTY and pumps its output through a
//! bounded channel. The pump uses blocking sends: if the consumer is slow
//! the pump stalls, the kernel PTY buffer fills, and the child blocks on
//! write. A slow control plane therefore throttles the shell instead of
//! growing agent memory. A hard bytes-per-second cap backstops that: a
//! session exceeding it is terminated with an error.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::protocol::TerminalTarget;

/// Read granularity of the output pump.
const OUTPUT_CHUNK: usize = 4096;
/// Depth of the per-session output channel.
const OUTPUT_CHANNEL_DEPTH: usize = 256;
/// Sustained output above this rate terminates the session.
const MAX_OUTPUT_BYTES_PER_SEC: u64 = 8 * 1024 * 1024;

/// One chunk of pump output, or the reason the pump stopped early.
#[derive(Debug, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// The session exceeded [`MAX_OUTPUT_BYTES_PER_SEC`] and was killed.
    RateLimitExceeded,
}

pub struct PtySession {
    master: Mutex<Box<dyn portable_pty::MasterPty>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    closed: Arc<AtomicBool>,
}

impl PtySession {
    /// Spawn the shell for `target` attached to a fresh PTY of the given
    /// size. The target must already be validated.
    pub fn spawn(
        target: &TerminalTarget,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: if rows == 0 { 24 } else { rows },
                cols: if cols == 0 { 80 } else { cols },
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let cmd = command_for_target(target);
        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn session shell")?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        thread::spawn(move || {
            let mut buf = [0u8; OUTPUT_CHUNK];
            let mut window_start = Instant::now();
            let mut window_bytes: u64 = 0;
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let now = Instant::now();
                        if now.duration_since(window_start) >= Duration::from_secs(1) {
                            window_start = now;
                            window_bytes = 0;
                        }
                        window_bytes += n as u64;
                        if window_bytes > MAX_OUTPUT_BYTES_PER_SEC {
                            let _ = tx.blocking_send(PtyEvent::RateLimitExceeded);
                            break;
                        }
                        if tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }

    /// Deliver input bytes to the child.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Check whether the child has exited, reaping it if so.
    pub fn has_exited(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return true;
        }
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(Some(_)) => {
                self.closed.store(true, Ordering::Relaxed);
                true
            }
            Ok(None) => false,
            // ECHILD: reaped elsewhere.
            Err(_) => {
                self.closed.store(true, Ordering::Relaxed);
                true
            }
        }
    }

    /// Kill and reap the child. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the argv for a terminal target. Every field lands in its own argv
/// slot; nothing is ever interpolated into a shell string. The child gets a
/// minimal, explicit environment so no agent token, URL, or API key is
/// reachable from the shell.
fn command_for_target(target: &TerminalTarget) -> CommandBuilder {
    let shell = |fallback: &str| -> String {
        if target.shell.is_empty() {
            fallback.to_string()
        } else {
            target.shell.clone()
        }
    };

    let mut cmd = match target.target_type.as_str() {
        "docker" => {
            let runtime = if target.runtime.is_empty() {
                "docker"
            } else {
                &target.runtime
            };
            let mut cmd = CommandBuilder::new(runtime);
            cmd.args(["exec", "-it", &target.container, &shell("/bin/sh")]);
            cmd
        }
        "k8s-pod" => {
            let namespace = if target.namespace.is_empty() {
                "default"
            } else {
                &target.namespace
            };
            let mut cmd = CommandBuilder::new("kubectl");
            cmd.args(["exec", "-it", "-n", namespace, &target.pod, "--", &shell("/bin/sh")]);
            cmd
        }
        "lima" => {
            let mut cmd = CommandBuilder::new("limactl");
            cmd.args(["shell", &target.name]);
            cmd
        }
        // "host" and the empty default target.
        _ => CommandBuilder::new(shell("/bin/bash")),
    };

    cmd.env_clear();
    cmd.env("TERM", "xterm-256color");
    for key in ["HOME", "USER", "PATH", "SHELL"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn host_target(shell: &str) -> TerminalTarget {
        TerminalTarget {
            target_type: "host".into(),
            shell: shell.into(),
            ..Default::default()
        }
    }

    async fn collect_output(rx: &mut mpsc::Receiver<PtyEvent>, needle: &str) -> String {
        let mut collected = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if let PtyEvent::Output(chunk) = event {
                collected.extend_from_slice(&chunk);
            }
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test]
    async fn spawn_write_and_read_back() {
        let (pty, mut rx) = PtySession::spawn(&host_target("/bin/sh"), 80, 24).unwrap();
        pty.write_all(b"echo agent-$((40+2))\n").unwrap();
        let output = collect_output(&mut rx, "agent-42").await;
        assert!(output.contains("agent-42"), "got: {output}");
        pty.close();
    }

    #[tokio::test]
    async fn resize_does_not_error() {
        let (pty, _rx) = PtySession::spawn(&host_target("/bin/sh"), 80, 24).unwrap();
        assert!(pty.resize(120, 40).is_ok());
        pty.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_pump_ends() {
        let (pty, mut rx) = PtySession::spawn(&host_target("/bin/sh"), 80, 24).unwrap();
        pty.close();
        pty.close();
        // After close, the channel drains and then ends.
        let result = timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(result.is_ok(), "output channel did not close");
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn agent_environment_not_leaked_into_shell() {
        std::env::set_var("TB_TOKEN", "secret-token-value");
        let (pty, mut rx) = PtySession::spawn(&host_target("/bin/sh"), 80, 24).unwrap();
        pty.write_all(b"echo TOKEN=[${TB_TOKEN}] TERM=$TERM\n").unwrap();
        let output = collect_output(&mut rx, "TERM=xterm-256color").await;
        assert!(output.contains("TOKEN=[]"), "TB_TOKEN leaked: {output}");
        pty.close();
    }

    #[test]
    fn docker_target_builds_exec_argv() {
        let target = TerminalTarget {
            target_type: "docker".into(),
            container: "web-1".into(),
            runtime: "podman".into(),
            ..Default::default()
        };
        let cmd = command_for_target(&target);
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv, ["podman", "exec", "-it", "web-1", "/bin/sh"]);
    }
}

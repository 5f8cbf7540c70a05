//! Periodic profile-driven discovery.
//!
//! Collectors are deliberately thin seams: each shells out or reads the
//! proc filesystem, returns a JSON section, and may fail without affecting
//! the rest of the scan. The loop runs immediately at start, then on a
//! fixed interval with ±60 s jitter to destagger fleets.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::upload::{IngestMeta, IngestRequest, MultiUploader};

/// Spread applied to every scan interval.
const JITTER: Duration = Duration::from_secs(60);

/// Scan depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// OS, CPU, RAM.
    Minimal,
    /// + network, storage.
    Standard,
    /// + containers.
    Full,
}

impl Profile {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(Profile::Minimal),
            "standard" | "" => Ok(Profile::Standard),
            "full" => Ok(Profile::Full),
            other => bail!("unknown profile {other:?} (valid: minimal, standard, full)"),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Profile::Minimal => "minimal",
            Profile::Standard => "standard",
            Profile::Full => "full",
        })
    }
}

/// Abstracts command execution so collectors can be tested without a host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<Vec<u8>>;
}

/// Executes commands on the local host via `/bin/sh`.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("spawn {command:?}"))?;
        if !output.status.success() {
            bail!(
                "command {command:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

/// One discovery phase producing one section of the ingest request.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Value>;
}

/// Collectors for a profile, in phase order.
pub fn collectors_for(profile: Profile) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(HostCollector)];
    if profile >= Profile::Standard {
        collectors.push(Box::new(NetworkCollector));
        collectors.push(Box::new(StorageCollector));
    }
    if profile == Profile::Full {
        collectors.push(Box::new(ContainerCollector));
    }
    collectors
}

impl PartialOrd for Profile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Profile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(p: &Profile) -> u8 {
            match p {
                Profile::Minimal => 0,
                Profile::Standard => 1,
                Profile::Full => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

struct HostCollector;

#[async_trait]
impl Collector for HostCollector {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Value> {
        let hostname = runner
            .run("hostname")
            .await
            .map(|out| String::from_utf8_lossy(&out).trim().to_string())
            .unwrap_or_default();
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(0);

        Ok(json!({
            "name": hostname,
            "type": "baremetal",
            "system": {
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "cpu_cores": cpu_cores,
                "memory_gb": read_memory_gb(),
            },
            "network": {
                "hostname": hostname,
                "interfaces": [],
            },
        }))
    }
}

fn read_memory_gb() -> f64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: f64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .unwrap_or(0.0);
            return (kb / (1024.0 * 1024.0) * 10.0).round() / 10.0;
        }
    }
    0.0
}

struct NetworkCollector;

#[async_trait]
impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Value> {
        let raw = runner.run("ip -o addr show 2>/dev/null || ifconfig -a").await?;
        let mut interfaces = Vec::new();
        for line in String::from_utf8_lossy(&raw).lines() {
            // `ip -o addr` form: "2: eth0    inet 10.0.0.5/24 ..."
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 && fields[2] == "inet" {
                interfaces.push(json!({
                    "name": fields[1].trim_end_matches(':'),
                    "ip": fields[3].split('/').next().unwrap_or_default(),
                }));
            }
        }
        Ok(json!({ "interfaces": interfaces }))
    }
}

struct StorageCollector;

#[async_trait]
impl Collector for StorageCollector {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Value> {
        let raw = runner.run("df -k -P").await?;
        let mut filesystems = Vec::new();
        for line in String::from_utf8_lossy(&raw).lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || !fields[0].starts_with('/') {
                continue;
            }
            filesystems.push(json!({
                "device": fields[0],
                "size_kb": fields[1].parse::<u64>().unwrap_or(0),
                "used_kb": fields[2].parse::<u64>().unwrap_or(0),
                "mount": fields[5],
            }));
        }
        Ok(json!({ "filesystems": filesystems }))
    }
}

struct ContainerCollector;

#[async_trait]
impl Collector for ContainerCollector {
    fn name(&self) -> &'static str {
        "containers"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Value> {
        let raw = runner
            .run("docker ps --format '{{.ID}} {{.Image}} {{.Names}}' 2>/dev/null")
            .await?;
        let containers: Vec<Value> = String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                (fields.len() >= 3).then(|| {
                    json!({"id": fields[0], "image": fields[1], "name": fields[2]})
                })
            })
            .collect();
        Ok(json!({ "containers": containers }))
    }
}

pub struct ScanLoopConfig {
    pub profile: Profile,
    pub interval: Duration,
    pub version: String,
}

/// The periodic scan driver.
pub struct ScanLoop {
    config: ScanLoopConfig,
    collectors: Vec<Box<dyn Collector>>,
    runner: Box<dyn CommandRunner>,
    uploader: Option<MultiUploader>,
}

impl ScanLoop {
    pub fn new(config: ScanLoopConfig, uploader: Option<MultiUploader>) -> Self {
        let collectors = collectors_for(config.profile);
        Self {
            config,
            collectors,
            runner: Box::new(LocalRunner),
            uploader,
        }
    }

    #[cfg(test)]
    fn with_parts(
        config: ScanLoopConfig,
        collectors: Vec<Box<dyn Collector>>,
        runner: Box<dyn CommandRunner>,
        uploader: Option<MultiUploader>,
    ) -> Self {
        Self {
            config,
            collectors,
            runner,
            uploader,
        }
    }

    /// Run one scan across all collectors, absorbing per-collector failures.
    pub async fn scan_once(&self) -> IngestRequest {
        let started = Instant::now();
        let mut req = IngestRequest::default();
        let mut phases = Vec::new();

        for collector in &self.collectors {
            match collector.collect(self.runner.as_ref()).await {
                Ok(section) => {
                    phases.push(collector.name().to_string());
                    match collector.name() {
                        "host" => req.host = Some(section),
                        "network" => req.network = Some(section),
                        "storage" => req.storage = Some(section),
                        "containers" => req.containers = Some(section),
                        other => {
                            tracing::debug!(
                                target = "tb_agent::scan",
                                phase = other,
                                "unmapped scan phase"
                            );
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "tb_agent::scan",
                        phase = collector.name(),
                        error = %error,
                        "collector failed, continuing"
                    );
                }
            }
        }

        let source_host = req
            .host
            .as_ref()
            .and_then(|h| h.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        req.meta = IngestMeta {
            version: self.config.version.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            phases,
            source_host,
        };
        req
    }

    /// Scan immediately, then on the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let report = self.scan_once().await;
            if let Some(uploader) = &self.uploader {
                if let Err(error) = uploader.upload(&report).await {
                    tracing::warn!(target = "tb_agent::scan", error = %error, "scan upload failed");
                }
            }

            let delay = jittered(self.config.interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    let spread = JITTER.as_secs() as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let base = interval.as_secs() as i64;
    Duration::from_secs((base + offset).max(1) as u64)
}

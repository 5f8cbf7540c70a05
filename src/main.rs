use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod status;

use agent_core::agent::{Agent, AgentConfig};
use agent_core::audit;
use agent_core::cluster::{ClusterApi, HttpCluster};
use agent_core::identity::AgentIdentity;
use agent_core::scan::Profile;
use agent_core::signing::parse_verifying_key;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "tb-agent")]
#[command(about = "Host-resident infrastructure discovery and remote-management agent")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run as a persistent agent with scanning and terminal support.
    Daemon(DaemonCommand),
    /// Show service status (exit code 1 when installed but not running).
    Status,
    /// Print the version.
    Version,
}

#[derive(Debug, Args)]
struct DaemonCommand {
    /// Cluster identifier reported in heartbeats.
    #[arg(long, default_value = "")]
    cluster_id: String,

    /// Terminal session idle timeout (e.g. 30m, 90s).
    #[arg(long, default_value = "30m")]
    idle_timeout: String,

    /// Scan interval (e.g. 5m, 30s).
    #[arg(long)]
    scan_interval: Option<String>,

    /// Scan profile: minimal, standard, full.
    #[arg(long)]
    profile: Option<String>,

    /// Gateway WebSocket URL for terminal sessions (env: TB_GATEWAY_URL).
    #[arg(long)]
    gateway: Option<String>,

    /// SaaS base URL for upload (env: TB_URL).
    #[arg(long)]
    url: Option<String>,

    /// Agent permissions: scan, terminal.
    #[arg(long, value_delimiter = ',')]
    permissions: Vec<String>,

    /// Maximum concurrent terminal sessions.
    #[arg(long, default_value_t = 10)]
    max_sessions: usize,

    /// Simulate auto-remediations instead of executing them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Allow ws:// gateway endpoints (local development only).
    #[arg(long, default_value_t = false)]
    allow_insecure_gateway: bool,

    /// Config file path (default: platform-standard location).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (env: TB_LOG_LEVEL).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(cmd) => run_daemon(cmd).await,
        Commands::Status => {
            init_logging("warn");
            let code = status::run(VERSION)?;
            std::process::exit(code);
        }
        Commands::Version => {
            println!("tb-agent {VERSION}");
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run_daemon(cmd: DaemonCommand) -> Result<()> {
    let config_path = cmd.config.clone().unwrap_or_else(config::default_config_path);
    let file = config::load_file(&config_path)?;
    let resolved = config::resolve(config::ResolveInput {
        file,
        flag_url: cmd.url,
        flag_gateway: cmd.gateway,
        flag_profile: cmd.profile,
        flag_scan_interval: cmd.scan_interval,
        flag_permissions: cmd.permissions,
        flag_log_level: cmd.log_level,
    })?;
    init_logging(&resolved.log_level);

    let idle_timeout = config::parse_duration(&cmd.idle_timeout)?;
    let profile = Profile::parse(&resolved.profile)?;
    let verifying_key = resolved
        .signing_key
        .as_deref()
        .map(parse_verifying_key)
        .transpose()
        .context("parse TB_SIGNING_KEY")?;

    let identity = AgentIdentity::new(
        resolved.token,
        resolved.host_id,
        cmd.cluster_id,
        resolved.gateway_url,
        resolved.upstreams,
        resolved.permissions,
        Some(cmd.max_sessions),
        Some(idle_timeout),
        verifying_key,
    )?;

    // Cluster features light up only when the API is actually reachable
    // (in-cluster service account present).
    let cluster: Option<Arc<dyn ClusterApi>> = match HttpCluster::in_cluster() {
        Ok(cluster) => Some(Arc::new(cluster)),
        Err(error) => {
            tracing::info!(
                target = "tb_agent::main",
                reason = %error,
                "kubernetes features disabled"
            );
            None
        }
    };

    let agent = Arc::new(Agent::new(AgentConfig {
        identity,
        audit_path: audit::default_path(),
        profile,
        scan_interval: resolved.scan_interval,
        version: VERSION.into(),
        cluster,
        dry_run: cmd.dry_run,
        allow_insecure_gateway: cmd.allow_insecure_gateway,
        max_remediations_per_hour: None,
    })?);

    write_pid_file();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(target = "tb_agent::main", error = %error, "sigterm handler failed");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!(target = "tb_agent::main", "received SIGTERM, shutting down");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let result = agent.run(shutdown_rx).await;
    let _ = std::fs::remove_file(config::pid_path());
    result
}

fn write_pid_file() {
    let path = config::pid_path();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Err(error) = std::fs::write(&path, std::process::id().to_string()) {
        tracing::warn!(
            target = "tb_agent::main",
            path = %path.display(),
            error = %error,
            "failed to write pid file"
        );
    }
}

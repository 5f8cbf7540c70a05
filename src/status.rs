//! The `status` subcommand: platform / binary / config / running summary.

use std::path::Path;

use anyhow::Result;

use crate::config::{self, FileConfig};

pub struct StatusReport {
    pub platform: &'static str,
    pub binary_path: String,
    pub config_path: String,
    pub config: Option<FileConfig>,
    pub running: bool,
    pub pid: Option<u32>,
}

pub fn collect() -> StatusReport {
    let config_path = config::default_config_path();
    let config = config::load_file(&config_path).ok().filter(|c| c.token.is_some());

    let pid = read_pid();
    let running = pid.is_some_and(process_alive);

    StatusReport {
        platform: std::env::consts::OS,
        binary_path: std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        config_path: config_path.display().to_string(),
        config,
        running,
        pid,
    }
}

fn read_pid() -> Option<u32> {
    std::fs::read_to_string(config::pid_path())
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        return Path::new(&format!("/proc/{pid}")).exists();
    }
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Print the report. Returns the process exit code: 1 when a config is
/// installed but the daemon is not running, so scripts can branch on it.
pub fn run(version: &str) -> Result<i32> {
    let report = collect();

    println!("Platform:   {}", report.platform);
    println!(
        "Binary:     {}",
        if report.binary_path.is_empty() {
            "n/a"
        } else {
            &report.binary_path
        }
    );
    println!("Config:     {}", report.config_path);
    println!("Installed:  {}", yes_no(report.config.is_some()));
    println!("Running:    {}", yes_no(report.running));

    if let Some(config) = &report.config {
        println!();
        println!("Configuration:");
        if let Some(url) = &config.url {
            println!("  URL:      {url}");
        }
        if let Some(token) = &config.token {
            println!("  Token:    {}", config::mask_token(token));
        }
        if let Some(profile) = &config.profile {
            println!("  Profile:  {profile}");
        }
        if let Some(interval) = &config.scan_interval {
            println!("  Interval: {interval}");
        }
    }

    println!();
    println!("Version:    {version}");

    Ok(if report.running { 0 } else { 1 })
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

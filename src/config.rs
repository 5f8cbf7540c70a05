//! Configuration resolution for the tb-agent binary.
//!
//! Precedence: command-line flags, then `TB_*` environment variables, then
//! the YAML config file. Environment variables are consumed only here, at
//! startup; none of them are ever forwarded into PTY sessions.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use agent_core::identity::{parse_upstreams, Upstream};

/// YAML config file shape: `{token, url, profile, scan_interval, log_level,
/// permissions}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub token: Option<String>,
    pub url: Option<String>,
    pub profile: Option<String>,
    pub scan_interval: Option<String>,
    pub log_level: Option<String>,
    pub permissions: Option<Vec<String>>,
}

/// Platform-standard config file location.
pub fn default_config_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        home_dir().join(".tb-agent").join("config.yaml")
    } else {
        PathBuf::from("/etc/tb-agent/config.yaml")
    }
}

/// Where the daemon records its PID for `status`.
pub fn pid_path() -> PathBuf {
    home_dir().join(".tb-agent").join("agent.pid")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Load the YAML config file; a missing file is not an error.
pub fn load_file(path: &PathBuf) -> Result<FileConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_yaml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Parse durations of the form `90`, `30s`, `5m`, `2h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "s" | "" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        other => bail!("invalid duration unit {other:?} in {s:?}"),
    };
    Ok(Duration::from_secs(secs))
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Fully merged startup configuration.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub token: String,
    pub host_id: String,
    pub gateway_url: String,
    pub upstreams: Vec<Upstream>,
    pub profile: String,
    pub scan_interval: Duration,
    pub log_level: String,
    pub permissions: Vec<String>,
    pub signing_key: Option<String>,
}

pub struct ResolveInput {
    pub file: FileConfig,
    pub flag_url: Option<String>,
    pub flag_gateway: Option<String>,
    pub flag_profile: Option<String>,
    pub flag_scan_interval: Option<String>,
    pub flag_permissions: Vec<String>,
    pub flag_log_level: Option<String>,
}

/// Merge flags, environment, and file into one startup view. Fails when no
/// token can be found anywhere.
pub fn resolve(input: ResolveInput) -> Result<Resolved> {
    let token = env("TB_TOKEN")
        .or(input.file.token.clone())
        .context("no agent token (set TB_TOKEN or `token` in the config file)")?;

    let url = input.flag_url.or_else(|| env("TB_URL")).or(input.file.url);
    let anon_key = env("TB_ANON_KEY").unwrap_or_default();
    let gateway_url = input
        .flag_gateway
        .or_else(|| env("TB_GATEWAY_URL"))
        .unwrap_or_default();

    let upstreams = match env("TB_UPSTREAMS") {
        Some(raw) => parse_upstreams(&raw).context("parse TB_UPSTREAMS")?,
        None => match url {
            Some(url) => vec![Upstream {
                name: "default".into(),
                url,
                token: token.clone(),
                anon_key,
                permissions: vec![],
            }],
            None => vec![],
        },
    };

    // TB_IDENTITY selects how the agent identifies itself to the control
    // plane: "hostname" uses the host name, the default ("token") lets the
    // control plane key off the agent token.
    let host_id = match env("TB_IDENTITY").as_deref() {
        Some("hostname") => hostname(),
        _ => token.clone(),
    };

    let profile = input
        .flag_profile
        .or(input.file.profile)
        .unwrap_or_else(|| "standard".into());
    let scan_interval = match input.flag_scan_interval.or(input.file.scan_interval) {
        Some(raw) => parse_duration(&raw)?,
        None => Duration::from_secs(5 * 60),
    };
    let log_level = input
        .flag_log_level
        .or_else(|| env("TB_LOG_LEVEL"))
        .or(input.file.log_level)
        .unwrap_or_else(|| "info".into());
    let permissions = if !input.flag_permissions.is_empty() {
        input.flag_permissions
    } else {
        input
            .file
            .permissions
            .unwrap_or_else(|| vec!["scan".into()])
    };

    Ok(Resolved {
        token,
        host_id,
        gateway_url,
        upstreams,
        profile,
        scan_interval,
        log_level,
        permissions,
        signing_key: env("TB_SIGNING_KEY"),
    })
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown-host".into())
}

/// Mask a secret for display: first and last four characters only.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "****".into();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(file: FileConfig) -> ResolveInput {
        ResolveInput {
            file,
            flag_url: None,
            flag_gateway: None,
            flag_profile: None,
            flag_scan_interval: None,
            flag_permissions: vec![],
            flag_log_level: None,
        }
    }

    #[test]
    fn durations_parse_with_suffixes() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn file_config_supplies_defaults() {
        let resolved = resolve(input(FileConfig {
            token: Some("tok_file".into()),
            url: Some("https://ingest.example.dev".into()),
            profile: Some("full".into()),
            scan_interval: Some("10m".into()),
            log_level: Some("debug".into()),
            permissions: Some(vec!["scan".into(), "terminal".into()]),
        }))
        .unwrap();

        assert_eq!(resolved.token, "tok_file");
        assert_eq!(resolved.upstreams.len(), 1);
        assert_eq!(resolved.upstreams[0].url, "https://ingest.example.dev");
        assert_eq!(resolved.profile, "full");
        assert_eq!(resolved.scan_interval, Duration::from_secs(600));
        assert_eq!(resolved.log_level, "debug");
        assert_eq!(resolved.permissions, vec!["scan", "terminal"]);
    }

    #[test]
    fn flags_override_file() {
        let mut i = input(FileConfig {
            token: Some("tok".into()),
            profile: Some("minimal".into()),
            ..Default::default()
        });
        i.flag_profile = Some("full".into());
        i.flag_permissions = vec!["terminal".into()];
        let resolved = resolve(i).unwrap();
        assert_eq!(resolved.profile, "full");
        assert_eq!(resolved.permissions, vec!["terminal"]);
    }

    #[test]
    fn missing_token_is_fatal() {
        assert!(resolve(input(FileConfig::default())).is_err());
    }

    #[test]
    fn tokens_are_masked_for_display() {
        assert_eq!(mask_token("tok_1234567890"), "tok_...7890");
        assert_eq!(mask_token("short"), "****");
    }

    #[test]
    fn yaml_round_trips() {
        let raw = "token: tok_abc\nurl: https://x.example.dev\npermissions:\n  - scan\n";
        let parsed: FileConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(parsed.token.as_deref(), Some("tok_abc"));
        assert_eq!(parsed.permissions, Some(vec!["scan".to_string()]));
    }
}

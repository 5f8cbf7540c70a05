//! Append-only, hash-chained audit log.
//!
//! One JSON line per event. Each entry's `entry_hash` is
//! `SHA256(prev_entry_hash || serialized entry with entry_hash blanked)`,
//! so any edit, reorder, or deletion breaks every hash after it. The file
//! is opened 0600 in a 0700 directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    SessionOpen,
    SessionClose,
    Command,
    Blocked,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::SessionOpen => "SESSION_OPEN",
            AuditEventType::SessionClose => "SESSION_CLOSE",
            AuditEventType::Command => "COMMAND",
            AuditEventType::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

/// A single audit log entry. Field order is the serialization order and is
/// part of the hash-chain contract; do not reorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Stamped at log time when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: String,
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub entry_hash: String,
}

impl AuditEntry {
    pub fn new(session_id: impl Into<String>, event_type: AuditEventType) -> Self {
        AuditEntry {
            timestamp: None,
            session_id: session_id.into(),
            event_type,
            user_id: String::new(),
            origin: String::new(),
            input: String::new(),
            reason: String::new(),
            entry_hash: String::new(),
        }
    }

    pub fn with_actor(mut self, user_id: impl Into<String>, origin: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.origin = origin.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Writes hash-chained audit entries to a JSON-lines file.
///
/// Writes are serialized behind a mutex; the chain stays intact under
/// arbitrary interleaving of callers.
pub struct AuditLogger {
    inner: Mutex<LoggerInner>,
    path: PathBuf,
}

struct LoggerInner {
    file: File,
    prev_hash: String,
}

impl AuditLogger {
    /// Open (or create) the audit log, recovering the chain tail from the
    /// last non-empty line of an existing file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            create_private_dir(dir)
                .with_context(|| format!("audit: create dir {}", dir.display()))?;
        }

        let prev_hash = recover_prev_hash(&path).unwrap_or_default();

        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .with_context(|| format!("audit: open {}", path.display()))?;

        Ok(AuditLogger {
            inner: Mutex::new(LoggerInner { file, prev_hash }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, computing its hash-chain value.
    pub fn log(&self, mut entry: AuditEntry) -> Result<()> {
        let mut inner = self.inner.lock();

        if entry.timestamp.is_none() {
            entry.timestamp = Some(Utc::now());
        }

        entry.entry_hash = String::new();
        let raw = serde_json::to_vec(&entry).context("audit: serialize")?;
        entry.entry_hash = chain_hash(&inner.prev_hash, &raw);
        inner.prev_hash = entry.entry_hash.clone();

        let mut line = serde_json::to_vec(&entry).context("audit: serialize final")?;
        line.push(b'\n');
        inner.file.write_all(&line).context("audit: write")?;
        inner.file.flush().context("audit: flush")?;
        Ok(())
    }
}

fn chain_hash(prev_hash: &str, serialized: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serialized);
    hex::encode(hasher.finalize())
}

fn recover_prev_hash(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.ok()?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
            last = Some(entry.entry_hash);
        }
    }
    last
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Where the first broken link in a chain was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// 1-indexed line number.
    pub line: usize,
    pub stored_hash: String,
    pub computed_hash: String,
}

/// Re-read the log and recompute every hash from scratch. Returns the number
/// of verified entries, or the first break. A break signals tampering.
pub fn verify_chain(path: &Path) -> Result<std::result::Result<usize, ChainBreak>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Ok(0)),
        Err(err) => return Err(err).context("audit: open for verify"),
    };

    let mut prev_hash = String::new();
    let mut verified = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("audit: read line")?;
        if line.trim().is_empty() {
            continue;
        }
        let mut entry: AuditEntry =
            serde_json::from_str(&line).with_context(|| format!("audit: parse line {}", idx + 1))?;
        let stored_hash = std::mem::take(&mut entry.entry_hash);
        let raw = serde_json::to_vec(&entry)?;
        let computed_hash = chain_hash(&prev_hash, &raw);
        if computed_hash != stored_hash {
            return Ok(Err(ChainBreak {
                line: idx + 1,
                stored_hash,
                computed_hash,
            }));
        }
        prev_hash = stored_hash;
        verified += 1;
    }
    Ok(Ok(verified))
}

/// Platform-appropriate default audit log path.
pub fn default_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".tb-agent").join("audit.log")
    } else {
        PathBuf::from("/var/log/tb-agent/audit.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_verifies_after_sequence_of_logs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::open(&path).unwrap();

        logger
            .log(AuditEntry::new("s1", AuditEventType::SessionOpen).with_actor("admin", "saas"))
            .unwrap();
        logger
            .log(AuditEntry::new("s1", AuditEventType::Command))
            .unwrap();
        logger
            .log(
                AuditEntry::new("s2", AuditEventType::Blocked)
                    .with_reason("duplicate nonce (replay detected)"),
            )
            .unwrap();
        logger
            .log(AuditEntry::new("s1", AuditEventType::SessionClose))
            .unwrap();

        assert_eq!(verify_chain(&path).unwrap(), Ok(4));
    }

    #[test]
    fn chain_continues_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let logger = AuditLogger::open(&path).unwrap();
            logger
                .log(AuditEntry::new("s1", AuditEventType::SessionOpen))
                .unwrap();
        }
        {
            let logger = AuditLogger::open(&path).unwrap();
            logger
                .log(AuditEntry::new("s1", AuditEventType::SessionClose))
                .unwrap();
        }

        assert_eq!(verify_chain(&path).unwrap(), Ok(2));
    }

    #[test]
    fn tampered_entry_breaks_the_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::open(&path).unwrap();
        logger
            .log(AuditEntry::new("s1", AuditEventType::SessionOpen))
            .unwrap();
        logger
            .log(AuditEntry::new("s1", AuditEventType::SessionClose))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen("\"s1\"", "\"s9\"", 1);
        std::fs::write(&path, tampered).unwrap();

        let result = verify_chain(&path).unwrap().unwrap_err();
        assert_eq!(result.line, 1);
    }

    #[test]
    fn missing_file_verifies_empty() {
        let dir = tempdir().unwrap();
        assert_eq!(verify_chain(&dir.path().join("none.log")).unwrap(), Ok(0));
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_denies_other_users() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("audit.log");
        let logger = AuditLogger::open(&path).unwrap();
        logger
            .log(AuditEntry::new("s1", AuditEventType::SessionOpen))
            .unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}

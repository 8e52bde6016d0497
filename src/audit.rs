//! Audit log of publish and rollback events.
//!
//! Records metadata about every package the coordinator publishes, enabling
//! post-hoc reconstruction of which round produced which version and which
//! versions restore earlier ones. When backed by a file, each entry is also
//! appended as one JSON line.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlError;

/// Metadata for a single published version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Registry version that was published.
    pub version: u64,
    /// Round whose aggregate the version carries.
    pub base_round: u64,
    /// Number of contributions averaged (0 for bootstrap and rollback).
    pub n_clients: usize,
    /// Version restored by this package, for rollbacks.
    pub rollback_of: Option<u64>,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit log.
#[derive(Clone, Debug, Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Create a new, in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a JSON-lines log, loading any entries already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<Vec<AuditEntry>, _>>()
                .map_err(|e| FlError::Config(format!("audit log {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    /// Append an entry, persisting it first when file-backed.
    pub fn push(&mut self, entry: AuditEntry) -> Result<(), FlError> {
        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&entry)
                .map_err(|e| FlError::Config(e.to_string()))?;
            line.push('\n');
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .write_all(line.as_bytes())?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Get all entries.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the audit log to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: u64, rollback_of: Option<u64>) -> AuditEntry {
        AuditEntry {
            version,
            base_round: version.saturating_sub(1),
            n_clients: 3,
            rollback_of,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_audit_log_push_and_len() {
        let mut log = AuditLog::new();
        assert!(log.is_empty());

        log.push(entry(1, None)).unwrap();

        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
        assert_eq!(log.entries()[0].version, 1);
        assert_eq!(log.entries()[0].n_clients, 3);
    }

    #[test]
    fn test_audit_log_persists_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.push(entry(1, None)).unwrap();
            log.push(entry(2, Some(0))).unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        let reopened = AuditLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.entries()[1].rollback_of, Some(0));
    }

    #[test]
    fn test_audit_log_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        assert!(AuditLog::open(&path).is_err());
    }

    #[test]
    fn test_audit_entry_serde() {
        let e = entry(4, Some(2));
        let json = serde_json::to_string(&e).unwrap();
        let restored: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, e);
    }
}

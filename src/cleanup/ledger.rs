//! Durable retention ledger: which uploaded artifacts must be deleted, and when.
//!
//! On disk the ledger is a pretty-printed JSON array of records:
//!
//! ```json
//! [{"local_path": "...", "remote_id": "...", "created_at": "2025-01-01T12:00:00Z",
//!   "display_name": "usb_transfer_20250101_120000.zip", "retention_days": 7}]
//! ```

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SafegateError};
use crate::core::persist::write_json_atomic;

/// An artifact registered for deletion after its retention period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    pub local_path: PathBuf,
    pub remote_id: String,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub retention_days: u32,
}

impl CleanupEntry {
    #[must_use]
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_id: impl Into<String>,
        created_at: DateTime<Utc>,
        retention_days: u32,
    ) -> Self {
        let local_path = local_path.into();
        let display_name = local_path.file_name().map_or_else(
            || local_path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        Self {
            local_path,
            remote_id: remote_id.into(),
            created_at,
            display_name,
            retention_days,
        }
    }

    /// Saturates at the latest representable instant.
    #[must_use]
    pub fn due_at(&self) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(TimeDelta::days(i64::from(self.retention_days)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whole days since creation (truncated).
    #[must_use]
    pub fn days_elapsed(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_days()
    }

    /// Zero or negative means the entry is waiting for the next sweep.
    #[must_use]
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        i64::from(self.retention_days) - self.days_elapsed(now)
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.days_elapsed(now) >= i64::from(self.retention_days)
    }

    /// Manual operations address entries by display name, remote id, or local path.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.display_name == name || self.remote_id == name || self.local_path == Path::new(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    local_path: PathBuf,
    remote_id: String,
    created_at: String,
    #[serde(default)]
    display_name: String,
    retention_days: u32,
}

impl From<&CleanupEntry> for LedgerRecord {
    fn from(entry: &CleanupEntry) -> Self {
        Self {
            local_path: entry.local_path.clone(),
            remote_id: entry.remote_id.clone(),
            created_at: entry
                .created_at
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            display_name: entry.display_name.clone(),
            retention_days: entry.retention_days,
        }
    }
}

/// Result of reading a ledger file.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub entries: Vec<CleanupEntry>,
    /// Records skipped because they could not be interpreted.
    pub dropped: usize,
}

/// Load the ledger. A missing file is an empty ledger; unreadable individual
/// records are dropped with a warning; an unparsable document is
/// `LedgerCorrupt`.
pub fn load_ledger(path: &Path) -> Result<LoadOutcome> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadOutcome::default()),
        Err(source) => return Err(SafegateError::io(path, source)),
    };
    if raw.trim().is_empty() {
        return Ok(LoadOutcome::default());
    }

    let values: Vec<serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| SafegateError::LedgerCorrupt {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;

    let mut outcome = LoadOutcome::default();
    for (index, value) in values.into_iter().enumerate() {
        let record = match serde_json::from_value::<LedgerRecord>(value) {
            Ok(record) => record,
            Err(e) => {
                eprintln!("[SG-CLEANUP] dropping ledger record #{index}: {e}");
                outcome.dropped += 1;
                continue;
            }
        };
        let Some(created_at) = parse_timestamp(&record.created_at) else {
            eprintln!(
                "[SG-CLEANUP] dropping ledger record #{index}: unparsable timestamp {:?}",
                record.created_at
            );
            outcome.dropped += 1;
            continue;
        };
        let mut entry = CleanupEntry::new(
            record.local_path,
            record.remote_id,
            created_at,
            record.retention_days,
        );
        if !record.display_name.is_empty() {
            entry.display_name = record.display_name;
        }
        outcome.entries.push(entry);
    }
    Ok(outcome)
}

/// Replace the ledger on disk with `entries`.
pub fn save_ledger(path: &Path, entries: &[CleanupEntry]) -> Result<()> {
    let records: Vec<LedgerRecord> = entries.iter().map(LedgerRecord::from).collect();
    write_json_atomic(path, &records)
}

/// Move an unreadable ledger aside so the next save does not destroy it.
pub fn quarantine_ledger(path: &Path) -> Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    let target = PathBuf::from(name);
    fs::rename(path, &target).map_err(|source| SafegateError::io(path, source))?;
    Ok(target)
}

/// RFC 3339, or a naive ISO-8601 timestamp interpreted as local time.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

//! Status Reporter: the process-wide last-known-status record.
//!
//! Every mutation happens under one lock and is immediately persisted to
//! `status.json` (write to `.tmp`, then `rename()`), so `safegate status` or any
//! other process can poll a consistent snapshot without an RPC channel.
//! Persistence failures are reported on stderr; the in-memory record stays
//! authoritative for the life of the process.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::persist::write_json_atomic;
use crate::logger::jsonl::format_utc_now;

// ──────────────────── schema ────────────────────

/// Coarse service phase shown to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePhase {
    #[default]
    Stopped,
    Idle,
    Processing,
    Scanning,
    Uploading,
    Success,
    Warning,
    Error,
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Scanning => "scanning",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub message: String,
}

/// The persisted status record. `#[serde(default)]` keeps older or newer
/// writers readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceStatus {
    pub phase: ServicePhase,
    pub message: String,
    pub last_activity: Option<String>,
    pub processing_count: u64,
    /// Oldest first, capped at the configured ring size.
    pub errors: Vec<ErrorRecord>,
    pub uptime_seconds: u64,
    pub started_at: String,
    pub last_updated: String,
    pub pid: u32,
    pub version: String,
}

impl ServiceStatus {
    /// Whether the process that wrote this record is still running.
    #[must_use]
    pub fn writer_alive(&self) -> bool {
        self.phase != ServicePhase::Stopped && process_alive(self.pid)
    }
}

// ──────────────────── reporter ────────────────────

struct Inner {
    status: ServiceStatus,
    errors: VecDeque<ErrorRecord>,
    max_errors: usize,
    path: Option<PathBuf>,
    started: Instant,
    persist_failing: bool,
}

impl Inner {
    fn refresh_and_persist(&mut self) {
        self.status.uptime_seconds = self.started.elapsed().as_secs();
        self.status.last_updated = format_utc_now();
        self.status.errors = self.errors.iter().cloned().collect();

        let Some(path) = &self.path else {
            return;
        };
        match write_json_atomic(path, &self.status) {
            Ok(()) => {
                if self.persist_failing {
                    eprintln!("[SG-STATUS] status file writable again: {}", path.display());
                }
                self.persist_failing = false;
            }
            Err(e) => {
                // Report once per failure streak; every mutation would otherwise spam.
                if !self.persist_failing {
                    eprintln!("[SG-STATUS] failed to persist status: {e}");
                }
                self.persist_failing = true;
            }
        }
    }
}

/// Cloneable, lock-guarded handle to the shared status record.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Mutex<Inner>>,
}

impl StatusReporter {
    /// Reporter persisting to `path`. Writes an initial `stopped` record.
    pub fn new(path: impl Into<PathBuf>, max_errors: usize) -> Self {
        Self::build(Some(path.into()), max_errors)
    }

    /// Reporter that never touches disk.
    #[must_use]
    pub fn in_memory(max_errors: usize) -> Self {
        Self::build(None, max_errors)
    }

    fn build(path: Option<PathBuf>, max_errors: usize) -> Self {
        let now = format_utc_now();
        let mut inner = Inner {
            status: ServiceStatus {
                phase: ServicePhase::Stopped,
                message: "Service not started".to_string(),
                started_at: now,
                pid: std::process::id(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..ServiceStatus::default()
            },
            errors: VecDeque::new(),
            max_errors: max_errors.max(1),
            path,
            started: Instant::now(),
            persist_failing: false,
        };
        inner.refresh_and_persist();
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Set phase and message, stamping `last_activity`.
    pub fn set(&self, phase: ServicePhase, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.status.phase = phase;
        inner.status.message = message.into();
        inner.status.last_activity = Some(format_utc_now());
        inner.refresh_and_persist();
    }

    /// Append to the bounded error ring without changing the phase.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        push_error(&mut inner, message.into());
        inner.refresh_and_persist();
    }

    /// Enter the error phase and record the message in the ring, atomically.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.inner.lock();
        inner.status.phase = ServicePhase::Error;
        inner.status.message.clone_from(&message);
        inner.status.last_activity = Some(format_utc_now());
        push_error(&mut inner, message);
        inner.refresh_and_persist();
    }

    pub fn increment_processed(&self) {
        let mut inner = self.inner.lock();
        inner.status.processing_count += 1;
        inner.refresh_and_persist();
    }

    /// Current record with a fresh uptime.
    #[must_use]
    pub fn snapshot(&self) -> ServiceStatus {
        let inner = self.inner.lock();
        let mut status = inner.status.clone();
        status.uptime_seconds = inner.started.elapsed().as_secs();
        status.errors = inner.errors.iter().cloned().collect();
        status
    }

    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    /// Read a status record written by any process.
    pub fn read_status(path: &Path) -> std::result::Result<ServiceStatus, String> {
        let raw = fs::read_to_string(path).map_err(|e| format!("cannot read status file: {e}"))?;
        serde_json::from_str(&raw).map_err(|e| format!("invalid status file: {e}"))
    }
}

fn push_error(inner: &mut Inner, message: String) {
    inner.errors.push_back(ErrorRecord {
        timestamp: format_utc_now(),
        message,
    });
    while inner.errors.len() > inner.max_errors {
        inner.errors.pop_front();
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 probes existence; EPERM still means the process exists.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

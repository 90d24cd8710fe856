//! Cleanup Scheduler: owns the retention ledger and enacts due deletions.
//!
//! The in-memory entry list is guarded by a mutex; every add or removal is
//! persisted before the lock is released. Sweeps snapshot the due entries,
//! delete without holding the ledger lock (remote deletes are slow), then
//! re-lock to drop the confirmed entries and persist once.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::cleanup::ledger::{CleanupEntry, load_ledger, quarantine_ledger, save_ledger};
use crate::core::errors::{Result, SafegateError};
use crate::daemon::shutdown::ShutdownToken;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, emit};
use crate::pipeline::collaborators::Uploader;

/// Tally of one sweep or forced cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub due: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Per-entry view for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    pub display_name: String,
    pub remote_id: String,
    pub local_path: PathBuf,
    pub created_at: String,
    pub retention_days: u32,
    pub days_elapsed: i64,
    /// Zero or negative: eligible, waiting for the next sweep.
    pub days_remaining: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStatus {
    pub total_scheduled: usize,
    pub pending: usize,
    pub expired: usize,
    pub entries: Vec<EntryStatus>,
}

/// Cadence of the background loop.
#[derive(Debug, Clone, Copy)]
pub struct SweepCadence {
    pub interval: Duration,
    /// How often the idle loop checks for shutdown or a manual trigger.
    pub poll: Duration,
}

pub struct CleanupScheduler {
    ledger_path: PathBuf,
    default_retention_days: u32,
    entries: Mutex<Vec<CleanupEntry>>,
    /// Serializes sweeps and forced cleanups so an entry is never deleted twice concurrently.
    sweep_lock: Mutex<()>,
    remote: Arc<dyn Uploader>,
    logger: Option<ActivityLoggerHandle>,
}

impl CleanupScheduler {
    /// Load the ledger at `ledger_path`. Never fails: unreadable ledgers are
    /// reported and the scheduler starts with whatever could be recovered.
    pub fn open(
        ledger_path: impl Into<PathBuf>,
        default_retention_days: u32,
        remote: Arc<dyn Uploader>,
        logger: Option<ActivityLoggerHandle>,
    ) -> Self {
        let ledger_path = ledger_path.into();
        let entries = match load_ledger(&ledger_path) {
            Ok(outcome) => {
                if outcome.dropped > 0 {
                    eprintln!(
                        "[SG-CLEANUP] loaded {} ledger entries, dropped {} unreadable",
                        outcome.entries.len(),
                        outcome.dropped
                    );
                }
                outcome.entries
            }
            Err(err @ SafegateError::LedgerCorrupt { .. }) => {
                eprintln!("[SG-CLEANUP] {err}; starting with an empty schedule");
                match quarantine_ledger(&ledger_path) {
                    Ok(moved) => eprintln!("[SG-CLEANUP] corrupt ledger kept at {}", moved.display()),
                    Err(e) => eprintln!("[SG-CLEANUP] could not move corrupt ledger aside: {e}"),
                }
                Vec::new()
            }
            Err(err) => {
                eprintln!("[SG-CLEANUP] failed to load ledger: {err}");
                emit(
                    logger.as_ref(),
                    ActivityEvent::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                );
                Vec::new()
            }
        };

        Self {
            ledger_path,
            default_retention_days,
            entries: Mutex::new(entries),
            sweep_lock: Mutex::new(()),
            remote,
            logger,
        }
    }

    #[must_use]
    pub fn default_retention_days(&self) -> u32 {
        self.default_retention_days
    }

    #[must_use]
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Register an uploaded artifact with the default retention period.
    pub fn schedule(&self, local_path: &Path, remote_id: &str) -> CleanupEntry {
        self.add_manual_cleanup(local_path, remote_id, self.default_retention_days)
    }

    /// Register an artifact with a caller-chosen retention period.
    pub fn add_manual_cleanup(
        &self,
        local_path: &Path,
        remote_id: &str,
        retention_days: u32,
    ) -> CleanupEntry {
        let entry = CleanupEntry::new(local_path, remote_id, Utc::now(), retention_days);
        self.insert(entry.clone());
        entry
    }

    /// Append an entry and persist.
    pub fn insert(&self, entry: CleanupEntry) {
        emit(
            self.logger.as_ref(),
            ActivityEvent::CleanupScheduled {
                path: entry.local_path.display().to_string(),
                remote_id: entry.remote_id.clone(),
                retention_days: entry.retention_days,
            },
        );
        let mut entries = self.entries.lock();
        entries.push(entry);
        self.persist(&entries);
    }

    /// Drop an entry without deleting anything. Returns whether one matched.
    pub fn remove_from_schedule(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.matches(name));
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries);
        }
        removed
    }

    #[must_use]
    pub fn entries(&self) -> Vec<CleanupEntry> {
        self.entries.lock().clone()
    }

    /// Delete every entry whose retention has elapsed at `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.sweep_lock.lock();
        let snapshot = self.entries();
        let due: Vec<CleanupEntry> = snapshot
            .iter()
            .filter(|entry| entry.is_due(now))
            .cloned()
            .collect();
        let mut report = self.delete_entries(due);
        report.examined = snapshot.len();
        report
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Delete one named entry, or every entry, regardless of due time.
    pub fn force_cleanup(&self, name: Option<&str>) -> SweepReport {
        let _guard = self.sweep_lock.lock();
        let snapshot = self.entries();
        let targets: Vec<CleanupEntry> = snapshot
            .iter()
            .filter(|entry| name.is_none_or(|n| entry.matches(n)))
            .cloned()
            .collect();
        let mut report = self.delete_entries(targets);
        report.examined = snapshot.len();
        report
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> LedgerStatus {
        let entries = self.entries.lock();
        let mut status = LedgerStatus {
            total_scheduled: entries.len(),
            ..LedgerStatus::default()
        };
        for entry in entries.iter() {
            let remaining = entry.days_remaining(now);
            if remaining <= 0 {
                status.expired += 1;
            } else {
                status.pending += 1;
            }
            status.entries.push(EntryStatus {
                display_name: entry.display_name.clone(),
                remote_id: entry.remote_id.clone(),
                local_path: entry.local_path.clone(),
                created_at: entry.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                retention_days: entry.retention_days,
                days_elapsed: entry.days_elapsed(now),
                days_remaining: remaining,
            });
        }
        status
    }

    pub fn status(&self) -> LedgerStatus {
        self.status_at(Utc::now())
    }

    // ──────────────────── background loop ────────────────────

    /// Sweep immediately, then once per `cadence.interval` until cancelled.
    /// Setting `trigger` requests an early sweep.
    pub fn run(&self, cadence: SweepCadence, token: &ShutdownToken, trigger: Option<&AtomicBool>) {
        eprintln!(
            "[SG-CLEANUP] scheduler started: {} entries, sweep every {}s",
            self.entries.lock().len(),
            cadence.interval.as_secs()
        );
        loop {
            let report = self.sweep();
            if report.due > 0 {
                eprintln!(
                    "[SG-CLEANUP] sweep: {} due, {} deleted, {} retained after failure",
                    report.due, report.deleted, report.failed
                );
            }
            if !wait_for_next_sweep(cadence, token, trigger) {
                break;
            }
        }
        eprintln!("[SG-CLEANUP] scheduler stopped");
    }

    pub fn spawn(
        self: &Arc<Self>,
        cadence: SweepCadence,
        token: ShutdownToken,
        trigger: Option<Arc<AtomicBool>>,
    ) -> Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        thread::Builder::new()
            .name("sg-cleanup".to_string())
            .spawn(move || scheduler.run(cadence, &token, trigger.as_deref()))
            .map_err(|e| SafegateError::Runtime {
                details: format!("failed to spawn cleanup thread: {e}"),
            })
    }

    // ──────────────────── internals ────────────────────

    fn delete_entries(&self, targets: Vec<CleanupEntry>) -> SweepReport {
        let mut report = SweepReport {
            due: targets.len(),
            ..SweepReport::default()
        };
        if targets.is_empty() {
            return report;
        }

        let mut confirmed = Vec::new();
        for entry in targets {
            let local_ok = remove_local(&entry.local_path);
            let remote_ok = self.remote.delete(&entry.remote_id);
            if local_ok && remote_ok {
                emit(
                    self.logger.as_ref(),
                    ActivityEvent::ArtifactDeleted {
                        path: entry.local_path.display().to_string(),
                        remote_id: entry.remote_id.clone(),
                    },
                );
                confirmed.push(entry);
            } else {
                eprintln!(
                    "[SG-CLEANUP] deletion of {} incomplete (local_ok={local_ok} remote_ok={remote_ok}); retrying next sweep",
                    entry.display_name
                );
                emit(
                    self.logger.as_ref(),
                    ActivityEvent::ArtifactDeletionFailed {
                        path: entry.local_path.display().to_string(),
                        remote_id: entry.remote_id.clone(),
                        local_ok,
                        remote_ok,
                    },
                );
                report.failed += 1;
            }
        }

        report.deleted = confirmed.len();
        if !confirmed.is_empty() {
            let mut entries = self.entries.lock();
            entries.retain(|entry| !confirmed.contains(entry));
            self.persist(&entries);
        }
        report
    }

    fn persist(&self, entries: &[CleanupEntry]) {
        if let Err(err) = save_ledger(&self.ledger_path, entries) {
            eprintln!("[SG-CLEANUP] failed to persist ledger: {err}");
            emit(
                self.logger.as_ref(),
                ActivityEvent::LedgerPersistFailed {
                    path: self.ledger_path.display().to_string(),
                    error: err.to_string(),
                },
            );
        }
    }
}

/// An already-missing local file counts as deleted.
fn remove_local(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            eprintln!("[SG-CLEANUP] cannot remove {}: {e}", path.display());
            false
        }
    }
}

/// Returns `false` on shutdown, `true` when the next sweep should run.
fn wait_for_next_sweep(
    cadence: SweepCadence,
    token: &ShutdownToken,
    trigger: Option<&AtomicBool>,
) -> bool {
    let deadline = Instant::now() + cadence.interval;
    let slice = cadence.poll.max(Duration::from_millis(1));
    loop {
        if token.is_cancelled() {
            return false;
        }
        if trigger.is_some_and(|flag| flag.swap(false, Ordering::SeqCst)) {
            eprintln!("[SG-CLEANUP] manual sweep requested");
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
}

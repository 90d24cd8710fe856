//! Activity logger: a dedicated thread owns the `JsonlWriter`; every other
//! thread sends `ActivityEvent`s through a bounded crossbeam channel using
//! `try_send()`, so the monitor and worker are never blocked by logging.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, SafegateError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

/// Events recorded in the activity log.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    ObserverSelected {
        strategy: String,
    },
    ObserverFallback {
        from: String,
        to: String,
        reason: String,
    },
    DeviceInserted {
        device: String,
        label: String,
        mount_point: Option<String>,
    },
    DeviceUnverified {
        device: String,
    },
    DeviceRemoved {
        device: String,
        label: String,
    },
    JobQueued {
        device: String,
        depth: usize,
    },
    JobDropped {
        device: String,
        reason: String,
    },
    MalwareDetected {
        device: String,
        infected: usize,
    },
    PipelineStopped {
        device: String,
        stage: String,
        reason: String,
    },
    PipelineCompleted {
        device: String,
        remote_id: String,
        files: usize,
        duration_ms: u64,
    },
    OrphanedUpload {
        remote_id: String,
        reason: String,
    },
    CleanupScheduled {
        path: String,
        remote_id: String,
        retention_days: u32,
    },
    ArtifactDeleted {
        path: String,
        remote_id: String,
    },
    ArtifactDeletionFailed {
        path: String,
        remote_id: String,
        local_ok: bool,
        remote_ok: bool,
    },
    LedgerPersistFailed {
        path: String,
        error: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel that stops the logger thread.
    Shutdown,
}

// ──────────────────── public handle ────────────────────

/// Cheaply cloneable handle for sending log events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Non-blocking send. A full channel drops the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Send through an optional handle; components run without a logger in tests.
pub(crate) fn emit(logger: Option<&ActivityLoggerHandle>, event: ActivityEvent) {
    if let Some(handle) = logger {
        handle.send(event);
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread.
pub fn spawn_logger(
    jsonl_config: JsonlConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(CHANNEL_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("sg-logger".to_string())
        .spawn(move || logger_thread_main(&rx, jsonl_config, &dropped))
        .map_err(|e| SafegateError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&event_to_log_entry(&event));
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e
        }
        ActivityEvent::ObserverSelected { strategy } => {
            let mut e = LogEntry::new(EventType::ObserverSelected, Severity::Info);
            e.details = Some(strategy.clone());
            e
        }
        ActivityEvent::ObserverFallback { from, to, reason } => {
            let mut e = LogEntry::new(EventType::ObserverFallback, Severity::Warning);
            e.details = Some(format!("{from}->{to}"));
            e.error_message = Some(reason.clone());
            e
        }
        ActivityEvent::DeviceInserted {
            device,
            label,
            mount_point,
        } => {
            let mut e = LogEntry::new(EventType::DeviceInserted, Severity::Info);
            e.device = Some(device.clone());
            e.label = Some(label.clone());
            e.mount_point.clone_from(mount_point);
            e
        }
        ActivityEvent::DeviceUnverified { device } => {
            let mut e = LogEntry::new(EventType::DeviceUnverified, Severity::Warning);
            e.device = Some(device.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::DeviceRemoved { device, label } => {
            let mut e = LogEntry::new(EventType::DeviceRemoved, Severity::Info);
            e.device = Some(device.clone());
            e.label = Some(label.clone());
            e
        }
        ActivityEvent::JobQueued { device, depth } => {
            let mut e = LogEntry::new(EventType::JobQueued, Severity::Info);
            e.device = Some(device.clone());
            e.count = Some(*depth as u64);
            e
        }
        ActivityEvent::JobDropped { device, reason } => {
            let mut e = LogEntry::new(EventType::JobDropped, Severity::Warning);
            e.device = Some(device.clone());
            e.error_message = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::MalwareDetected { device, infected } => {
            let mut e = LogEntry::new(EventType::MalwareDetected, Severity::Critical);
            e.device = Some(device.clone());
            e.count = Some(*infected as u64);
            e
        }
        ActivityEvent::PipelineStopped {
            device,
            stage,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::PipelineStopped, Severity::Warning);
            e.device = Some(device.clone());
            e.stage = Some(stage.clone());
            e.error_message = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::PipelineCompleted {
            device,
            remote_id,
            files,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::PipelineCompleted, Severity::Info);
            e.device = Some(device.clone());
            e.remote_id = Some(remote_id.clone());
            e.count = Some(*files as u64);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::OrphanedUpload { remote_id, reason } => {
            let mut e = LogEntry::new(EventType::OrphanedUpload, Severity::Warning);
            e.remote_id = Some(remote_id.clone());
            e.error_message = Some(reason.clone());
            e
        }
        ActivityEvent::CleanupScheduled {
            path,
            remote_id,
            retention_days,
        } => {
            let mut e = LogEntry::new(EventType::CleanupScheduled, Severity::Info);
            e.path = Some(path.clone());
            e.remote_id = Some(remote_id.clone());
            e.count = Some(u64::from(*retention_days));
            e
        }
        ActivityEvent::ArtifactDeleted { path, remote_id } => {
            let mut e = LogEntry::new(EventType::ArtifactDelete, Severity::Info);
            e.path = Some(path.clone());
            e.remote_id = Some(remote_id.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::ArtifactDeletionFailed {
            path,
            remote_id,
            local_ok,
            remote_ok,
        } => {
            let mut e = LogEntry::new(EventType::ArtifactDelete, Severity::Warning);
            e.path = Some(path.clone());
            e.remote_id = Some(remote_id.clone());
            e.ok = Some(false);
            e.details = Some(format!("local_ok={local_ok} remote_ok={remote_ok}"));
            e
        }
        ActivityEvent::LedgerPersistFailed { path, error } => {
            let mut e = LogEntry::new(EventType::LedgerPersist, Severity::Warning);
            e.path = Some(path.clone());
            e.error_message = Some(error.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::DaemonStop, Severity::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn logger_thread_writes_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let (handle, join) = spawn_logger(JsonlConfig::at(path.clone(), None)).unwrap();

        handle.send(ActivityEvent::DeviceInserted {
            device: "/dev/sdb1".to_string(),
            label: "STICK".to_string(),
            mount_point: Some("/media/pi/STICK".to_string()),
        });
        handle.send(ActivityEvent::ArtifactDeletionFailed {
            path: "/tmp/a.zip".to_string(),
            remote_id: "USB_Transfers/a.zip".to_string(),
            local_ok: true,
            remote_ok: false,
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "device_inserted");
        assert_eq!(lines[0]["mount_point"], "/media/pi/STICK");
        assert_eq!(lines[1]["event"], "artifact_delete");
        assert_eq!(lines[1]["ok"], false);
        assert_eq!(lines[1]["details"], "local_ok=true remote_ok=false");
    }

    #[test]
    fn full_channel_counts_drops_without_blocking() {
        let (tx, _rx) = bounded::<ActivityEvent>(1);
        let handle = ActivityLoggerHandle {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..5 {
            handle.send(ActivityEvent::ObserverSelected {
                strategy: "polling".to_string(),
            });
        }
        assert_eq!(handle.dropped_events(), 4);
    }

    #[test]
    fn malware_event_is_critical() {
        let entry = event_to_log_entry(&ActivityEvent::MalwareDetected {
            device: "/dev/sdb1".to_string(),
            infected: 2,
        });
        assert_eq!(entry.severity, Severity::Critical);
        assert_eq!(entry.count, Some(2));
    }
}

//! Processing Worker: drains the work queue one job at a time and drives the
//! per-device pipeline to completion before taking the next.
//!
//! Stage order (short-circuits on the first failure or terminal condition):
//! scan → infection gate → archive → upload → share link → recipient →
//! notify → schedule cleanup. A failure after upload leaves an orphaned
//! remote artifact; it is reported but never rolled back.

#![allow(missing_docs)]

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cleanup::scheduler::CleanupScheduler;
use crate::core::errors::{Result, SafegateError};
use crate::daemon::shutdown::ShutdownToken;
use crate::daemon::status::{ServicePhase, StatusReporter};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, emit};
use crate::pipeline::collaborators::{Collaborators, UploadOutcome};
use crate::pipeline::queue::{ProcessingJob, WorkQueue};

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Uploaded, shared, notified and registered for cleanup.
    Completed { remote_id: String, files: usize },
    /// At least one infected file; nothing was uploaded.
    Infected { infected: usize },
    /// Scan found no transferable files.
    NothingToDo,
    /// A stage failed before anything reached the server.
    Stopped { stage: &'static str, reason: String },
    /// A stage failed after upload; the remote artifact has no cleanup entry.
    Orphaned { remote_id: String, reason: String },
    /// A collaborator panicked.
    Panicked,
}

pub struct ProcessingWorker {
    queue: WorkQueue,
    collaborators: Collaborators,
    status: StatusReporter,
    scheduler: Arc<CleanupScheduler>,
    logger: Option<ActivityLoggerHandle>,
    dequeue_timeout: Duration,
}

impl ProcessingWorker {
    #[must_use]
    pub fn new(
        queue: WorkQueue,
        collaborators: Collaborators,
        status: StatusReporter,
        scheduler: Arc<CleanupScheduler>,
        logger: Option<ActivityLoggerHandle>,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            collaborators,
            status,
            scheduler,
            logger,
            dequeue_timeout,
        }
    }

    /// Drain the queue until `token` is cancelled. A job already in flight
    /// runs to completion first.
    pub fn run(&self, token: &ShutdownToken) {
        eprintln!("[SG-WORKER] processing worker started");
        while !token.is_cancelled() {
            let Some(job) = self.queue.dequeue_timeout(self.dequeue_timeout) else {
                continue;
            };
            let outcome = self.process(&job);
            self.status.increment_processed();
            eprintln!(
                "[SG-WORKER] finished {} after {}ms in queue: {outcome:?}",
                job.device.path.display(),
                job.waited().as_millis()
            );
        }
        eprintln!("[SG-WORKER] processing worker stopped");
    }

    pub fn spawn(self, token: ShutdownToken) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("sg-worker".to_string())
            .spawn(move || self.run(&token))
            .map_err(|e| SafegateError::Runtime {
                details: format!("failed to spawn worker thread: {e}"),
            })
    }

    /// Run one job through the pipeline. A panicking collaborator fails this
    /// job only.
    pub fn process(&self, job: &ProcessingJob) -> JobOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_pipeline(job))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let message = format!(
                    "Processing error on {}: {detail}",
                    job.device.display_name()
                );
                eprintln!("[SG-WORKER] {message}");
                self.status.fail(&message);
                emit(
                    self.logger.as_ref(),
                    ActivityEvent::Error {
                        code: "SG-3900".to_string(),
                        message,
                    },
                );
                JobOutcome::Panicked
            }
        }
    }

    fn run_pipeline(&self, job: &ProcessingJob) -> JobOutcome {
        let started = Instant::now();
        let device = &job.device;
        let name = device.display_name();
        let c = &self.collaborators;

        let Some(mount_point) = device.mount_point.as_deref() else {
            return self.stop(&name, "eligibility", format!("Device {name} is not mounted"));
        };

        // ── scan ──
        self.status.set(
            ServicePhase::Scanning,
            format!("Scanning files in {}", mount_point.display()),
        );
        let report = match c.scanner.scan(mount_point) {
            Ok(report) => report,
            Err(e) => return self.stop(&name, "scan", format!("Scan failed: {e}")),
        };

        if !report.is_clean() {
            let count = report.infected.len();
            c.alerter.infection_alert(&name, &report.infected);
            self.status
                .fail(format!("Malware detected! {count} infected files on {name}"));
            emit(
                self.logger.as_ref(),
                ActivityEvent::MalwareDetected {
                    device: device.path.display().to_string(),
                    infected: count,
                },
            );
            return JobOutcome::Infected { infected: count };
        }

        if report.safe.is_empty() {
            self.status
                .set(ServicePhase::Idle, format!("No files found on {name}"));
            return JobOutcome::NothingToDo;
        }
        let file_count = report.safe.len();

        // ── archive ──
        self.status.set(
            ServicePhase::Processing,
            format!("Creating archive from {file_count} files"),
        );
        let Some(archive) = c.archiver.archive(&report.safe) else {
            return self.stop(&name, "archive", "Failed to create archive".to_string());
        };

        // ── upload ──
        self.status
            .set(ServicePhase::Uploading, format!("Uploading {}", file_label(&archive)));
        let remote_id = match c.uploader.upload(&archive) {
            UploadOutcome::Uploaded { remote_id } => remote_id,
            UploadOutcome::Failed { reason } => {
                return self.stop(&name, "upload", format!("Upload failed: {reason}"));
            }
        };

        // ── share link ──
        self.status
            .set(ServicePhase::Processing, "Generating public share link");
        let Some(link) = c.uploader.create_public_link(&remote_id) else {
            self.status.fail("Failed to create share link");
            return self.orphan(remote_id, "share link creation failed");
        };

        // ── recipient ──
        let Some(recipient) = c.recipients.recipient() else {
            self.status
                .set(ServicePhase::Warning, "No email address provided");
            return self.orphan(remote_id, "no recipient address available");
        };

        // ── notify ──
        self.status
            .set(ServicePhase::Processing, "Sending email notification");
        if !c.notifier.send(&recipient, &link, &archive) {
            self.status.fail("Failed to send email");
            return self.orphan(remote_id, "notification delivery failed");
        }

        self.scheduler.schedule(&archive, &remote_id);
        self.status
            .set(ServicePhase::Success, format!("Email sent to {recipient}"));
        emit(
            self.logger.as_ref(),
            ActivityEvent::PipelineCompleted {
                device: device.path.display().to_string(),
                remote_id: remote_id.clone(),
                files: file_count,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
        );
        JobOutcome::Completed {
            remote_id,
            files: file_count,
        }
    }

    fn stop(&self, device: &str, stage: &'static str, reason: String) -> JobOutcome {
        eprintln!("[SG-WORKER] {device}: {reason}");
        self.status.fail(&reason);
        emit(
            self.logger.as_ref(),
            ActivityEvent::PipelineStopped {
                device: device.to_string(),
                stage: stage.to_string(),
                reason: reason.clone(),
            },
        );
        JobOutcome::Stopped { stage, reason }
    }

    fn orphan(&self, remote_id: String, reason: &str) -> JobOutcome {
        let message = format!("Uploaded artifact {remote_id} is not scheduled for cleanup: {reason}");
        eprintln!("[SG-WORKER] {message}");
        self.status.record_error(message);
        emit(
            self.logger.as_ref(),
            ActivityEvent::OrphanedUpload {
                remote_id: remote_id.clone(),
                reason: reason.to_string(),
            },
        );
        JobOutcome::Orphaned {
            remote_id,
            reason: reason.to_string(),
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

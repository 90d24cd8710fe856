//! Service orchestration: builds every component from configuration, starts
//! the monitor, worker and cleanup threads, and stops them on cancellation.
//!
//! Shutdown is best-effort: each thread finishes its current unit of work
//! (one poll, one job, one sweep) and is joined with a bounded timeout;
//! threads that overrun are left detached.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cleanup::scheduler::{CleanupScheduler, SweepCadence};
use crate::collab::archive::ZipArchiver;
use crate::collab::clamav::ClamScanner;
use crate::collab::mail::{ConfiguredRecipient, DesktopAlerter, SendmailNotifier};
use crate::collab::webdav::WebDavUploader;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::shutdown::{ShutdownToken, join_with_timeout};
use crate::daemon::status::{ServicePhase, StatusReporter};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, emit, spawn_logger};
use crate::logger::jsonl::JsonlConfig;
use crate::monitor::device_monitor::DeviceMonitor;
use crate::monitor::observer::{DeviceObserver, select_observer};
use crate::pipeline::collaborators::Collaborators;
use crate::pipeline::queue::{ProcessingJob, WorkQueue};
use crate::pipeline::worker::ProcessingWorker;
use crate::platform::pal::{Platform, detect_platform};

/// Injectable environment of a gateway: where devices come from and what
/// the pipeline talks to.
pub struct GatewayParts {
    pub platform: Arc<dyn Platform>,
    pub observer: Box<dyn DeviceObserver>,
    pub collaborators: Collaborators,
}

/// The default collaborators for a configuration.
pub fn default_collaborators(config: &Config) -> Result<Collaborators> {
    let uploader = Arc::new(WebDavUploader::new(&config.upload)?);
    Ok(Collaborators {
        scanner: Arc::new(ClamScanner::from_config(&config.scanner)),
        archiver: Arc::new(ZipArchiver::from_config(&config.archive)),
        uploader,
        notifier: Arc::new(SendmailNotifier::new(
            &config.notify,
            config.cleanup.retention_days,
        )),
        recipients: Arc::new(ConfiguredRecipient::new(config.recipient())),
        alerter: Arc::new(DesktopAlerter::new(config.notify.desktop_alerts)),
    })
}

/// A configured but not yet running gateway.
pub struct SafeGateway {
    config: Config,
    parts: GatewayParts,
    status: StatusReporter,
    scheduler: Arc<CleanupScheduler>,
    queue: WorkQueue,
    logger: Option<ActivityLoggerHandle>,
    logger_join: Option<JoinHandle<()>>,
}

impl SafeGateway {
    /// Build the production gateway: Linux platform, activity log,
    /// best available observer, default collaborators.
    pub fn from_config(config: Config) -> Result<Self> {
        let collaborators = default_collaborators(&config)?;
        let platform = detect_platform(&config.monitor.external_transports)?;
        let (logger, logger_join) = spawn_logger(JsonlConfig::at(
            config.paths.jsonl_log.clone(),
            config.paths.jsonl_fallback.clone(),
        ))?;
        let observer = select_observer(&platform, &config.monitor, Some(&logger));
        let parts = GatewayParts {
            platform,
            observer,
            collaborators,
        };
        let mut gateway = Self::with_parts(config, parts, Some(logger));
        gateway.logger_join = Some(logger_join);
        Ok(gateway)
    }

    /// Build around caller-supplied parts. The status file and ledger are
    /// still the configured paths.
    #[must_use]
    pub fn with_parts(
        config: Config,
        parts: GatewayParts,
        logger: Option<ActivityLoggerHandle>,
    ) -> Self {
        let status = StatusReporter::new(config.paths.status_file.clone(), config.status.max_errors);
        let scheduler = Arc::new(CleanupScheduler::open(
            config.paths.ledger_file.clone(),
            config.cleanup.retention_days,
            Arc::clone(&parts.collaborators.uploader),
            logger.clone(),
        ));
        let queue = WorkQueue::new(config.worker.queue_capacity);
        Self {
            config,
            parts,
            status,
            scheduler,
            queue,
            logger,
            logger_join: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Start the monitor, worker and cleanup threads. `sweep_trigger`
    /// requests an immediate cleanup sweep when set.
    pub fn start(
        self,
        token: ShutdownToken,
        sweep_trigger: Option<Arc<AtomicBool>>,
    ) -> Result<RunningGateway> {
        let Self {
            config,
            parts,
            status,
            scheduler,
            queue,
            logger,
            logger_join,
        } = self;
        let started = Instant::now();

        emit(
            logger.as_ref(),
            ActivityEvent::DaemonStarted {
                version: env!("CARGO_PKG_VERSION").to_string(),
                config_hash: config.stable_hash().unwrap_or_default(),
            },
        );

        let mut monitor = DeviceMonitor::new(
            Arc::clone(&parts.platform),
            parts.observer,
            Duration::from_millis(config.monitor.mount_grace_ms),
        )
        .with_logger(logger.clone())
        .on_insert(insert_callback(queue.clone(), status.clone(), logger.clone()))
        .on_remove({
            let status = status.clone();
            move |_device| status.set(ServicePhase::Idle, "USB device removed")
        });
        monitor.prime();

        let worker = ProcessingWorker::new(
            queue.clone(),
            parts.collaborators,
            status.clone(),
            Arc::clone(&scheduler),
            logger.clone(),
            Duration::from_millis(config.worker.dequeue_timeout_ms),
        );
        let cadence = SweepCadence {
            interval: Duration::from_secs(config.cleanup.sweep_interval_hours.saturating_mul(3600)),
            poll: Duration::from_millis(config.cleanup.stop_poll_ms),
        };

        let mut running = RunningGateway {
            token: token.clone(),
            status: status.clone(),
            scheduler: Arc::clone(&scheduler),
            queue,
            logger,
            logger_join,
            threads: Vec::new(),
            join_timeout: Duration::from_secs(config.worker.join_timeout_secs),
            started,
        };

        if let Err(e) = running.spawn_threads(monitor, worker, cadence, sweep_trigger) {
            eprintln!("[SG-DAEMON] start-up failed: {e}");
            running.stop("start-up failure");
            return Err(e);
        }

        status.set(
            ServicePhase::Idle,
            "Service started - monitoring for USB drives",
        );
        eprintln!("[SG-DAEMON] service started (pid {})", std::process::id());
        Ok(running)
    }
}

fn insert_callback(
    queue: WorkQueue,
    status: StatusReporter,
    logger: Option<ActivityLoggerHandle>,
) -> impl Fn(&crate::platform::pal::Device) + Send + 'static {
    move |device| {
        status.set(
            ServicePhase::Processing,
            format!("USB device detected: {}", device.display_name()),
        );
        let path = device.path.display().to_string();
        match queue.enqueue(ProcessingJob::new(device.clone())) {
            Ok(depth) => emit(
                logger.as_ref(),
                ActivityEvent::JobQueued {
                    device: path,
                    depth,
                },
            ),
            Err(e) => {
                eprintln!("[SG-MONITOR] dropping job for {path}: {e}");
                status.record_error(format!("Device {path} not processed: {e}"));
                emit(
                    logger.as_ref(),
                    ActivityEvent::JobDropped {
                        device: path,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }
}

/// Handles to a started gateway.
pub struct RunningGateway {
    token: ShutdownToken,
    status: StatusReporter,
    scheduler: Arc<CleanupScheduler>,
    queue: WorkQueue,
    logger: Option<ActivityLoggerHandle>,
    logger_join: Option<JoinHandle<()>>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
    join_timeout: Duration,
    started: Instant,
}

impl RunningGateway {
    fn spawn_threads(
        &mut self,
        monitor: DeviceMonitor,
        worker: ProcessingWorker,
        cadence: SweepCadence,
        sweep_trigger: Option<Arc<AtomicBool>>,
    ) -> Result<()> {
        self.threads
            .push(("monitor", monitor.spawn(self.token.clone())?));
        self.threads
            .push(("worker", worker.spawn(self.token.clone())?));
        let cleanup = self
            .scheduler
            .spawn(cadence, self.token.clone(), sweep_trigger)?;
        self.threads.push(("cleanup", cleanup));
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<CleanupScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    #[must_use]
    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        while self.token.sleep(Duration::from_secs(1)) {}
    }

    /// Cancel every loop, join with the configured timeout, and record the
    /// stopped state.
    pub fn stop(mut self, reason: &str) {
        self.token.cancel();
        for (name, handle) in self.threads.drain(..) {
            join_with_timeout(name, handle, self.join_timeout);
        }

        let uptime_secs = self.started.elapsed().as_secs();
        self.status.set(ServicePhase::Stopped, "Service stopped");
        emit(
            self.logger.as_ref(),
            ActivityEvent::DaemonStopped {
                reason: reason.to_string(),
                uptime_secs,
            },
        );
        if let Some(logger) = &self.logger {
            logger.shutdown();
        }
        if let Some(join) = self.logger_join.take() {
            join_with_timeout("logger", join, self.join_timeout);
        }
        eprintln!("[SG-DAEMON] shutdown complete (uptime={uptime_secs}s, reason={reason})");
    }
}

/// `safegate daemon`: run in the foreground until SIGTERM/SIGINT.
#[cfg(feature = "daemon")]
pub fn run_daemon(config: Config) -> Result<()> {
    use crate::daemon::signals::SignalHandler;

    let signals = SignalHandler::new();
    let gateway = SafeGateway::from_config(config)?;
    let running = gateway.start(signals.token(), Some(signals.sweep_flag()))?;
    running.wait();
    running.stop("signal");
    Ok(())
}

//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use usb_safegate::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, SafegateError};

// Platform
pub use crate::platform::pal::{Device, MockPlatform, MountPoint, Platform, detect_platform};

// Monitor
pub use crate::monitor::device_monitor::DeviceMonitor;
pub use crate::monitor::observer::{
    AdaptiveObserver, Candidate, DeviceObserver, PollingObserver, UeventObserver, select_observer,
};

// Pipeline
pub use crate::pipeline::collaborators::{
    Alerter, Archiver, Collaborators, InfectedFile, Notifier, RecipientSource, ScanReport,
    Scanner, UploadOutcome, Uploader,
};
pub use crate::pipeline::queue::{ProcessingJob, WorkQueue};
pub use crate::pipeline::worker::{JobOutcome, ProcessingWorker};

// Cleanup
pub use crate::cleanup::ledger::CleanupEntry;
pub use crate::cleanup::scheduler::{CleanupScheduler, LedgerStatus, SweepReport};

// Daemon
pub use crate::daemon::service::{GatewayParts, RunningGateway, SafeGateway};
pub use crate::daemon::shutdown::ShutdownToken;
pub use crate::daemon::status::{ServicePhase, ServiceStatus, StatusReporter};

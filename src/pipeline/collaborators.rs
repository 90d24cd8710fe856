//! Capabilities the processing pipeline and the cleanup scheduler invoke.
//!
//! Each collaborator is a stateless request/response service from the
//! pipeline's point of view: it is called, and the pipeline branches on the
//! result. Default implementations live in [`crate::collab`].

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::errors::Result;

/// A file the scanner flagged, with the signature it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfectedFile {
    pub path: PathBuf,
    pub signature: String,
}

/// Result of scanning one directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub infected: Vec<InfectedFile>,
    pub safe: Vec<PathBuf>,
}

impl ScanReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.infected.is_empty()
    }
}

/// Outcome of an upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { remote_id: String },
    Failed { reason: String },
}

pub trait Scanner: Send + Sync {
    /// Scan a directory tree. An `Err` stops the job with a report.
    fn scan(&self, dir: &Path) -> Result<ScanReport>;
}

pub trait Archiver: Send + Sync {
    /// Pack `files` into one archive. `None` on any failure.
    fn archive(&self, files: &[PathBuf]) -> Option<PathBuf>;
}

pub trait Uploader: Send + Sync {
    fn upload(&self, path: &Path) -> UploadOutcome;
    /// Public read-only link for an uploaded artifact, `None` on failure.
    fn create_public_link(&self, remote_id: &str) -> Option<String>;
    fn delete(&self, remote_id: &str) -> bool;
}

pub trait Notifier: Send + Sync {
    fn send(&self, recipient: &str, link: &str, artifact: &Path) -> bool;
}

/// Source of the address that receives the share link (interactive prompt,
/// pre-configured value, directory lookup, ...).
pub trait RecipientSource: Send + Sync {
    fn recipient(&self) -> Option<String>;
}

/// Presentation of infection warnings to whoever is at the gateway.
pub trait Alerter: Send + Sync {
    fn infection_alert(&self, device_name: &str, infected: &[InfectedFile]);
}

/// The full set of collaborators one worker drives.
#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<dyn Scanner>,
    pub archiver: Arc<dyn Archiver>,
    pub uploader: Arc<dyn Uploader>,
    pub notifier: Arc<dyn Notifier>,
    pub recipients: Arc<dyn RecipientSource>,
    pub alerter: Arc<dyn Alerter>,
}

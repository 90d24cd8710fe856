#![forbid(unsafe_code)]

//! USB safe gateway (safegate): a daemon that watches for removable storage,
//! scans every inserted drive for malware, uploads clean files as a single
//! archive, mails the recipient a share link, and deletes the upload once its
//! retention window has passed.
//!
//! Pipeline per device:
//! 1. **Monitor** — uevents (or polling) become insert/remove callbacks
//! 2. **Worker** — scan, archive, upload, share, notify, one device at a time
//! 3. **Cleanup** — a persistent ledger of uploads swept on a fixed cadence
//!
//! # Library usage
//!
//! ```rust,no_run
//! use usb_safegate::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use usb_safegate::core::config::Config;
//! use usb_safegate::cleanup::scheduler::CleanupScheduler;
//! ```

pub mod prelude;

pub mod cleanup;
pub mod collab;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod pipeline;
pub mod platform;

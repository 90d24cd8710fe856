//! Daemon subsystem: service orchestration, cooperative shutdown, the
//! status record, and signal handling.

pub mod service;
pub mod shutdown;
#[cfg(feature = "daemon")]
pub mod signals;
pub mod status;

//! Retention ledger and the background scheduler that enacts due deletions.

pub mod ledger;
pub mod scheduler;

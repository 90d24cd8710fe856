//! Core types: errors, configuration, atomic JSON persistence.

pub mod config;
pub mod errors;
pub mod persist;

//! SG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SafegateError>;

/// Top-level error type for the USB safe gateway.
#[derive(Debug, Error)]
pub enum SafegateError {
    #[error("[SG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SG-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[SG-2001] device enumeration failure: {details}")]
    DeviceEnumeration { details: String },

    #[error("[SG-2002] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[SG-2003] device event subscription failure: {details}")]
    Subscription { details: String },

    #[error("[SG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SG-2102] corrupt ledger at {path}: {details}")]
    LedgerCorrupt { path: PathBuf, details: String },

    #[error("[SG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SG-3004] work queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("[SG-3900] runtime failure: {details}")]
    Runtime { details: String },

    #[error("[SG-4001] {stage} collaborator failed: {details}")]
    Collaborator {
        stage: &'static str,
        details: String,
    },

    #[error("[SG-4002] external command {command} unavailable: {details}")]
    CommandUnavailable { command: String, details: String },
}

impl SafegateError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SG-1001",
            Self::MissingConfig { .. } => "SG-1002",
            Self::ConfigParse { .. } => "SG-1003",
            Self::UnsupportedPlatform { .. } => "SG-1101",
            Self::DeviceEnumeration { .. } => "SG-2001",
            Self::MountParse { .. } => "SG-2002",
            Self::Subscription { .. } => "SG-2003",
            Self::Serialization { .. } => "SG-2101",
            Self::LedgerCorrupt { .. } => "SG-2102",
            Self::Io { .. } => "SG-3002",
            Self::ChannelClosed { .. } => "SG-3003",
            Self::QueueFull { .. } => "SG-3004",
            Self::Runtime { .. } => "SG-3900",
            Self::Collaborator { .. } => "SG-4001",
            Self::CommandUnavailable { .. } => "SG-4002",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::QueueFull { .. }
                | Self::DeviceEnumeration { .. }
                | Self::Subscription { .. }
                | Self::Collaborator { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for collaborator failures.
    #[must_use]
    pub fn collaborator(stage: &'static str, details: impl Into<String>) -> Self {
        Self::Collaborator {
            stage,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for SafegateError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SafegateError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

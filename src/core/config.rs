//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SafegateError};

/// Longest retention accepted from configuration or the CLI (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Full gateway configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub worker: WorkerConfig,
    pub cleanup: CleanupConfig,
    pub scanner: ScannerConfig,
    pub archive: ArchiveConfig,
    pub upload: UploadConfig,
    pub notify: NotifyConfig,
    pub status: StatusConfig,
    pub paths: PathsConfig,
}

/// Device observation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between full reconciliation passes of the polling observer.
    pub poll_interval_ms: u64,
    /// Delay between a candidate insert and the mount re-verification.
    pub mount_grace_ms: u64,
    /// Try the kernel uevent subscription before falling back to polling.
    pub prefer_events: bool,
    /// Transport tags that identify external media (e.g. `usb`).
    pub external_transports: Vec<String>,
}

/// Work queue and processing worker knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub dequeue_timeout_ms: u64,
    /// Bounded wait when joining background threads at shutdown.
    pub join_timeout_secs: u64,
}

/// Retention and sweep cadence for uploaded artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub retention_days: u32,
    pub sweep_interval_hours: u64,
    /// Granularity at which the sweep loop checks for shutdown.
    pub stop_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub command: String,
    pub max_file_size_mb: u64,
    pub max_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub output_dir: PathBuf,
    pub name_prefix: String,
    /// Lower-case extensions (with leading dot) never packed into an archive.
    pub blocked_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    /// Nextcloud-compatible server root, e.g. `https://cloud.example.org`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub remote_dir: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub sendmail_command: PathBuf,
    pub from_address: String,
    pub sender_name: String,
    /// Pre-configured recipient. Empty means "no recipient available".
    pub recipient: String,
    pub desktop_alerts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatusConfig {
    pub max_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub status_file: PathBuf,
    pub ledger_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub jsonl_fallback: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            mount_grace_ms: 1_000,
            prefer_events: true,
            external_transports: vec!["usb".to_string()],
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            dequeue_timeout_ms: 1_000,
            join_timeout_secs: 10,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval_hours: 1,
            stop_poll_ms: 1_000,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            command: "clamscan".to_string(),
            max_file_size_mb: 100,
            max_files: 10_000,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            output_dir: data_dir().join("archives"),
            name_prefix: "usb_transfer".to_string(),
            blocked_extensions: [".exe", ".scr", ".bat", ".cmd", ".com", ".pif", ".vbs", ".js"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            remote_dir: "USB_Transfers".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            sendmail_command: PathBuf::from("/usr/sbin/sendmail"),
            from_address: "safegate@localhost".to_string(),
            sender_name: "USB Safe Gateway".to_string(),
            recipient: String::new(),
            desktop_alerts: true,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { max_errors: 10 }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!("[SG-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("safegate")
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cfg = home_dir()
            .join(".config")
            .join("safegate")
            .join("config.toml");
        let data = data_dir();
        Self {
            config_file: cfg,
            status_file: data.join("status.json"),
            ledger_file: data.join("cleanup_schedule.json"),
            jsonl_log: data.join("activity.jsonl"),
            jsonl_fallback: Some(PathBuf::from("/dev/shm/safegate.jsonl")),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw =
                fs::read_to_string(&path_buf).map_err(|source| SafegateError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if path.is_some() {
            return Err(SafegateError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    /// Credentials are blanked before hashing.
    pub fn stable_hash(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.upload.password.clear();
        let canonical = serde_json::to_string(&redacted)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Pre-configured recipient address, if any.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        let trimmed = self.notify.recipient.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // monitor
        set_u64(&mut lookup, "SG_MONITOR_POLL_INTERVAL_MS", &mut self.monitor.poll_interval_ms)?;
        set_u64(&mut lookup, "SG_MONITOR_MOUNT_GRACE_MS", &mut self.monitor.mount_grace_ms)?;
        set_bool(&mut lookup, "SG_MONITOR_PREFER_EVENTS", &mut self.monitor.prefer_events)?;
        if let Some(raw) = lookup("SG_MONITOR_EXTERNAL_TRANSPORTS") {
            self.monitor.external_transports = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        // worker
        set_usize(&mut lookup, "SG_WORKER_QUEUE_CAPACITY", &mut self.worker.queue_capacity)?;
        set_u64(&mut lookup, "SG_WORKER_DEQUEUE_TIMEOUT_MS", &mut self.worker.dequeue_timeout_ms)?;
        set_u64(&mut lookup, "SG_WORKER_JOIN_TIMEOUT_SECS", &mut self.worker.join_timeout_secs)?;

        // cleanup
        if let Some(raw) = lookup("SG_CLEANUP_RETENTION_DAYS") {
            self.cleanup.retention_days = raw.parse::<u32>().map_err(|error| {
                SafegateError::ConfigParse {
                    context: "env",
                    details: format!("SG_CLEANUP_RETENTION_DAYS={raw:?}: {error}"),
                }
            })?;
        }
        set_u64(
            &mut lookup,
            "SG_CLEANUP_SWEEP_INTERVAL_HOURS",
            &mut self.cleanup.sweep_interval_hours,
        )?;

        // scanner / upload / notify
        set_string(&mut lookup, "SG_SCANNER_COMMAND", &mut self.scanner.command);
        set_string(&mut lookup, "SG_UPLOAD_BASE_URL", &mut self.upload.base_url);
        set_string(&mut lookup, "SG_UPLOAD_USERNAME", &mut self.upload.username);
        set_string(&mut lookup, "SG_UPLOAD_PASSWORD", &mut self.upload.password);
        set_string(&mut lookup, "SG_UPLOAD_REMOTE_DIR", &mut self.upload.remote_dir);
        set_string(&mut lookup, "SG_NOTIFY_RECIPIENT", &mut self.notify.recipient);
        set_bool(&mut lookup, "SG_NOTIFY_DESKTOP_ALERTS", &mut self.notify.desktop_alerts)?;

        // paths
        if let Some(raw) = lookup("SG_STATUS_FILE") {
            self.paths.status_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SG_LEDGER_FILE") {
            self.paths.ledger_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SG_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    fn normalize(&mut self) {
        for transport in &mut self.monitor.external_transports {
            *transport = transport.trim().to_ascii_lowercase();
        }
        for ext in &mut self.archive.blocked_extensions {
            let lowered = ext.trim().to_ascii_lowercase();
            *ext = if lowered.starts_with('.') {
                lowered
            } else {
                format!(".{lowered}")
            };
        }
        while self.upload.base_url.ends_with('/') {
            self.upload.base_url.pop();
        }
        self.upload.remote_dir = self.upload.remote_dir.trim_matches('/').to_string();
    }

    fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 6] = [
            ("monitor.poll_interval_ms", self.monitor.poll_interval_ms),
            ("worker.dequeue_timeout_ms", self.worker.dequeue_timeout_ms),
            ("worker.join_timeout_secs", self.worker.join_timeout_secs),
            ("cleanup.sweep_interval_hours", self.cleanup.sweep_interval_hours),
            ("cleanup.stop_poll_ms", self.cleanup.stop_poll_ms),
            ("cleanup.retention_days", u64::from(self.cleanup.retention_days)),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(SafegateError::InvalidConfig {
                    details: format!("{name} must be > 0"),
                });
            }
        }

        if self.cleanup.retention_days > MAX_RETENTION_DAYS {
            return Err(SafegateError::InvalidConfig {
                details: format!("cleanup.retention_days must be <= {MAX_RETENTION_DAYS}"),
            });
        }

        if self.worker.queue_capacity == 0 {
            return Err(SafegateError::InvalidConfig {
                details: "worker.queue_capacity must be > 0".to_string(),
            });
        }

        if self.monitor.external_transports.is_empty() {
            return Err(SafegateError::InvalidConfig {
                details: "monitor.external_transports must name at least one transport"
                    .to_string(),
            });
        }

        if self.status.max_errors == 0 {
            return Err(SafegateError::InvalidConfig {
                details: "status.max_errors must be > 0".to_string(),
            });
        }

        if !self.upload.base_url.is_empty()
            && !(self.upload.base_url.starts_with("https://")
                || self.upload.base_url.starts_with("http://"))
        {
            return Err(SafegateError::InvalidConfig {
                details: format!(
                    "upload.base_url must be an http(s) URL, got {:?}",
                    self.upload.base_url
                ),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_string<F>(lookup: &mut F, name: &str, slot: &mut String)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw;
    }
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u64>().map_err(|error| SafegateError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<usize>().map_err(|error| SafegateError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env_bool(name, &raw)?;
    }
    Ok(())
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SafegateError::ConfigParse {
            context: "env",
            details: format!("{name}={other:?}: expected a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SafegateError, MAX_RETENTION_DAYS};
    use std::collections::HashMap;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config should validate");
        assert_eq!(cfg.monitor.poll_interval_ms, 2_000);
        assert_eq!(cfg.monitor.mount_grace_ms, 1_000);
        assert_eq!(cfg.worker.dequeue_timeout_ms, 1_000);
        assert_eq!(cfg.cleanup.retention_days, 7);
        assert_eq!(cfg.status.max_errors, 10);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/safegate/config.toml")))
            .expect_err("missing explicit config must fail");
        assert!(matches!(err, SafegateError::MissingConfig { .. }));
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[cleanup]\nretention_days = 3\n\n[notify]\nrecipient = \"ops@example.org\"\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.cleanup.retention_days, 3);
        assert_eq!(cfg.cleanup.sweep_interval_hours, 1);
        assert_eq!(cfg.recipient(), Some("ops@example.org"));
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cleanup\nretention_days = ").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, SafegateError::ConfigParse { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("SG_CLEANUP_RETENTION_DAYS", "14"),
            ("SG_MONITOR_PREFER_EVENTS", "no"),
            ("SG_MONITOR_EXTERNAL_TRANSPORTS", "usb, ieee1394"),
            ("SG_NOTIFY_RECIPIENT", "desk@example.org"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap();
        assert_eq!(cfg.cleanup.retention_days, 14);
        assert!(!cfg.monitor.prefer_events);
        assert_eq!(cfg.monitor.external_transports, vec!["usb", "ieee1394"]);
        assert_eq!(cfg.recipient(), Some("desk@example.org"));
    }

    #[test]
    fn env_invalid_number_rejected() {
        let env = vars(&[("SG_WORKER_QUEUE_CAPACITY", "lots")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap_err();
        assert!(err.to_string().contains("SG_WORKER_QUEUE_CAPACITY"));
    }

    #[test]
    fn zero_retention_rejected() {
        let mut cfg = Config::default();
        cfg.cleanup.retention_days = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("retention_days"));
    }

    #[test]
    fn retention_beyond_a_century_rejected() {
        let mut cfg = Config::default();
        cfg.cleanup.retention_days = MAX_RETENTION_DAYS;
        assert!(cfg.validate().is_ok());
        cfg.cleanup.retention_days = 4_000_000_000;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("<= 36500"));
    }

    #[test]
    fn non_http_upload_url_rejected() {
        let mut cfg = Config::default();
        cfg.upload.base_url = "ftp://cloud.example.org".to_string();
        assert!(cfg.validate().is_err());
        cfg.upload.base_url = "https://cloud.example.org".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn normalize_lowercases_and_dots_extensions() {
        let mut cfg = Config::default();
        cfg.archive.blocked_extensions = vec!["EXE".to_string(), ".Sh".to_string()];
        cfg.upload.base_url = "https://cloud.example.org//".to_string();
        cfg.upload.remote_dir = "/incoming/usb/".to_string();
        cfg.normalize();
        assert_eq!(cfg.archive.blocked_extensions, vec![".exe", ".sh"]);
        assert_eq!(cfg.upload.base_url, "https://cloud.example.org");
        assert_eq!(cfg.upload.remote_dir, "incoming/usb");
    }

    #[test]
    fn stable_hash_ignores_password() {
        let mut a = Config::default();
        let mut b = Config::default();
        a.upload.password = "one".to_string();
        b.upload.password = "two".to_string();
        assert_eq!(a.stable_hash().unwrap(), b.stable_hash().unwrap());

        b.cleanup.retention_days = 30;
        assert_ne!(a.stable_hash().unwrap(), b.stable_hash().unwrap());
    }

    #[test]
    fn blank_recipient_is_none() {
        let mut cfg = Config::default();
        cfg.notify.recipient = "   ".to_string();
        assert_eq!(cfg.recipient(), None);
    }
}

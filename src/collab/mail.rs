//! Operator-facing collaborators: link e-mail via sendmail, the configured
//! recipient, and infection alerts on stderr and the desktop.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use chrono::Local;

use crate::core::config::NotifyConfig;
use crate::pipeline::collaborators::{Alerter, InfectedFile, Notifier, RecipientSource};
use crate::platform::pal::format_capacity;

/// Infected paths listed in a desktop notification before truncating.
const ALERT_LIST_LIMIT: usize = 5;

// ──── notifier ────

pub struct SendmailNotifier {
    sendmail: PathBuf,
    from_address: String,
    sender_name: String,
    retention_days: u32,
}

impl SendmailNotifier {
    #[must_use]
    pub fn new(config: &NotifyConfig, retention_days: u32) -> Self {
        Self {
            sendmail: config.sendmail_command.clone(),
            from_address: config.from_address.clone(),
            sender_name: config.sender_name.clone(),
            retention_days,
        }
    }

    fn compose(&self, recipient: &str, link: &str, artifact: &Path) -> String {
        let name = artifact
            .file_name()
            .map_or_else(|| artifact.display().to_string(), |n| n.to_string_lossy().into_owned());
        let size = fs::metadata(artifact).map_or_else(|_| "unknown size".to_string(), |m| format_capacity(m.len()));

        let mut msg = String::new();
        let _ = writeln!(msg, "From: {} <{}>", self.sender_name, self.from_address);
        let _ = writeln!(msg, "To: {recipient}");
        let _ = writeln!(msg, "Subject: USB Data Transfer Complete - Download Link");
        let _ = writeln!(msg, "Content-Type: text/plain; charset=utf-8");
        let _ = writeln!(msg);
        let _ = writeln!(msg, "Your USB files were scanned for malware and uploaded.");
        let _ = writeln!(msg);
        let _ = writeln!(msg, "File:      {name}");
        let _ = writeln!(msg, "Size:      {size}");
        let _ = writeln!(msg, "Processed: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(msg);
        let _ = writeln!(msg, "Download:  {link}");
        let _ = writeln!(msg);
        let _ = writeln!(
            msg,
            "The link and the uploaded file are deleted automatically after {} days.",
            self.retention_days
        );
        msg
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, recipient: &str, link: &str, artifact: &Path) -> bool {
        if recipient.contains(['\r', '\n']) {
            eprintln!("[SG-WORKER] refusing recipient with line breaks");
            return false;
        }
        let message = self.compose(recipient, link, artifact);

        let mut child = match Command::new(&self.sendmail)
            .args(["-t", "-oi"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                eprintln!("[SG-WORKER] cannot run {}: {e}", self.sendmail.display());
                return false;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(message.as_bytes()) {
                eprintln!("[SG-WORKER] writing mail to sendmail failed: {e}");
            }
        }
        match child.wait_with_output() {
            Ok(output) if output.status.success() => {
                eprintln!("[SG-WORKER] notification sent to {recipient}");
                true
            }
            Ok(output) => {
                eprintln!(
                    "[SG-WORKER] sendmail failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                eprintln!("[SG-WORKER] sendmail wait failed: {e}");
                false
            }
        }
    }
}

// ──── recipient ────

/// The pre-configured recipient, if any.
pub struct ConfiguredRecipient {
    address: Option<String>,
}

impl ConfiguredRecipient {
    #[must_use]
    pub fn new(address: Option<&str>) -> Self {
        Self {
            address: address.map(str::trim).filter(|a| !a.is_empty()).map(ToString::to_string),
        }
    }
}

impl RecipientSource for ConfiguredRecipient {
    fn recipient(&self) -> Option<String> {
        self.address.clone()
    }
}

// ──── alerter ────

pub struct DesktopAlerter {
    desktop: bool,
}

impl DesktopAlerter {
    #[must_use]
    pub const fn new(desktop: bool) -> Self {
        Self { desktop }
    }
}

impl Alerter for DesktopAlerter {
    fn infection_alert(&self, device_name: &str, infected: &[InfectedFile]) {
        eprintln!(
            "[SG-WORKER] MALWARE DETECTED on {device_name}: {} infected file(s); nothing was uploaded",
            infected.len()
        );
        for file in infected {
            eprintln!("[SG-WORKER]   {} ({})", file.path.display(), file.signature);
        }
        if self.desktop {
            notify_desktop(&alert_body(device_name, infected));
        }
    }
}

fn alert_body(device_name: &str, infected: &[InfectedFile]) -> String {
    let mut body = format!(
        "{} infected file(s) on {device_name}. The device was NOT uploaded.\n",
        infected.len()
    );
    for file in infected.iter().take(ALERT_LIST_LIMIT) {
        let name = file
            .path
            .file_name()
            .map_or_else(|| file.path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let _ = writeln!(body, "- {name}: {}", file.signature);
    }
    if infected.len() > ALERT_LIST_LIMIT {
        let _ = writeln!(body, "... and {} more", infected.len() - ALERT_LIST_LIMIT);
    }
    body
}

#[cfg(target_os = "linux")]
fn notify_desktop(body: &str) {
    let mut command = Command::new("notify-send");
    command
        .arg("--urgency")
        .arg("critical")
        .arg("--app-name=safegate")
        .arg("Malware detected")
        .arg(body)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match spawn_reaped(command) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("[SG-WORKER] desktop notification failed: {e}"),
    }
}

#[cfg(any(target_os = "linux", test))]
/// Spawn `command` without blocking the caller; a detached thread waits on
/// the child so it never lingers as a zombie.
fn spawn_reaped(mut command: Command) -> std::io::Result<JoinHandle<Option<ExitStatus>>> {
    let mut child = command.spawn()?;
    thread::Builder::new()
        .name("sg-reap".to_string())
        .spawn(move || child.wait().ok())
}

#[cfg(not(target_os = "linux"))]
fn notify_desktop(_body: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(sendmail: &str) -> SendmailNotifier {
        let config = NotifyConfig {
            sendmail_command: PathBuf::from(sendmail),
            ..NotifyConfig::default()
        };
        SendmailNotifier::new(&config, 7)
    }

    #[test]
    fn message_carries_headers_link_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("usb_transfer_20250101_120000.zip");
        fs::write(&artifact, vec![0_u8; 2048]).unwrap();

        let msg = notifier("/usr/sbin/sendmail").compose(
            "ops@example.org",
            "https://cloud.example.org/s/AbC",
            &artifact,
        );
        assert!(msg.starts_with("From: USB Safe Gateway <safegate@localhost>\n"));
        assert!(msg.contains("To: ops@example.org\n"));
        assert!(msg.contains("Download:  https://cloud.example.org/s/AbC"));
        assert!(msg.contains("usb_transfer_20250101_120000.zip"));
        assert!(msg.contains("after 7 days"));
    }

    #[test]
    fn header_injection_is_refused() {
        let n = notifier("/bin/true");
        assert!(!n.send("a@b.c\nBcc: x@y.z", "https://x", Path::new("/tmp/a.zip")));
    }

    #[test]
    fn missing_sendmail_reports_failure() {
        let n = notifier("/nonexistent/safegate/sendmail");
        assert!(!n.send("ops@example.org", "https://x", Path::new("/tmp/a.zip")));
    }

    #[test]
    fn blank_recipient_is_none() {
        assert_eq!(ConfiguredRecipient::new(Some("  ")).recipient(), None);
        assert_eq!(ConfiguredRecipient::new(None).recipient(), None);
        assert_eq!(
            ConfiguredRecipient::new(Some(" ops@example.org ")).recipient().as_deref(),
            Some("ops@example.org")
        );
    }

    #[test]
    fn alert_body_truncates_long_lists() {
        let infected: Vec<InfectedFile> = (0..7)
            .map(|i| InfectedFile {
                path: PathBuf::from(format!("/media/usb/f{i}.exe")),
                signature: "Eicar".to_string(),
            })
            .collect();
        let body = alert_body("KINGSTON", &infected);
        assert!(body.starts_with("7 infected file(s) on KINGSTON"));
        assert!(body.contains("- f0.exe: Eicar"));
        assert!(!body.contains("f5.exe"));
        assert!(body.contains("... and 2 more"));
    }

    #[test]
    fn spawned_alert_process_is_waited_on() {
        let handle = spawn_reaped(Command::new("true")).unwrap();
        let status = handle.join().unwrap();
        assert!(status.is_some_and(|s| s.success()));

        let err = spawn_reaped(Command::new("/nonexistent/safegate/notify-send")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}

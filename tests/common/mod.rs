#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use usb_safegate::core::errors::Result;
use usb_safegate::pipeline::collaborators::{
    Alerter, Archiver, Collaborators, InfectedFile, Notifier, RecipientSource, ScanReport,
    Scanner, UploadOutcome, Uploader,
};
use usb_safegate::platform::pal::Device;

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_safegate") {
        return PathBuf::from(path);
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join("safegate"));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve safegate binary path for integration test"),
    }
}

/// Run the binary with human output and no inherited `SG_*` overrides.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("safegate-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("SG_") {
            command.env_remove(&key);
        }
    }
    let output = command
        .args(args)
        .env("SG_OUTPUT_FORMAT", "human")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute safegate command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write a config file whose state paths all live under `dir`.
pub fn write_isolated_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("safegate.toml");
    let body = format!(
        "[paths]\nstatus_file = {:?}\nledger_file = {:?}\njsonl_log = {:?}\n\n{extra}",
        dir.join("status.json").display().to_string(),
        dir.join("ledger.json").display().to_string(),
        dir.join("activity.jsonl").display().to_string(),
    );
    fs::write(&path, body).expect("write config");
    path
}

// ──────────────────── fake collaborators ────────────────────

/// Shared, inspectable state behind every fake collaborator.
#[derive(Default)]
pub struct FakeWorld {
    /// Ordered trace of pipeline calls, e.g. `scan-begin:/mnt/a`.
    pub trace: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<(String, String)>>,
    pub alerts: AtomicUsize,
    /// Remote deletions that fail before the next one succeeds.
    pub remote_delete_failures: AtomicUsize,
    pub scan_delay: Mutex<Duration>,
    pub archive_dir: Mutex<Option<PathBuf>>,
    archive_seq: AtomicUsize,
}

impl FakeWorld {
    pub fn new(archive_dir: &Path) -> Arc<Self> {
        let world = Self::default();
        *world.archive_dir.lock() = Some(archive_dir.to_path_buf());
        Arc::new(world)
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().clone()
    }

    fn record(&self, line: String) {
        self.trace.lock().push(line);
    }
}

/// Fake collaborator set: flags any file whose name contains `eicar`.
pub struct Fake(pub Arc<FakeWorld>);

pub fn fake_collaborators(world: &Arc<FakeWorld>) -> Collaborators {
    Collaborators {
        scanner: Arc::new(Fake(Arc::clone(world))),
        archiver: Arc::new(Fake(Arc::clone(world))),
        uploader: Arc::new(Fake(Arc::clone(world))),
        notifier: Arc::new(Fake(Arc::clone(world))),
        recipients: Arc::new(Fake(Arc::clone(world))),
        alerter: Arc::new(Fake(Arc::clone(world))),
    }
}

impl Scanner for Fake {
    fn scan(&self, dir: &Path) -> Result<ScanReport> {
        self.0.record(format!("scan-begin:{}", dir.display()));
        let delay = *self.0.scan_delay.lock();
        std::thread::sleep(delay);

        let mut report = ScanReport::default();
        let mut names: Vec<PathBuf> = fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        names.sort();
        for path in names.into_iter().filter(|p| p.is_file()) {
            let flagged = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains("eicar"));
            if flagged {
                report.infected.push(InfectedFile {
                    path,
                    signature: "Eicar-Test-Signature".to_string(),
                });
            } else {
                report.safe.push(path);
            }
        }
        self.0.record(format!("scan-end:{}", dir.display()));
        Ok(report)
    }
}

impl Archiver for Fake {
    fn archive(&self, files: &[PathBuf]) -> Option<PathBuf> {
        let dir = self.0.archive_dir.lock().clone()?;
        let seq = self.0.archive_seq.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("usb_transfer_{seq}.zip"));
        let listing: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        fs::write(&path, listing.join("\n")).ok()?;
        Some(path)
    }
}

impl Uploader for Fake {
    fn upload(&self, path: &Path) -> UploadOutcome {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_id = format!("USB_Transfers/{name}");
        self.0.uploads.lock().push(remote_id.clone());
        self.0.record(format!("upload:{remote_id}"));
        UploadOutcome::Uploaded { remote_id }
    }

    fn create_public_link(&self, remote_id: &str) -> Option<String> {
        Some(format!("https://cloud.example.org/s/{remote_id}"))
    }

    fn delete(&self, remote_id: &str) -> bool {
        let failing = self
            .0
            .remote_delete_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return false;
        }
        self.0.deletes.lock().push(remote_id.to_string());
        true
    }
}

impl Notifier for Fake {
    fn send(&self, recipient: &str, link: &str, artifact: &Path) -> bool {
        self.0
            .notifications
            .lock()
            .push((recipient.to_string(), link.to_string()));
        self.0.record(format!("notify:{}", artifact.display()));
        true
    }
}

impl RecipientSource for Fake {
    fn recipient(&self) -> Option<String> {
        Some("ops@example.org".to_string())
    }
}

impl Alerter for Fake {
    fn infection_alert(&self, _device_name: &str, _infected: &[InfectedFile]) {
        self.0.alerts.fetch_add(1, Ordering::SeqCst);
    }
}

// ──────────────────── devices ────────────────────

/// A USB partition mounted at `mount`, populated with `files`.
pub fn usb_stick(node: &str, label: &str, mount: &Path, files: &[&str]) -> Device {
    fs::create_dir_all(mount).expect("create mount dir");
    for name in files {
        fs::write(mount.join(name), format!("contents of {name}")).expect("write file");
    }
    let mut device = Device::placeholder(node);
    device.label = label.to_string();
    device.transport = "usb".to_string();
    device.mount_point = Some(mount.to_path_buf());
    device
}

/// Poll `done` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

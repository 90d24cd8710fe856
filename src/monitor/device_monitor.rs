//! Device Monitor: owns the authoritative set of known device paths and turns
//! observer candidates into insert/remove callbacks, at most once per
//! physical transition.
//!
//! The known set and metadata cache are touched only from the monitor's own
//! thread, so they need no lock.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::errors::{Result, SafegateError};
use crate::daemon::shutdown::ShutdownToken;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, emit};
use crate::monitor::observer::{Candidate, DeviceObserver};
use crate::platform::pal::{Device, Platform};

/// Receives an immutable snapshot; never the live record.
pub type DeviceCallback = Box<dyn Fn(&Device) + Send>;

/// Back-off after the observer itself fails with no fallback left.
const OBSERVER_RETRY: Duration = Duration::from_secs(1);

pub struct DeviceMonitor {
    platform: Arc<dyn Platform>,
    observer: Box<dyn DeviceObserver>,
    known: HashSet<PathBuf>,
    cache: HashMap<PathBuf, Device>,
    mount_grace: Duration,
    on_insert: Option<DeviceCallback>,
    on_remove: Option<DeviceCallback>,
    logger: Option<ActivityLoggerHandle>,
}

impl DeviceMonitor {
    #[must_use]
    pub fn new(
        platform: Arc<dyn Platform>,
        observer: Box<dyn DeviceObserver>,
        mount_grace: Duration,
    ) -> Self {
        Self {
            platform,
            observer,
            known: HashSet::new(),
            cache: HashMap::new(),
            mount_grace,
            on_insert: None,
            on_remove: None,
            logger: None,
        }
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Option<ActivityLoggerHandle>) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn on_insert(mut self, callback: impl Fn(&Device) + Send + 'static) -> Self {
        self.on_insert = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_remove(mut self, callback: impl Fn(&Device) + Send + 'static) -> Self {
        self.on_remove = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn is_known(&self, path: &Path) -> bool {
        self.known.contains(path)
    }

    /// Snapshots of every tracked device, ordered by path.
    #[must_use]
    pub fn known_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.cache.values().cloned().collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices
    }

    #[must_use]
    pub fn observer_name(&self) -> &'static str {
        self.observer.name()
    }

    /// Record devices already present at start-up without firing callbacks.
    pub fn prime(&mut self) -> usize {
        match self.platform.external_devices() {
            Ok(devices) => {
                let count = devices.len();
                for device in devices {
                    self.known.insert(device.path.clone());
                    self.cache.insert(device.path.clone(), device);
                }
                if count > 0 {
                    eprintln!("[SG-MONITOR] {count} device(s) already present; not reprocessing");
                }
                count
            }
            Err(e) => {
                eprintln!("[SG-MONITOR] start-up enumeration failed: {e}");
                0
            }
        }
    }

    /// Candidate insert. Returns whether the insert callback fired.
    ///
    /// Known-set membership is the only gate: a path already tracked is
    /// ignored whether or not its earlier insert was verified.
    pub fn handle_insert(&mut self, device: Device, token: &ShutdownToken) -> bool {
        if self.known.contains(&device.path) {
            return false;
        }
        let path = device.path.clone();
        self.known.insert(path.clone());
        self.cache.insert(path.clone(), device);

        if !token.sleep(self.mount_grace) {
            return false;
        }

        let mount_point = match self.platform.mount_point_of(&path) {
            Ok(mount) => mount,
            Err(e) => {
                eprintln!("[SG-MONITOR] mount check for {} failed: {e}", path.display());
                None
            }
        };
        let Some(mount_point) = mount_point else {
            eprintln!(
                "[SG-MONITOR] {} not mounted after grace period; ignoring",
                path.display()
            );
            emit(
                self.logger.as_ref(),
                ActivityEvent::DeviceUnverified {
                    device: path.display().to_string(),
                },
            );
            return false;
        };

        let Some(snapshot) = self.cache.get_mut(&path).map(|cached| {
            cached.mount_point = Some(mount_point);
            cached.clone()
        }) else {
            return false;
        };

        eprintln!(
            "[SG-MONITOR] device inserted: {} ({}, {})",
            snapshot.path.display(),
            snapshot.display_name(),
            snapshot.capacity
        );
        emit(
            self.logger.as_ref(),
            ActivityEvent::DeviceInserted {
                device: snapshot.path.display().to_string(),
                label: snapshot.label.clone(),
                mount_point: snapshot.mount_point.as_ref().map(|m| m.display().to_string()),
            },
        );
        if let Some(callback) = &self.on_insert {
            callback(&snapshot);
        }
        true
    }

    /// Candidate removal. Returns whether the removal callback fired.
    pub fn handle_remove(&mut self, path: &Path) -> bool {
        if !self.known.remove(path) {
            return false;
        }
        let snapshot = self
            .cache
            .remove(path)
            .unwrap_or_else(|| Device::placeholder(path));

        eprintln!("[SG-MONITOR] device removed: {}", path.display());
        emit(
            self.logger.as_ref(),
            ActivityEvent::DeviceRemoved {
                device: path.display().to_string(),
                label: snapshot.label.clone(),
            },
        );
        if let Some(callback) = &self.on_remove {
            callback(&snapshot);
        }
        true
    }

    pub fn apply(&mut self, candidate: Candidate, token: &ShutdownToken) {
        match candidate {
            Candidate::Insert(device) => {
                self.handle_insert(device, token);
            }
            Candidate::Remove(path) => {
                self.handle_remove(&path);
            }
        }
    }

    /// One observer step: wait for candidates and apply them.
    pub fn step(&mut self, token: &ShutdownToken) -> Result<()> {
        let candidates = self.observer.next_candidates(&self.known, token)?;
        for candidate in candidates {
            if token.is_cancelled() {
                break;
            }
            self.apply(candidate, token);
        }
        Ok(())
    }

    /// Observe until cancelled. Observer failures are logged and retried;
    /// they never end the loop.
    pub fn run(mut self, token: &ShutdownToken) {
        eprintln!("[SG-MONITOR] device monitor started ({} observer)", self.observer.name());
        while !token.is_cancelled() {
            if let Err(e) = self.step(token) {
                eprintln!("[SG-MONITOR] observer error: {e}");
                emit(
                    self.logger.as_ref(),
                    ActivityEvent::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                );
                token.sleep(OBSERVER_RETRY);
            }
        }
        eprintln!("[SG-MONITOR] device monitor stopped");
    }

    pub fn spawn(self, token: ShutdownToken) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("sg-monitor".to_string())
            .spawn(move || self.run(&token))
            .map_err(|e| SafegateError::Runtime {
                details: format!("failed to spawn monitor thread: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::observer::PollingObserver;
    use crate::platform::pal::MockPlatform;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    type Log = Arc<Mutex<Vec<(char, PathBuf)>>>;

    fn usb(path: &str, mount: Option<&str>) -> Device {
        let mut device = Device::placeholder(path);
        device.transport = "usb".to_string();
        device.label = "STICK".to_string();
        device.mount_point = mount.map(PathBuf::from);
        device
    }

    fn monitor(platform: &MockPlatform) -> (DeviceMonitor, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let shared: Arc<dyn Platform> = Arc::new(platform.clone());
        let observer = Box::new(PollingObserver::new(Arc::clone(&shared), Duration::ZERO));
        let (ins, rem) = (log.clone(), log.clone());
        let monitor = DeviceMonitor::new(shared, observer, Duration::ZERO)
            .on_insert(move |d| ins.lock().push(('+', d.path.clone())))
            .on_remove(move |d| rem.lock().push(('-', d.path.clone())));
        (monitor, log)
    }

    #[test]
    fn verified_insert_fires_once() {
        let platform = MockPlatform::new();
        platform.plug(usb("/dev/sdb1", Some("/media/usb/STICK")));
        let (mut monitor, log) = monitor(&platform);
        let token = ShutdownToken::new();

        assert!(monitor.handle_insert(usb("/dev/sdb1", None), &token));
        assert!(!monitor.handle_insert(usb("/dev/sdb1", None), &token));
        assert_eq!(log.lock().len(), 1);
        // Mount point refreshed from the mount table.
        assert_eq!(
            monitor.known_devices()[0].mount_point.as_deref(),
            Some(Path::new("/media/usb/STICK"))
        );
    }

    #[test]
    fn unmounted_device_stays_tracked_without_callback() {
        let platform = MockPlatform::new();
        platform.plug(usb("/dev/sdb1", None));
        let (mut monitor, log) = monitor(&platform);
        let token = ShutdownToken::new();

        assert!(!monitor.handle_insert(usb("/dev/sdb1", None), &token));
        assert!(log.lock().is_empty());
        assert!(monitor.is_known(Path::new("/dev/sdb1")));

        // A later removal still clears it, and reports the cached snapshot.
        assert!(monitor.handle_remove(Path::new("/dev/sdb1")));
        assert_eq!(log.lock().as_slice(), &[('-', PathBuf::from("/dev/sdb1"))]);
        assert!(!monitor.is_known(Path::new("/dev/sdb1")));
    }

    #[test]
    fn removal_of_unknown_path_is_ignored() {
        let platform = MockPlatform::new();
        let (mut monitor, log) = monitor(&platform);
        assert!(!monitor.handle_remove(Path::new("/dev/sdq1")));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn priming_suppresses_callbacks_for_present_devices() {
        let platform = MockPlatform::new();
        platform.plug(usb("/dev/sdb1", Some("/media/usb/A")));
        let (mut monitor, log) = monitor(&platform);
        let token = ShutdownToken::new();

        assert_eq!(monitor.prime(), 1);
        monitor.step(&token).unwrap();
        assert!(log.lock().is_empty());

        platform.unplug(Path::new("/dev/sdb1"));
        monitor.step(&token).unwrap();
        assert_eq!(log.lock().as_slice(), &[('-', PathBuf::from("/dev/sdb1"))]);
    }

    #[test]
    fn polling_steps_track_plug_and_unplug() {
        let platform = MockPlatform::new();
        let (mut monitor, log) = monitor(&platform);
        let token = ShutdownToken::new();

        platform.plug(usb("/dev/sdb1", Some("/media/usb/A")));
        monitor.step(&token).unwrap();
        monitor.step(&token).unwrap();
        platform.unplug(Path::new("/dev/sdb1"));
        monitor.step(&token).unwrap();
        platform.plug(usb("/dev/sdb1", Some("/media/usb/A")));
        monitor.step(&token).unwrap();

        let events: Vec<char> = log.lock().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(events, vec!['+', '-', '+']);
    }

    #[test]
    fn enumeration_failure_keeps_devices() {
        let platform = MockPlatform::new();
        platform.plug(usb("/dev/sdb1", Some("/media/usb/A")));
        let (mut monitor, log) = monitor(&platform);
        let token = ShutdownToken::new();
        monitor.step(&token).unwrap();

        platform.fail_enumeration(true);
        monitor.step(&token).unwrap();
        assert!(monitor.is_known(Path::new("/dev/sdb1")));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn run_stops_on_cancel() {
        let platform = MockPlatform::new();
        let shared: Arc<dyn Platform> = Arc::new(platform);
        let observer = Box::new(PollingObserver::new(Arc::clone(&shared), Duration::from_millis(20)));
        let monitor = DeviceMonitor::new(shared, observer, Duration::ZERO);
        let token = ShutdownToken::new();
        let handle = monitor.spawn(token.clone()).unwrap();
        thread::sleep(Duration::from_millis(60));
        token.cancel();
        handle.join().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3_usize).prop_map(Op::Insert),
            (0..3_usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn callbacks_alternate_per_path(ops in proptest::collection::vec(op(), 0..40)) {
            let platform = MockPlatform::new();
            let paths: Vec<String> = (0..3).map(|i| format!("/dev/sd{}1", (b'b' + i) as char)).collect();
            for path in &paths {
                platform.plug(usb(path, Some("/media/usb/X")));
            }
            let (mut monitor, log) = monitor(&platform);
            let token = ShutdownToken::new();

            for op in ops {
                match op {
                    Op::Insert(i) => { monitor.handle_insert(usb(&paths[i], None), &token); }
                    Op::Remove(i) => { monitor.handle_remove(Path::new(&paths[i])); }
                }
            }

            for path in &paths {
                let kinds: Vec<char> = log
                    .lock()
                    .iter()
                    .filter(|(_, p)| p == Path::new(path))
                    .map(|(kind, _)| *kind)
                    .collect();
                for pair in kinds.windows(2) {
                    prop_assert_ne!(pair[0], pair[1]);
                }
                if let Some(first) = kinds.first() {
                    prop_assert_eq!(*first, '+');
                }
            }
        }
    }
}

//! Device Observer strategies.
//!
//! - [`UeventObserver`]: kernel uevent subscription (netlink on Linux),
//!   filtered to block partitions with action `add`/`remove`.
//! - [`PollingObserver`]: periodic enumeration of mounted external
//!   partitions, diffed against the monitor's known set. Full reconciliation
//!   every pass, so missed transitions heal on the next cycle.
//! - [`AdaptiveObserver`]: runs a primary strategy and swaps to a fallback
//!   the first time the primary reports a subscription failure.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memchr::memchr;

use crate::core::config::MonitorConfig;
use crate::core::errors::Result;
use crate::daemon::shutdown::ShutdownToken;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, emit};
use crate::platform::pal::{Device, Platform};

/// Raw detection signal, not yet verified as a stable mounted device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Insert(Device),
    Remove(PathBuf),
}

/// One interchangeable observation strategy.
pub trait DeviceObserver: Send {
    fn name(&self) -> &'static str;

    /// Block for at most one poll interval or notification timeout and return
    /// the candidates observed. An empty batch is a normal idle tick.
    ///
    /// `Err` means the strategy itself is broken (e.g. the subscription
    /// socket died), not that enumeration failed for one cycle.
    fn next_candidates(
        &mut self,
        known: &HashSet<PathBuf>,
        token: &ShutdownToken,
    ) -> Result<Vec<Candidate>>;
}

// ──────────────────── uevent parsing ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
}

/// A block-partition add/remove event reduced to its device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUevent {
    pub action: UeventAction,
    pub device: PathBuf,
}

/// Parse one kernel uevent datagram (`action@devpath\0KEY=VALUE\0...`).
/// Returns `None` for anything other than a partition add or remove.
#[must_use]
pub fn parse_uevent(raw: &[u8]) -> Option<BlockUevent> {
    let mut action = None;
    let mut subsystem_block = false;
    let mut partition = false;
    let mut devname = None;

    let mut rest = raw;
    while !rest.is_empty() {
        let end = memchr(0, rest).unwrap_or(rest.len());
        let field = &rest[..end];
        rest = rest.get(end + 1..).unwrap_or_default();

        let Some(eq) = memchr(b'=', field) else {
            continue;
        };
        let (key, value) = (&field[..eq], &field[eq + 1..]);
        match key {
            b"ACTION" => {
                action = match value {
                    b"add" => Some(UeventAction::Add),
                    b"remove" => Some(UeventAction::Remove),
                    _ => None,
                };
            }
            b"SUBSYSTEM" => subsystem_block = value == b"block",
            b"DEVTYPE" => partition = value == b"partition",
            b"DEVNAME" => devname = std::str::from_utf8(value).ok(),
            _ => {}
        }
    }

    let devname = devname?.trim_start_matches("/dev/");
    if !subsystem_block || !partition || devname.is_empty() || devname.contains("..") {
        return None;
    }
    Some(BlockUevent {
        action: action?,
        device: Path::new("/dev").join(devname),
    })
}

/// Source of raw uevent datagrams.
pub trait UeventSource: Send {
    /// Next datagram, or `None` when the receive timeout elapsed.
    fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

#[cfg(target_os = "linux")]
pub use netlink::NetlinkUeventSource;

#[cfg(target_os = "linux")]
mod netlink {
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::errno::Errno;
    use nix::sys::socket::{
        AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv,
        setsockopt, socket, sockopt,
    };
    use nix::sys::time::TimeVal;

    use super::UeventSource;
    use crate::core::errors::{Result, SafegateError};

    /// Kernel broadcast group for uevents.
    const KERNEL_UEVENT_GROUP: u32 = 1;
    const RECV_BUFFER: usize = 8192;

    /// `NETLINK_KOBJECT_UEVENT` subscription with a one-second receive timeout,
    /// so the observer loop can check for shutdown between events.
    pub struct NetlinkUeventSource {
        fd: OwnedFd,
        buf: Vec<u8>,
    }

    impl NetlinkUeventSource {
        pub fn open() -> Result<Self> {
            let subscription = |e: Errno| SafegateError::Subscription {
                details: format!("netlink uevent socket: {e}"),
            };
            let fd = socket(
                AddressFamily::Netlink,
                SockType::Datagram,
                SockFlag::SOCK_CLOEXEC,
                SockProtocol::NetlinkKObjectUEvent,
            )
            .map_err(subscription)?;
            bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_UEVENT_GROUP)).map_err(subscription)?;
            setsockopt(&fd, sockopt::ReceiveTimeout, &TimeVal::new(1, 0)).map_err(subscription)?;
            Ok(Self {
                fd,
                buf: vec![0; RECV_BUFFER],
            })
        }
    }

    impl UeventSource for NetlinkUeventSource {
        fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            match recv(self.fd.as_raw_fd(), &mut self.buf, MsgFlags::empty()) {
                Ok(n) => Ok(Some(self.buf[..n].to_vec())),
                Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
                Err(e) => Err(SafegateError::Subscription {
                    details: format!("netlink recv: {e}"),
                }),
            }
        }
    }
}

// ──────────────────── event strategy ────────────────────

pub struct UeventObserver {
    source: Box<dyn UeventSource>,
    platform: Arc<dyn Platform>,
}

impl UeventObserver {
    #[must_use]
    pub fn new(source: Box<dyn UeventSource>, platform: Arc<dyn Platform>) -> Self {
        Self { source, platform }
    }
}

impl DeviceObserver for UeventObserver {
    fn name(&self) -> &'static str {
        "uevent"
    }

    fn next_candidates(
        &mut self,
        _known: &HashSet<PathBuf>,
        token: &ShutdownToken,
    ) -> Result<Vec<Candidate>> {
        if token.is_cancelled() {
            return Ok(Vec::new());
        }
        let Some(raw) = self.source.recv()? else {
            return Ok(Vec::new());
        };
        let Some(event) = parse_uevent(&raw) else {
            return Ok(Vec::new());
        };

        let candidate = match event.action {
            UeventAction::Remove => Candidate::Remove(event.device),
            UeventAction::Add => match self.platform.describe(&event.device) {
                Ok(Some(device)) => Candidate::Insert(device),
                Ok(None) => return Ok(Vec::new()),
                Err(e) => {
                    eprintln!(
                        "[SG-MONITOR] cannot describe {}: {e}; using placeholder metadata",
                        event.device.display()
                    );
                    Candidate::Insert(Device::placeholder(event.device))
                }
            },
        };
        Ok(vec![candidate])
    }
}

// ──────────────────── polling strategy ────────────────────

pub struct PollingObserver {
    platform: Arc<dyn Platform>,
    interval: Duration,
    primed: bool,
}

impl PollingObserver {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, interval: Duration) -> Self {
        Self {
            platform,
            interval,
            primed: false,
        }
    }
}

impl DeviceObserver for PollingObserver {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn next_candidates(
        &mut self,
        known: &HashSet<PathBuf>,
        token: &ShutdownToken,
    ) -> Result<Vec<Candidate>> {
        // First pass runs immediately; later passes wait one interval.
        if self.primed && !token.sleep(self.interval) {
            return Ok(Vec::new());
        }
        self.primed = true;

        let devices = match self.platform.external_devices() {
            Ok(devices) => devices,
            Err(e) => {
                // No reconciliation on a failed pass: an empty view would
                // otherwise read as "every known device was removed".
                eprintln!("[SG-MONITOR] enumeration failed, skipping this cycle: {e}");
                return Ok(Vec::new());
            }
        };
        Ok(diff_against_known(devices, known))
    }
}

fn diff_against_known(devices: Vec<Device>, known: &HashSet<PathBuf>) -> Vec<Candidate> {
    let present: HashSet<PathBuf> = devices.iter().map(|d| d.path.clone()).collect();
    let mut removed: Vec<&PathBuf> = known.difference(&present).collect();
    removed.sort();

    let mut candidates: Vec<Candidate> = removed
        .into_iter()
        .map(|path| Candidate::Remove(path.clone()))
        .collect();
    candidates.extend(
        devices
            .into_iter()
            .filter(|d| !known.contains(&d.path))
            .map(Candidate::Insert),
    );
    candidates
}

// ──────────────────── runtime fallback ────────────────────

pub struct AdaptiveObserver {
    active: Box<dyn DeviceObserver>,
    fallback: Option<Box<dyn DeviceObserver>>,
    logger: Option<ActivityLoggerHandle>,
}

impl AdaptiveObserver {
    #[must_use]
    pub fn new(
        primary: Box<dyn DeviceObserver>,
        fallback: Box<dyn DeviceObserver>,
        logger: Option<ActivityLoggerHandle>,
    ) -> Self {
        Self {
            active: primary,
            fallback: Some(fallback),
            logger,
        }
    }
}

impl DeviceObserver for AdaptiveObserver {
    fn name(&self) -> &'static str {
        self.active.name()
    }

    fn next_candidates(
        &mut self,
        known: &HashSet<PathBuf>,
        token: &ShutdownToken,
    ) -> Result<Vec<Candidate>> {
        match self.active.next_candidates(known, token) {
            Ok(candidates) => Ok(candidates),
            Err(err) => {
                let Some(fallback) = self.fallback.take() else {
                    return Err(err);
                };
                eprintln!(
                    "[SG-MONITOR] {} observer failed ({err}); falling back to {}",
                    self.active.name(),
                    fallback.name()
                );
                emit(
                    self.logger.as_ref(),
                    ActivityEvent::ObserverFallback {
                        from: self.active.name().to_string(),
                        to: fallback.name().to_string(),
                        reason: err.to_string(),
                    },
                );
                self.active = fallback;
                Ok(Vec::new())
            }
        }
    }
}

/// Pick the strategy once at start-up: uevent subscription when preferred
/// and available (with polling as the runtime fallback), else polling.
#[must_use]
pub fn select_observer(
    platform: &Arc<dyn Platform>,
    config: &MonitorConfig,
    logger: Option<&ActivityLoggerHandle>,
) -> Box<dyn DeviceObserver> {
    let polling = Box::new(PollingObserver::new(
        Arc::clone(platform),
        Duration::from_millis(config.poll_interval_ms),
    ));
    let observer: Box<dyn DeviceObserver> = match subscribe(platform, config) {
        Some(events) => Box::new(AdaptiveObserver::new(events, polling, logger.cloned())),
        None => polling,
    };
    eprintln!("[SG-MONITOR] using {} observer", observer.name());
    emit(
        logger,
        ActivityEvent::ObserverSelected {
            strategy: observer.name().to_string(),
        },
    );
    observer
}

#[cfg(target_os = "linux")]
fn subscribe(platform: &Arc<dyn Platform>, config: &MonitorConfig) -> Option<Box<dyn DeviceObserver>> {
    if !config.prefer_events {
        return None;
    }
    match NetlinkUeventSource::open() {
        Ok(source) => Some(Box::new(UeventObserver::new(
            Box::new(source),
            Arc::clone(platform),
        ))),
        Err(e) => {
            eprintln!("[SG-MONITOR] uevent subscription unavailable: {e}");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn subscribe(_platform: &Arc<dyn Platform>, _config: &MonitorConfig) -> Option<Box<dyn DeviceObserver>> {
    None
}

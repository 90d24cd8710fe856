//! Platform abstraction layer: mount table, removable-device enumeration and
//! external-transport classification.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SafegateError};

/// Placeholder used when the capacity of a device cannot be determined.
pub const UNKNOWN_CAPACITY: &str = "Unknown";
/// Placeholder used when a filesystem carries no volume label.
pub const UNLABELED: &str = "Unlabeled";

/// One row of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: String,
    pub fs_type: String,
}

/// Snapshot of a removable storage partition.
///
/// The device path is the identity key. Everything else is best-effort
/// metadata captured when the device was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub path: PathBuf,
    pub capacity: String,
    pub label: String,
    pub mount_point: Option<PathBuf>,
    pub transport: String,
}

impl Device {
    /// A device known only by its path.
    #[must_use]
    pub fn placeholder(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: UNKNOWN_CAPACITY.to_string(),
            label: UNLABELED.to_string(),
            mount_point: None,
            transport: String::new(),
        }
    }

    /// Only mounted devices can be scanned and uploaded.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.mount_point.is_some()
    }

    /// Label for human-facing messages; falls back to the device node name.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.label.is_empty() || self.label == UNLABELED {
            self.path.file_name().map_or_else(
                || self.path.display().to_string(),
                |name| name.to_string_lossy().into_owned(),
            )
        } else {
            self.label.clone()
        }
    }
}

/// Platform abstraction consumed by the device monitor and observers.
pub trait Platform: Send + Sync {
    /// Current kernel mount table, freshly read.
    fn mount_points(&self) -> Result<Vec<MountPoint>>;

    /// Externally attached, partition-type, mounted storage devices.
    fn external_devices(&self) -> Result<Vec<Device>>;

    /// Describe one device node. `Ok(None)` when the node is not a partition
    /// on an external transport.
    fn describe(&self, device: &Path) -> Result<Option<Device>>;

    /// Where `device` is mounted, if anywhere.
    fn mount_point_of(&self, device: &Path) -> Result<Option<PathBuf>> {
        let mounts = self.mount_points()?;
        Ok(mounts
            .into_iter()
            .find(|mount| Path::new(&mount.device) == device)
            .map(|mount| mount.path))
    }

    /// Whether `device` currently appears in the mount table.
    fn is_mounted(&self, device: &Path) -> Result<bool> {
        Ok(self.mount_point_of(device)?.is_some())
    }
}

// ──────────────────── Linux (sysfs + /proc) ────────────────────

/// Linux implementation reading `/sys/block`, `/dev/disk/by-label` and
/// `/proc/self/mounts`.
#[derive(Debug)]
pub struct LinuxPlatform {
    sys_block: PathBuf,
    by_label: PathBuf,
    dev_root: PathBuf,
    mounts_file: PathBuf,
    external_transports: Vec<String>,
    partition_name: Regex,
}

impl LinuxPlatform {
    pub fn new(external_transports: &[String]) -> Result<Self> {
        Self::with_roots(
            Path::new("/sys/block"),
            Path::new("/dev/disk/by-label"),
            Path::new("/dev"),
            Path::new("/proc/self/mounts"),
            external_transports,
        )
    }

    /// Point the platform at alternative sysfs/dev/mount-table locations.
    pub fn with_roots(
        sys_block: &Path,
        by_label: &Path,
        dev_root: &Path,
        mounts_file: &Path,
        external_transports: &[String],
    ) -> Result<Self> {
        let partition_name =
            Regex::new(r"^(?:(?P<prefixed>nvme\d+n\d+|mmcblk\d+|md\d+)p\d+|(?P<plain>[a-z]+)\d+)$")
                .map_err(|err| SafegateError::Runtime {
                    details: format!("partition name pattern: {err}"),
                })?;
        Ok(Self {
            sys_block: sys_block.to_path_buf(),
            by_label: by_label.to_path_buf(),
            dev_root: dev_root.to_path_buf(),
            mounts_file: mounts_file.to_path_buf(),
            external_transports: external_transports.to_vec(),
            partition_name,
        })
    }

    /// Disk that owns a partition node name (`sdb1` → `sdb`, `mmcblk0p1` → `mmcblk0`).
    fn parent_disk(&self, partition: &str) -> Option<String> {
        let caps = self.partition_name.captures(partition)?;
        caps.name("prefixed")
            .or_else(|| caps.name("plain"))
            .map(|m| m.as_str().to_string())
    }

    fn is_external_transport(&self, transport: &str) -> bool {
        self.external_transports.iter().any(|t| t == transport)
    }

    fn transport_of(&self, disk: &str) -> String {
        fs::canonicalize(self.sys_block.join(disk).join("device"))
            .map(|resolved| transport_from_sysfs_path(&resolved))
            .unwrap_or_default()
    }

    fn read_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let Ok(entries) = fs::read_dir(&self.by_label) {
            for entry in entries.flatten() {
                if let Ok(target) = fs::read_link(entry.path()) {
                    if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                        labels.insert(
                            name.to_string(),
                            decode_label(&entry.file_name().to_string_lossy()),
                        );
                    }
                }
            }
        }
        labels
    }

    fn build_device(
        &self,
        disk: &str,
        partition: &str,
        transport: &str,
        labels: &HashMap<String, String>,
        mounts: &[MountPoint],
    ) -> Device {
        let path = self.dev_root.join(partition);
        let capacity = read_u64(self.sys_block.join(disk).join(partition).join("size"))
            .map_or_else(
                || UNKNOWN_CAPACITY.to_string(),
                |sectors| format_capacity(sectors.saturating_mul(512)),
            );
        let mount_point = mounts
            .iter()
            .find(|mount| Path::new(&mount.device) == path)
            .map(|mount| mount.path.clone());
        Device {
            capacity,
            label: labels
                .get(partition)
                .cloned()
                .unwrap_or_else(|| UNLABELED.to_string()),
            mount_point,
            transport: transport.to_string(),
            path,
        }
    }
}

impl Platform for LinuxPlatform {
    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        let raw = fs::read_to_string(&self.mounts_file)
            .map_err(|source| SafegateError::io(&self.mounts_file, source))?;
        Ok(parse_proc_mounts(&raw))
    }

    fn external_devices(&self) -> Result<Vec<Device>> {
        let mounts = self.mount_points()?;
        let labels = self.read_labels();
        let entries =
            fs::read_dir(&self.sys_block).map_err(|source| SafegateError::DeviceEnumeration {
                details: format!("{}: {source}", self.sys_block.display()),
            })?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let disk = entry.file_name().to_string_lossy().into_owned();
            if is_virtual_disk(&disk) {
                continue;
            }
            let transport = self.transport_of(&disk);
            if !self.is_external_transport(&transport) {
                continue;
            }
            let Ok(children) = fs::read_dir(entry.path()) else {
                continue;
            };
            for child in children.flatten() {
                if !child.path().join("partition").exists() {
                    continue;
                }
                let partition = child.file_name().to_string_lossy().into_owned();
                let device = self.build_device(&disk, &partition, &transport, &labels, &mounts);
                if device.mount_point.is_some() {
                    devices.push(device);
                }
            }
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    fn describe(&self, device: &Path) -> Result<Option<Device>> {
        let Some(partition) = device.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(disk) = self.parent_disk(partition) else {
            return Ok(None);
        };
        if !self.sys_block.join(&disk).join(partition).join("partition").exists() {
            return Ok(None);
        }
        let transport = self.transport_of(&disk);
        if !self.is_external_transport(&transport) {
            return Ok(None);
        }
        let mounts = self.mount_points()?;
        let labels = self.read_labels();
        Ok(Some(self.build_device(
            &disk, partition, &transport, &labels, &mounts,
        )))
    }
}

/// Detect the active platform implementation.
pub fn detect_platform(external_transports: &[String]) -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new(external_transports)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = external_transports;
        Err(SafegateError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

// ──────────────────── mock ────────────────────

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<PathBuf, Device>,
    fail_enumeration: bool,
}

/// In-memory platform for deterministic tests. Clones share state, so a test
/// can plug and unplug devices while a monitor holds another clone.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<RwLock<MockState>>,
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device (mounted when `mount_point` is set).
    pub fn plug(&self, device: Device) {
        self.state.write().devices.insert(device.path.clone(), device);
    }

    pub fn unplug(&self, path: &Path) {
        self.state.write().devices.remove(path);
    }

    pub fn set_mount(&self, path: &Path, mount_point: Option<PathBuf>) {
        if let Some(device) = self.state.write().devices.get_mut(path) {
            device.mount_point = mount_point;
        }
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state.write().fail_enumeration = fail;
    }

    fn check_failure(&self) -> Result<()> {
        if self.state.read().fail_enumeration {
            return Err(SafegateError::DeviceEnumeration {
                details: "mock enumeration failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Platform for MockPlatform {
    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        self.check_failure()?;
        Ok(self
            .state
            .read()
            .devices
            .values()
            .filter_map(|device| {
                device.mount_point.as_ref().map(|mount| MountPoint {
                    path: mount.clone(),
                    device: device.path.to_string_lossy().into_owned(),
                    fs_type: "vfat".to_string(),
                })
            })
            .collect())
    }

    fn external_devices(&self) -> Result<Vec<Device>> {
        self.check_failure()?;
        Ok(self
            .state
            .read()
            .devices
            .values()
            .filter(|device| device.transport == "usb" && device.is_eligible())
            .cloned()
            .collect())
    }

    fn describe(&self, device: &Path) -> Result<Option<Device>> {
        self.check_failure()?;
        Ok(self
            .state
            .read()
            .devices
            .get(device)
            .filter(|d| d.transport == "usb")
            .cloned())
    }
}

// ──────────────────── helpers ────────────────────

fn parse_proc_mounts(raw: &str) -> Vec<MountPoint> {
    let mut mounts = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            eprintln!("[SG-PLATFORM] warning: skipping malformed mount table line: {line}");
            continue;
        }
        mounts.push(MountPoint {
            path: unescape_mount_path(fields[1]),
            device: fields[0].to_string(),
            fs_type: fields[2].to_string(),
        });
    }
    mounts
}

/// Decode octal escape sequences (`\NNN`) used by the Linux kernel.
/// Returns a PathBuf via OsString to preserve raw bytes (e.g. invalid UTF-8).
fn unescape_mount_path(raw: &str) -> PathBuf {
    let raw_bytes = raw.as_bytes();
    let mut bytes = Vec::with_capacity(raw_bytes.len());
    let mut i = 0;
    while i < raw_bytes.len() {
        if raw_bytes[i] == b'\\' && i + 3 < raw_bytes.len() {
            let digits = &raw_bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let val = digits
                    .iter()
                    .fold(0_u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(val) {
                    bytes.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        bytes.push(raw_bytes[i]);
        i += 1;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// udev encodes unsafe characters in `/dev/disk/by-label` as `\xNN`.
fn decode_label(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            if let Ok(val) = u8::from_str_radix(&raw[i + 2..i + 4], 16) {
                out.push(val);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Classify the bus a block device hangs off from its resolved sysfs path.
fn transport_from_sysfs_path(resolved: &Path) -> String {
    let mut transport = String::new();
    for component in resolved.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let part = part.to_string_lossy();
        // The closest bus to the device wins, so keep overwriting.
        if part.starts_with("usb") {
            transport = "usb".to_string();
        } else if part.starts_with("ata") {
            transport = "sata".to_string();
        } else if part == "nvme" || part.starts_with("nvme") {
            transport = "nvme".to_string();
        } else if part.starts_with("mmc") {
            transport = "mmc".to_string();
        } else if part.starts_with("virtio") {
            transport = "virtio".to_string();
        } else if part.starts_with("fw") || part.starts_with("firewire") {
            transport = "ieee1394".to_string();
        }
    }
    transport
}

fn is_virtual_disk(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md", "sr", "nbd"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Human capacity in the `lsblk` style (`14.9G`, `512M`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_capacity(bytes: u64) -> String {
    if bytes == 0 {
        return UNKNOWN_CAPACITY.to_string();
    }
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 || (value.fract() < 0.05 && value >= 10.0) {
        format!("{value:.0}{}", UNITS[unit])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_table_with_escaped_spaces() {
        let sample = "/dev/sda2 / ext4 rw,relatime 0 0\n\
                      /dev/sdb1 /media/pi/MY\\040STICK vfat rw,nosuid 0 0\n\
                      garbage\n";
        let mounts = parse_proc_mounts(sample);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[1].path, Path::new("/media/pi/MY STICK"));
        assert_eq!(mounts[1].device, "/dev/sdb1");
        assert_eq!(mounts[1].fs_type, "vfat");
    }

    #[test]
    fn out_of_range_octal_escape_is_kept_verbatim() {
        assert_eq!(unescape_mount_path("/media/\\777x"), Path::new("/media/\\777x"));
        assert_eq!(unescape_mount_path("/media/a\\134b"), Path::new("/media/a\\b"));
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            let top = unescape_mount_path("/media/\\377");
            assert_eq!(top.as_os_str().as_bytes(), b"/media/\xff");
        }
    }

    #[test]
    fn transport_is_taken_from_closest_bus() {
        let usb = Path::new(
            "/sys/devices/pci0000:00/0000:00:14.0/usb2/2-1/2-1:1.0/host6/target6:0:0/6:0:0:0",
        );
        assert_eq!(transport_from_sysfs_path(usb), "usb");
        let sata = Path::new("/sys/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0");
        assert_eq!(transport_from_sysfs_path(sata), "sata");
        let nvme = Path::new("/sys/devices/pci0000:00/0000:00:1d.0/0000:3d:00.0/nvme/nvme0");
        assert_eq!(transport_from_sysfs_path(nvme), "nvme");
        assert_eq!(transport_from_sysfs_path(Path::new("/sys/devices/virtual")), "");
    }

    #[test]
    fn label_escapes_are_decoded() {
        assert_eq!(decode_label("MY\\x20STICK"), "MY STICK");
        assert_eq!(decode_label("plain"), "plain");
        assert_eq!(decode_label("bad\\xZZ"), "bad\\xZZ");
    }

    #[test]
    fn capacity_formatting_matches_lsblk_style() {
        assert_eq!(format_capacity(0), UNKNOWN_CAPACITY);
        assert_eq!(format_capacity(512), "512B");
        assert_eq!(format_capacity(512 * 1024 * 1024), "512M");
        assert_eq!(format_capacity(16_000_000_000), "14.9G");
    }

    #[test]
    fn parent_disk_handles_common_naming_schemes() {
        let platform = LinuxPlatform::new(&["usb".to_string()]).unwrap();
        assert_eq!(platform.parent_disk("sdb1").as_deref(), Some("sdb"));
        assert_eq!(platform.parent_disk("mmcblk0p2").as_deref(), Some("mmcblk0"));
        assert_eq!(platform.parent_disk("nvme0n1p3").as_deref(), Some("nvme0n1"));
        assert_eq!(platform.parent_disk("sdb"), None);
    }

    #[test]
    fn device_display_name_falls_back_to_node() {
        let mut device = Device::placeholder("/dev/sdc1");
        assert_eq!(device.display_name(), "sdc1");
        assert!(!device.is_eligible());
        device.label = "BACKUP".to_string();
        assert_eq!(device.display_name(), "BACKUP");
    }

    #[cfg(unix)]
    fn fake_sysfs(root: &Path) -> LinuxPlatform {
        use std::os::unix::fs::symlink;

        let sys_block = root.join("sys/block");
        let devices = root.join("sys/devices");
        let usb_target = devices.join("pci0000:00/usb1/1-1/host6/target6:0:0/6:0:0:0");
        let ata_target = devices.join("pci0000:00/ata1/host0/target0:0:0/0:0:0:0");
        fs::create_dir_all(&usb_target).unwrap();
        fs::create_dir_all(&ata_target).unwrap();

        for (disk, part, target) in [("sdb", "sdb1", &usb_target), ("sda", "sda1", &ata_target)] {
            let disk_dir = sys_block.join(disk);
            fs::create_dir_all(disk_dir.join(part)).unwrap();
            fs::write(disk_dir.join(part).join("partition"), "1\n").unwrap();
            fs::write(disk_dir.join(part).join("size"), "31250000\n").unwrap();
            symlink(target, disk_dir.join("device")).unwrap();
        }

        let by_label = root.join("dev/disk/by-label");
        fs::create_dir_all(&by_label).unwrap();
        symlink("../../sdb1", by_label.join("KINGSTON")).unwrap();

        let mounts = root.join("mounts");
        fs::write(
            &mounts,
            format!(
                "/dev/sda1 / ext4 rw 0 0\n{}/sdb1 /media/pi/KINGSTON vfat rw 0 0\n",
                root.join("dev").display()
            ),
        )
        .unwrap();

        LinuxPlatform::with_roots(
            &sys_block,
            &by_label,
            &root.join("dev"),
            &mounts,
            &["usb".to_string()],
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn enumerates_only_mounted_usb_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let platform = fake_sysfs(dir.path());

        let devices = platform.external_devices().unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.path, dir.path().join("dev/sdb1"));
        assert_eq!(device.label, "KINGSTON");
        assert_eq!(device.transport, "usb");
        assert_eq!(device.capacity, "14.9G");
        assert_eq!(
            device.mount_point.as_deref(),
            Some(Path::new("/media/pi/KINGSTON"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn describe_rejects_internal_disks() {
        let dir = tempfile::tempdir().unwrap();
        let platform = fake_sysfs(dir.path());

        assert!(platform.describe(&dir.path().join("dev/sda1")).unwrap().is_none());
        let usb = platform.describe(&dir.path().join("dev/sdb1")).unwrap();
        assert_eq!(usb.map(|d| d.label), Some("KINGSTON".to_string()));
        assert!(platform.is_mounted(&dir.path().join("dev/sdb1")).unwrap());
        assert!(!platform.is_mounted(&dir.path().join("dev/sdc1")).unwrap());
    }

    #[test]
    fn mock_platform_shares_state_between_clones() {
        let platform = MockPlatform::new();
        let observer_view = platform.clone();
        let mut device = Device::placeholder("/dev/sdb1");
        device.transport = "usb".to_string();
        device.mount_point = Some(PathBuf::from("/media/usb"));
        platform.plug(device);

        assert_eq!(observer_view.external_devices().unwrap().len(), 1);
        platform.set_mount(Path::new("/dev/sdb1"), None);
        assert!(observer_view.external_devices().unwrap().is_empty());
        assert!(!observer_view.is_mounted(Path::new("/dev/sdb1")).unwrap());

        platform.fail_enumeration(true);
        assert!(observer_view.external_devices().is_err());
    }
}

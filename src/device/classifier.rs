// Copyright 2025 HwameiStor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resolves a device identifier into the attribute bundle: udev properties
//! via `udevadm info`, capacity and rotational class via sysfs.

use crate::types::v1alpha1::LINK_BY_PATH;
use crate::types::v1alpha1::disk::{DiskClass, PartitionInfo};
use crate::utils::shell;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

const SECTOR_SIZE: i64 = 512;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Shell { source: shell::Error },

    #[snafu(display("failed to read sysfs attribute {}: {}", path.display(), source))]
    Sysfs {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Normalized attribute bundle for one whole block device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceAttributes {
    /// Node name sda, sdb, nvme0n1 etc.
    pub dev_name: String,

    /// Kernel-canonical path, e.g. /dev/sdb.
    pub dev_path: String,

    /// Hardware path under /sys/devices.
    pub sys_path: String,

    /// disk, partition etc.
    pub dev_type: String,

    pub subsystem: String,

    pub major: String,
    pub minor: String,

    pub bus: String,
    pub model: String,
    pub vendor: String,
    pub serial: String,
    pub wwn: String,
    pub fs_type: String,
    pub part_table_type: String,
    pub id_type: String,

    pub dev_links: Vec<String>,

    /// Bytes, computed once at ingest as 512 x sector count.
    pub capacity: i64,

    pub class: DiskClass,

    pub partitions: Vec<PartitionInfo>,
}

impl DeviceAttributes {
    /// Filter out disks that are virtual or cannot identify themselves.
    pub fn is_manageable_disk(&self) -> bool {
        if self.serial.is_empty()
            && !self.dev_links.iter().any(|l| l.contains(LINK_BY_PATH))
        {
            return false;
        }

        if self.sys_path.contains("/virtual/") {
            return false;
        }

        if is_virtual_name(&self.dev_name) {
            return false;
        }

        // For some disks (e.g. cloud HDD images) ID_TYPE may be empty.
        (self.id_type == "disk" || self.id_type.is_empty()) && self.dev_type == "disk"
    }
}

/// loop/ram/dm/md/zram devices never enter the main pipeline.
pub fn is_virtual_name(name: &str) -> bool {
    ["loop", "ram", "dm-", "md", "zram"]
        .iter()
        .any(|p| name.starts_with(p))
}

/// Parse `udevadm info --query=property` output into a key/value map.
/// DEVLINKS is space-separated and kept under its own key.
pub fn parse_udev_properties(output: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    for line in shell::lines(output) {
        // `--export-prefix` style lines and monitor headers carry no '='
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        props.insert(key.trim().to_string(), value.trim().to_string());
    }
    props
}

/// Build the attribute bundle from a udev property map plus sysfs reads.
pub fn bundle_from_properties(
    props: &BTreeMap<String, String>,
    sysfs_root: &Path,
) -> DeviceAttributes {
    let get = |key: &str| props.get(key).cloned().unwrap_or_default();

    let dev_path = get("DEVNAME");
    let dev_name = dev_path.rsplit('/').next().unwrap_or_default().to_string();

    let dev_links: Vec<String> = get("DEVLINKS")
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut attrs = DeviceAttributes {
        dev_name: dev_name.clone(),
        dev_path,
        sys_path: get("DEVPATH"),
        dev_type: get("DEVTYPE"),
        subsystem: get("SUBSYSTEM"),
        major: get("MAJOR"),
        minor: get("MINOR"),
        bus: get("ID_BUS"),
        model: get("ID_MODEL"),
        vendor: get("ID_VENDOR"),
        serial: get("ID_SERIAL"),
        wwn: get("ID_WWN"),
        fs_type: get("ID_FS_TYPE"),
        part_table_type: get("ID_PART_TABLE_TYPE"),
        id_type: get("ID_TYPE"),
        dev_links,
        ..Default::default()
    };

    attrs.capacity = read_capacity(sysfs_root, &dev_name).unwrap_or(0);
    attrs.class = classify(sysfs_root, &dev_name);
    attrs.partitions = read_partitions(sysfs_root, &dev_name);
    attrs
}

/// Rotational -> HDD, non-rotational -> SSD; a `nvme` device-name prefix
/// forces NVMe regardless of the rotational flag.
pub fn classify(sysfs_root: &Path, dev_name: &str) -> DiskClass {
    if dev_name.starts_with("nvme") {
        return DiskClass::NVMe;
    }

    match read_sysfs(sysfs_root, dev_name, "queue/rotational").as_deref() {
        Some("0") => DiskClass::SSD,
        _ => DiskClass::HDD,
    }
}

/// Capacity in bytes, 512 x sector count.
pub fn read_capacity(sysfs_root: &Path, dev_name: &str) -> Option<i64> {
    read_sysfs(sysfs_root, dev_name, "size")?
        .parse::<i64>()
        .ok()
        .map(|sectors| sectors * SECTOR_SIZE)
}

/// Enumerate partitions of a whole device from sysfs subdirectories.
pub fn read_partitions(sysfs_root: &Path, dev_name: &str) -> Vec<PartitionInfo> {
    let dir = sysfs_root.join("class/block").join(dev_name);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut partitions = Vec::new();
    for entry in entries.flatten() {
        let child = entry.file_name().to_string_lossy().to_string();
        if !child.starts_with(dev_name) {
            continue;
        }
        if entry.path().join("partition").exists() {
            partitions.push(PartitionInfo {
                path: format!("/dev/{child}"),
                ..Default::default()
            });
        }
    }
    partitions.sort_by(|a, b| a.path.cmp(&b.path));
    partitions
}

fn read_sysfs(sysfs_root: &Path, dev_name: &str, attr: &str) -> Option<String> {
    let path = sysfs_root.join("class/block").join(dev_name).join(attr);
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Resolve one device node through `udevadm info` and sysfs.
pub async fn resolve(dev: &str, sysfs_root: &Path) -> Result<DeviceAttributes, Error> {
    let output = shell::run("udevadm", &["info", "--query=property", "--name", dev]).await?;
    let props = parse_udev_properties(&output);
    Ok(bundle_from_properties(&props, sysfs_root))
}

/// Enumerate every whole block device currently visible on the host.
/// Partitions and virtual devices are skipped before resolution.
pub async fn list_block_devices(sysfs_root: &Path) -> Result<Vec<DeviceAttributes>, Error> {
    let dir = sysfs_root.join("class/block");
    let entries = std::fs::read_dir(&dir).map_err(|source| Error::Sysfs {
        path: dir.clone(),
        source,
    })?;

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_name(&name) || entry.path().join("partition").exists() {
            continue;
        }

        match resolve(&format!("/dev/{name}"), sysfs_root).await {
            Ok(attrs) => devices.push(attrs),
            Err(err) => {
                warn!(device = %name, error = %err, "skipping unresolvable block device");
            }
        }
    }
    devices.sort_by(|a, b| a.dev_name.cmp(&b.dev_name));
    Ok(devices)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const UDEV_OUTPUT: &str = "\
DEVPATH=/devices/pci0000:ae/0000:b1:00.0/host2/target2:1:0/2:1:0:0/block/sdb
DEVNAME=/dev/sdb
DEVTYPE=disk
SUBSYSTEM=block
MAJOR=8
MINOR=16
ID_BUS=scsi
ID_MODEL=ST4000NM0035
ID_VENDOR=SEAGATE
ID_SERIAL=ZC11Y2AM0000C9114JQX
ID_WWN=0x5000c500a1b2c3d4
ID_TYPE=disk
DEVLINKS=/dev/disk/by-id/wwn-0x5000c500a1b2c3d4 /dev/disk/by-path/pci-0000:b1:00.0-scsi-0:1:0:0
";

    #[test]
    fn parses_udev_properties() {
        let props = parse_udev_properties(UDEV_OUTPUT);
        assert_eq!(props.get("DEVNAME").map(String::as_str), Some("/dev/sdb"));
        assert_eq!(props.get("ID_SERIAL").map(String::as_str), Some("ZC11Y2AM0000C9114JQX"));
        assert_eq!(props.get("MAJOR").map(String::as_str), Some("8"));
    }

    #[test]
    fn bundle_carries_identity_and_links() {
        let props = parse_udev_properties(UDEV_OUTPUT);
        let attrs = bundle_from_properties(&props, Path::new("/nonexistent"));
        assert_eq!(attrs.dev_name, "sdb");
        assert_eq!(attrs.dev_path, "/dev/sdb");
        assert_eq!(attrs.dev_links.len(), 2);
        assert!(attrs.is_manageable_disk());
    }

    #[test]
    fn serial_less_disk_needs_by_path_link() {
        let mut attrs = DeviceAttributes {
            dev_name: "sdc".into(),
            dev_path: "/dev/sdc".into(),
            dev_type: "disk".into(),
            id_type: "disk".into(),
            ..Default::default()
        };
        assert!(!attrs.is_manageable_disk());

        attrs.dev_links = vec!["/dev/disk/by-path/pci-0000:b1:00.0-scsi-0:1:0:1".into()];
        assert!(attrs.is_manageable_disk());
    }

    #[test]
    fn virtual_devices_are_filtered() {
        for name in ["loop0", "ram2", "dm-1", "md0", "zram0"] {
            assert!(is_virtual_name(name), "{name} should be virtual");
        }
        assert!(!is_virtual_name("sda"));
        assert!(!is_virtual_name("nvme0n1"));

        let attrs = DeviceAttributes {
            dev_name: "sdd".into(),
            serial: "X".into(),
            sys_path: "/devices/virtual/block/sdd".into(),
            dev_type: "disk".into(),
            id_type: "disk".into(),
            ..Default::default()
        };
        assert!(!attrs.is_manageable_disk());
    }

    #[test]
    fn partitions_are_not_disks() {
        let attrs = DeviceAttributes {
            dev_name: "sdb1".into(),
            serial: "X".into(),
            dev_type: "partition".into(),
            id_type: "partition".into(),
            ..Default::default()
        };
        assert!(!attrs.is_manageable_disk());
    }

    #[test]
    fn capacity_is_sectors_times_512() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("class/block/sdb");
        std::fs::create_dir_all(&dev).unwrap();
        // 100 GiB expressed in 512-byte sectors
        std::fs::write(dev.join("size"), "209715200\n").unwrap();
        assert_eq!(
            read_capacity(dir.path(), "sdb"),
            Some(100 * 1024 * 1024 * 1024)
        );
    }

    #[test]
    fn nvme_name_overrides_rotational() {
        assert_eq!(classify(Path::new("/nonexistent"), "nvme0n1"), DiskClass::NVMe);
        // missing rotational flag falls back to HDD
        assert_eq!(classify(Path::new("/nonexistent"), "sda"), DiskClass::HDD);
    }
}

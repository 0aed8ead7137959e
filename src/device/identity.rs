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

//! Content-derived disk identity. The record name must survive reboots and
//! dev-name reshuffles, so it hashes stable hardware identifiers only.

use crate::device::classifier::DeviceAttributes;
use crate::types::v1alpha1::{LINK_BY_PATH, LOCAL_DISK_OBJECT_PREFIX};
use sha2::{Digest, Sha256};

/// Models that virtualization stacks stamp on every disk; they carry no
/// identity, so the host and dev name are mixed in as well.
const GENERIC_VIRTUAL_MODELS: [&str; 4] = [
    "Virtual_disk",
    "Virtual disk",
    "QEMU_HARDDISK",
    "VBOX_HARDDISK",
];

/// Derive the disk identity hash from (serial, model, vendor, WWN).
///
/// Devices reporting a generic virtual-disk model, and devices with no
/// serial at all, additionally mix in (host, dev name or by-path link) so
/// that two identical virtual disks on different slots stay distinct.
/// Returns None when the device has nothing to identify it by.
pub fn disk_uuid(attrs: &DeviceAttributes, host: &str) -> Option<String> {
    let mut elements = String::new();

    if !attrs.serial.is_empty() {
        elements.push_str(&attrs.serial);
        elements.push_str(&attrs.model);
        elements.push_str(&attrs.vendor);
        elements.push_str(&attrs.wwn);
    }

    let generic_model = GENERIC_VIRTUAL_MODELS.iter().any(|m| attrs.model == *m);
    if attrs.serial.is_empty() || generic_model {
        let by_path = attrs.dev_links.iter().find(|l| l.contains(LINK_BY_PATH));
        match by_path {
            Some(link) => {
                elements.push_str(host);
                elements.push_str(link);
            }
            None if attrs.serial.is_empty() => return None,
            None => {
                elements.push_str(host);
                elements.push_str(&attrs.dev_name);
            }
        }
    }

    if elements.is_empty() {
        return None;
    }

    let digest = Sha256::digest(elements.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

/// Object name of the LocalDisk record for this identity.
pub fn object_name(uuid: &str) -> String {
    format!("{LOCAL_DISK_OBJECT_PREFIX}{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical_disk() -> DeviceAttributes {
        DeviceAttributes {
            dev_name: "sdb".into(),
            serial: "ZC11Y2AM".into(),
            model: "ST4000NM0035".into(),
            vendor: "SEAGATE".into(),
            wwn: "0x5000c500a1b2c3d4".into(),
            ..Default::default()
        }
    }

    #[test]
    fn identity_is_deterministic() {
        let a = disk_uuid(&physical_disk(), "node-1");
        let b = disk_uuid(&physical_disk(), "node-1");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn identity_ignores_host_for_physical_disks() {
        // a physical disk keeps its identity when it moves between nodes
        let a = disk_uuid(&physical_disk(), "node-1");
        let b = disk_uuid(&physical_disk(), "node-2");
        assert_eq!(a, b);
    }

    #[test]
    fn identity_ignores_dev_name_reshuffle() {
        let mut moved = physical_disk();
        moved.dev_name = "sdc".into();
        assert_eq!(disk_uuid(&physical_disk(), "n"), disk_uuid(&moved, "n"));
    }

    #[test]
    fn virtual_disks_mix_in_host_and_slot() {
        let mut a = physical_disk();
        a.model = "Virtual_disk".into();
        a.dev_links = vec!["/dev/disk/by-path/pci-0000:00:10.0-scsi-0:0:0:0".into()];

        let mut b = a.clone();
        b.dev_links = vec!["/dev/disk/by-path/pci-0000:00:10.0-scsi-0:0:1:0".into()];

        assert_ne!(disk_uuid(&a, "node-1"), disk_uuid(&b, "node-1"));
        assert_ne!(disk_uuid(&a, "node-1"), disk_uuid(&a, "node-2"));
    }

    #[test]
    fn serial_less_disk_without_by_path_has_no_identity() {
        let attrs = DeviceAttributes {
            dev_name: "sdz".into(),
            ..Default::default()
        };
        assert_eq!(disk_uuid(&attrs, "node-1"), None);
    }

    #[test]
    fn object_name_is_prefixed() {
        let name = object_name("abc123");
        assert_eq!(name, "localdisk-abc123");
    }
}

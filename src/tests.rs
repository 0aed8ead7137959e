//  Copyright 2025 HwameiStor Team
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http:www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use crate::device::classifier::DeviceAttributes;
use crate::types::v1alpha1::claim::{DiskClaimDescription, LocalDiskClaim, LocalDiskClaimSpec};
use crate::types::v1alpha1::disk::{
    DiskClass, DiskLifecycle, DiskState, LocalDisk, LocalDiskSpec, LocalDiskStatus,
};
use crate::types::v1alpha1::volume::{
    AccessibilityTopology, LocalDiskVolume, LocalDiskVolumeSpec,
};

// Helper fixtures shared by the module tests (reachable as crate::tests::*)

pub fn device_attrs(
    dev_name: &str,
    serial: &str,
    class: DiskClass,
    capacity: i64,
) -> DeviceAttributes {
    let mut dev_links = vec![format!(
        "/dev/disk/by-path/pci-0000:b1:00.0-scsi-0:0:{dev_name}:0"
    )];
    if !serial.is_empty() {
        dev_links.push(format!("/dev/disk/by-id/scsi-{serial}"));
    }
    DeviceAttributes {
        dev_name: dev_name.to_string(),
        dev_path: format!("/dev/{dev_name}"),
        sys_path: format!("/devices/pci0000:ae/0000:b1:00.0/host2/block/{dev_name}"),
        dev_type: "disk".to_string(),
        subsystem: "block".to_string(),
        major: "8".to_string(),
        minor: "16".to_string(),
        bus: "scsi".to_string(),
        model: "ST4000NM0035".to_string(),
        vendor: "SEAGATE".to_string(),
        serial: serial.to_string(),
        wwn: if serial.is_empty() {
            String::new()
        } else {
            format!("0x{serial:0>16}")
        },
        id_type: "disk".to_string(),
        dev_links,
        capacity,
        class,
        ..Default::default()
    }
}

pub fn disk_on_node(
    name: &str,
    node: &str,
    class: DiskClass,
    capacity: i64,
    lifecycle: DiskLifecycle,
) -> LocalDisk {
    let mut disk = LocalDisk::new(name, LocalDiskSpec::default());
    disk.spec.uuid = name.trim_start_matches("localdisk-").to_string();
    disk.spec.node_name = node.to_string();
    disk.spec.state = DiskState::Active;
    disk.spec.capacity = capacity;
    disk.spec.device_path = format!("/dev/{}", name.trim_start_matches("localdisk-"));
    disk.spec.dev_links = vec![format!("/dev/disk/by-id/scsi-{name}")];
    disk.spec.disk_attributes.disk_type = class;
    disk.spec.disk_attributes.dev_type = "disk".to_string();
    disk.spec.disk_attributes.serial_number = format!("SER-{name}");
    disk.status = Some(LocalDiskStatus { state: lifecycle });
    disk
}

pub fn claim_for(node: &str, class: DiskClass, capacity: i64) -> LocalDiskClaim {
    LocalDiskClaim::new(
        "claim-test",
        LocalDiskClaimSpec {
            node_name: node.to_string(),
            owner: "local-disk-manager".to_string(),
            description: DiskClaimDescription {
                disk_type: class,
                capacity,
                ..Default::default()
            },
            disk_refs: Vec::new(),
        },
    )
}

pub fn volume_on_node(
    name: &str,
    node: &str,
    class: DiskClass,
    capacity: i64,
) -> LocalDiskVolume {
    LocalDiskVolume::new(
        name,
        LocalDiskVolumeSpec {
            disk_type: class,
            required_capacity_bytes: capacity,
            accessibility: AccessibilityTopology {
                node: node.to_string(),
            },
            persistent_volume_claim_name: format!("default/{name}"),
            can_wipe: false,
        },
    )
}

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

use crate::types::v1alpha1::{LINK_BY_ID, LINK_BY_PATH, LINK_BY_UUID};
use k8s_openapi::api::core::v1 as corev1;
use kube::{CustomResource, KubeSchema, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;

/// Rotational class of a whole block device.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    JsonSchema,
    Display,
)]
pub enum DiskClass {
    #[default]
    HDD,
    SSD,
    NVMe,
}

impl DiskClass {
    /// Host directory name of the per-class pool, e.g. `LocalDisk_PoolHDD`.
    pub fn pool_name(&self) -> String {
        format!("LocalDisk_Pool{self}")
    }

    pub fn all() -> [DiskClass; 3] {
        [DiskClass::HDD, DiskClass::SSD, DiskClass::NVMe]
    }
}

/// Whether the kernel currently sees the device on the recorded node.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema, Display,
)]
pub enum DiskState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

/// Ownership state of a disk, CAS-updated by the claim resolver and the
/// volume reconciler.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema, Display,
)]
pub enum DiskLifecycle {
    #[default]
    Available,
    Bound,
    Reserved,
    Released,
    InUse,
}

impl DiskLifecycle {
    /// Only Available and Released disks may be picked by the resolver.
    pub fn selectable(&self) -> bool {
        matches!(self, DiskLifecycle::Available | DiskLifecycle::Released)
    }
}

/// Hardware/static attributes read from the kernel device database.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskAttributes {
    /// Rotational class derived by the classifier.
    pub disk_type: DiskClass,

    /// Device type reported by udev, e.g. disk, partition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wwn: String,

    /// Bus for data transport, such as ata, scsi, nvme.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Partition table type, such as gpt or dos.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub part_table_type: String,

    /// Filesystem signature on the whole device, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
}

/// Partition discovered on the device.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    /// Partition path in the OS, e.g. /dev/sdb1.
    pub path: String,

    #[serde(default)]
    pub has_file_system: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
}

/// Boolean overall-health bit plus the raw attribute table, both collected
/// by smartctl. A failed probe leaves the whole struct absent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct SmartInfo {
    /// Result of the drive self-assessment.
    pub overall_health: SmartAssessResult,

    /// Opaque per-family attribute table, carried as reported.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema, Display,
)]
pub enum SmartAssessResult {
    Passed,
    Failed,
    #[default]
    Unknown,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDisk",
    status = "LocalDiskStatus",
    shortname = "ld",
    plural = "localdisks",
    singular = "localdisk",
    printcolumn = r#"{"name":"NodeMatch", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"DevicePath", "type":"string", "jsonPath":".spec.devicePath"}"#,
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".spec.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskSpec {
    /// Node where the disk is attached; empty while Inactive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Node where the disk was last seen, preserved on Inactive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pre_node_name: String,

    /// Content-derived identity of the disk.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    /// Kernel-canonical device path, e.g. /dev/sdb; empty while Inactive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_path: String,

    /// Device path the disk last had, preserved on Inactive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pre_device_path: String,

    /// Stable symlinks exposed by the kernel device DB.
    #[serde(default)]
    pub dev_links: Vec<String>,

    /// Capacity in bytes.
    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub has_partition: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_info: Vec<PartitionInfo>,

    #[serde(default)]
    pub support_smart: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_info: Option<SmartInfo>,

    #[serde(default)]
    pub disk_attributes: DiskAttributes,

    /// Whether the kernel currently sees the device.
    #[serde(default)]
    pub state: DiskState,

    /// Back-pointer to the LocalDiskClaim that owns this disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<corev1::ObjectReference>,

    /// Set by the resolver during a multi-step bind; a reserved disk is
    /// never selected.
    #[serde(default)]
    pub reserved: bool,

    /// Which system owns this disk, e.g. local-disk-manager, system.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub major: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub minor: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskStatus {
    /// Ownership state of the disk.
    #[serde(default)]
    pub state: DiskLifecycle,
}

impl LocalDisk {
    pub fn name(&self) -> String {
        self.name_any()
    }

    pub fn lifecycle(&self) -> DiskLifecycle {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.spec.state == DiskState::Active
    }

    /// The dev-link set grouped by family, by-id/by-path/by-uuid only.
    pub fn dev_links_by_family(&self) -> BTreeMap<String, Vec<String>> {
        let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for link in &self.spec.dev_links {
            for family in [LINK_BY_ID, LINK_BY_PATH, LINK_BY_UUID] {
                if link.contains(family) {
                    links.entry(family.to_string()).or_default().push(link.clone());
                    break;
                }
            }
        }
        links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_strings_are_stable() {
        assert_eq!(serde_json::to_string(&DiskClass::HDD).ok(), Some("\"HDD\"".into()));
        assert_eq!(serde_json::to_string(&DiskClass::SSD).ok(), Some("\"SSD\"".into()));
        assert_eq!(serde_json::to_string(&DiskClass::NVMe).ok(), Some("\"NVMe\"".into()));
        assert_eq!(DiskClass::NVMe.pool_name(), "LocalDisk_PoolNVMe");
    }

    #[test]
    fn lifecycle_strings_are_stable() {
        for (state, repr) in [
            (DiskLifecycle::Available, "\"Available\""),
            (DiskLifecycle::Bound, "\"Bound\""),
            (DiskLifecycle::Reserved, "\"Reserved\""),
            (DiskLifecycle::Released, "\"Released\""),
            (DiskLifecycle::InUse, "\"InUse\""),
        ] {
            assert_eq!(serde_json::to_string(&state).ok(), Some(repr.into()));
        }
    }

    #[test]
    fn only_available_and_released_are_selectable() {
        assert!(DiskLifecycle::Available.selectable());
        assert!(DiskLifecycle::Released.selectable());
        assert!(!DiskLifecycle::Bound.selectable());
        assert!(!DiskLifecycle::Reserved.selectable());
        assert!(!DiskLifecycle::InUse.selectable());
    }

    #[test]
    fn dev_links_group_by_family() {
        let mut disk = LocalDisk::new("localdisk-x", LocalDiskSpec::default());
        disk.spec.dev_links = vec![
            "/dev/disk/by-id/wwn-0x5001b444a89e5acd".to_string(),
            "/dev/disk/by-path/pci-0000:03:00.0-scsi-0:0:0:0".to_string(),
            "/dev/mapper/something".to_string(),
        ];
        let grouped = disk.dev_links_by_family();
        assert_eq!(grouped.get(LINK_BY_ID).map(Vec::len), Some(1));
        assert_eq!(grouped.get(LINK_BY_PATH).map(Vec::len), Some(1));
        assert!(!grouped.contains_key(LINK_BY_UUID));
    }
}

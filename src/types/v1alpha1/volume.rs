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

use crate::types::v1alpha1::disk::DiskClass;
use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;

/// Phase in the create → mount → unmount → delete machine.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema, Display,
)]
pub enum VolumeState {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "Empty")]
    Empty,
    Created,
    NotReady,
    Ready,
    ToBeUnmount,
    ToBeDeleted,
    Deleted,
}

/// Next or current operation of one mount point.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema, Display,
)]
pub enum MountPointPhase {
    #[default]
    ToBeMounted,
    Mounted,
    ToBeUnMounted,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema, Display,
)]
pub enum VolumeAccessType {
    #[default]
    FileSystem,
    RawBlock,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub target_path: String,

    #[serde(default)]
    pub access_type: VolumeAccessType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,

    #[serde(default)]
    pub phase: MountPointPhase,
}

/// The single node a volume's device lives on.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityTopology {
    pub node: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskVolume",
    status = "LocalDiskVolumeStatus",
    shortname = "ldv",
    plural = "localdiskvolumes",
    singular = "localdiskvolume",
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.accessibility.node"}"#,
    printcolumn = r#"{"name":"Disk", "type":"string", "jsonPath":".status.devPath"}"#,
    printcolumn = r#"{"name":"AllocatedCap", "type":"integer", "jsonPath":".status.allocatedCapacityBytes"}"#,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.diskType"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskVolumeSpec {
    /// Required rotational class of the backing disk.
    #[serde(default)]
    pub disk_type: DiskClass,

    /// Required capacity in bytes; monotonically non-decreasing.
    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub accessibility: AccessibilityTopology,

    /// Reference of the associated PVC, namespace-qualified.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub persistent_volume_claim_name: String,

    /// Latched true once any mount succeeds; the disk is wiped on delete
    /// only when set.
    #[serde(default)]
    pub can_wipe: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskVolumeStatus {
    /// LocalDisk backing this volume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_disk_name: String,

    /// Device path of the backing disk in the OS.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_path: String,

    /// Dev-link set of the backing disk, grouped by family.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_links: BTreeMap<String, Vec<String>>,

    /// Symlink under the per-class pool volume directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_path: String,

    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    pub used_capacity_bytes: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<MountPoint>,

    #[serde(default)]
    pub state: VolumeState,
}

impl LocalDiskVolume {
    pub fn name(&self) -> String {
        self.name_any()
    }

    pub fn state(&self) -> VolumeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn mount_points(&self) -> &[MountPoint] {
        self.status
            .as_ref()
            .map(|s| s.mount_points.as_slice())
            .unwrap_or_default()
    }

    pub fn mount_point(&self, target_path: &str) -> Option<&MountPoint> {
        self.mount_points().iter().find(|m| m.target_path == target_path)
    }

    /// True when every mount point has reached Mounted; an empty set counts.
    pub fn all_mounted(&self) -> bool {
        self.mount_points()
            .iter()
            .all(|m| m.phase == MountPointPhase::Mounted)
    }

    pub fn owning_node(&self) -> &str {
        &self.spec.accessibility.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_state_strings_are_stable() {
        assert_eq!(serde_json::to_string(&VolumeState::Empty).ok(), Some("\"\"".into()));
        assert_eq!(
            serde_json::to_string(&VolumeState::ToBeUnmount).ok(),
            Some("\"ToBeUnmount\"".into())
        );
        assert_eq!(
            serde_json::to_string(&MountPointPhase::ToBeUnMounted).ok(),
            Some("\"ToBeUnMounted\"".into())
        );
        assert_eq!(
            serde_json::to_string(&VolumeAccessType::RawBlock).ok(),
            Some("\"RawBlock\"".into())
        );
    }

    #[test]
    fn all_mounted_holds_for_empty_set() {
        let volume = LocalDiskVolume::new("v1", LocalDiskVolumeSpec::default());
        assert!(volume.all_mounted());
    }

    #[test]
    fn all_mounted_requires_every_phase_mounted() {
        let mut volume = LocalDiskVolume::new("v1", LocalDiskVolumeSpec::default());
        volume.status = Some(LocalDiskVolumeStatus {
            mount_points: vec![
                MountPoint {
                    target_path: "/t1".into(),
                    phase: MountPointPhase::Mounted,
                    ..Default::default()
                },
                MountPoint {
                    target_path: "/t2".into(),
                    phase: MountPointPhase::ToBeMounted,
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        assert!(!volume.all_mounted());
    }
}

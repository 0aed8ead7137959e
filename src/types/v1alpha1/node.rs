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

use crate::types::v1alpha1::claim::LocalDiskClaimSpec;
use crate::types::v1alpha1::disk::{DiskClass, DiskLifecycle};
use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strum::Display;

/// Scheduler-visible availability of a node, driven by lease freshness.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema, Display,
)]
pub enum NodeState {
    #[default]
    Ready,
    Offline,
}

/// A disk as summarized inside a pool.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolDisk {
    pub dev_path: String,

    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub disk_type: DiskClass,

    #[serde(default)]
    pub state: DiskLifecycle,
}

/// Per-class grouping of claimed disks on one node, backed by a well-known
/// host directory.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalPool {
    pub name: String,

    #[serde(default)]
    pub class: DiskClass,

    #[serde(default)]
    pub total_capacity_bytes: i64,

    #[serde(default)]
    pub used_capacity_bytes: i64,

    #[serde(default)]
    pub free_capacity_bytes: i64,

    #[serde(default)]
    pub total_volume_count: i64,

    #[serde(default)]
    pub used_volume_count: i64,

    #[serde(default)]
    pub free_volume_count: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<PoolDisk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskNode",
    status = "LocalDiskNodeStatus",
    shortname = "ldn",
    plural = "localdisknodes",
    singular = "localdisknode",
    printcolumn = r#"{"name":"FreeCapacity", "type":"integer", "jsonPath":".status.freeCapacity"}"#,
    printcolumn = r#"{"name":"TotalCapacity", "type":"integer", "jsonPath":".status.totalCapacity"}"#,
    printcolumn = r#"{"name":"TotalDisk", "type":"integer", "jsonPath":".status.totalDisk"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskNodeSpec {
    /// Node this record describes.
    pub node_name: String,

    /// Worker the disks are attached to; normally equal to nodeName.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub attach_node: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskNodeStatus {
    /// Pools keyed by pool name, e.g. LocalDisk_PoolHDD.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pools: BTreeMap<String, LocalPool>,

    #[serde(default)]
    pub state: NodeState,

    /// Claim descriptions that grew each pool.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pool_extend_records: BTreeMap<String, Vec<LocalDiskClaimSpec>>,

    #[serde(default)]
    pub total_disk: i64,

    #[serde(default)]
    pub free_disk: i64,

    #[serde(default)]
    pub total_capacity: i64,

    #[serde(default)]
    pub free_capacity: i64,
}

impl LocalDiskNode {
    pub fn name(&self) -> String {
        self.name_any()
    }

    pub fn state(&self) -> NodeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn pool(&self, class: DiskClass) -> Option<&LocalPool> {
        self.status.as_ref()?.pools.get(&class.pool_name())
    }
}

/// Root of the per-class pool directories on the host.
pub const DEFAULT_POOL_ROOT: &str = "/etc/hwameistor";

/// `{root}/LocalDisk_Pool{CLASS}`
pub fn pool_path(root: &Path, class: DiskClass) -> PathBuf {
    root.join(class.pool_name())
}

/// `{root}/LocalDisk_Pool{CLASS}/disk`
pub fn pool_disk_dir(root: &Path, class: DiskClass) -> PathBuf {
    pool_path(root, class).join("disk")
}

/// `{root}/LocalDisk_Pool{CLASS}/volume`
pub fn pool_volume_dir(root: &Path, class: DiskClass) -> PathBuf {
    pool_path(root, class).join("volume")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_layout_is_compatibility_critical() {
        let root = Path::new("/etc/hwameistor");
        assert_eq!(
            pool_disk_dir(root, DiskClass::HDD),
            PathBuf::from("/etc/hwameistor/LocalDisk_PoolHDD/disk")
        );
        assert_eq!(
            pool_volume_dir(root, DiskClass::NVMe),
            PathBuf::from("/etc/hwameistor/LocalDisk_PoolNVMe/volume")
        );
    }

    #[test]
    fn node_state_defaults_to_ready() {
        let node = LocalDiskNode::new(
            "node-1",
            LocalDiskNodeSpec {
                node_name: "node-1".into(),
                attach_node: "node-1".into(),
            },
        );
        assert_eq!(node.state(), NodeState::Ready);
    }
}

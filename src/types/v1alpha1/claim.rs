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
use k8s_openapi::api::core::v1 as corev1;
use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};
use strum::Display;

/// What kind of disk a claim is asking for. Empty matcher lists match all
/// disks on the requester node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskClaimDescription {
    /// Required rotational class.
    #[serde(default)]
    pub disk_type: DiskClass,

    /// Required minimum capacity in bytes.
    #[serde(default)]
    pub capacity: i64,

    /// Pin candidates to these LocalDisk names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_disk_names: Vec<String>,

    /// Pin candidates to these device paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_paths: Vec<String>,

    /// Disks already refused for this claim; never selected again.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_disks: Vec<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskClaim",
    status = "LocalDiskClaimStatus",
    shortname = "ldc",
    plural = "localdiskclaims",
    singular = "localdiskclaim",
    printcolumn = r#"{"name":"NodeMatch", "type":"string", "jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimSpec {
    /// Node the disks have to be claimed on.
    pub node_name: String,

    #[serde(default)]
    pub description: DiskClaimDescription,

    /// Disks assigned to satisfy this claim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk_refs: Vec<corev1::ObjectReference>,

    /// Which system owns this claim, e.g. local-disk-manager.
    pub owner: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimStatus {
    #[serde(default)]
    pub status: DiskClaimState,
}

#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    schemars::JsonSchema,
    Display,
)]
pub enum DiskClaimState {
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "Empty")]
    Empty,
    Pending,
    /// Assigned a backing disk and ready for use.
    Bound,
    /// Assigned disks already, but needs more to reach the requested
    /// aggregate capacity.
    Extending,
}

impl LocalDiskClaim {
    pub fn name(&self) -> String {
        self.name_any()
    }

    pub fn state(&self) -> DiskClaimState {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    /// Sum of the capacities recorded on the bound disk refs is tracked by
    /// the resolver; the refs only carry names here.
    pub fn bound_disk_names(&self) -> Vec<String> {
        self.spec
            .disk_refs
            .iter()
            .filter_map(|r| r.name.clone())
            .collect()
    }

    pub fn lists_disk(&self, disk_name: &str) -> bool {
        self.spec
            .disk_refs
            .iter()
            .any(|r| r.name.as_deref() == Some(disk_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_state_strings_are_stable() {
        assert_eq!(serde_json::to_string(&DiskClaimState::Empty).ok(), Some("\"\"".into()));
        assert_eq!(
            serde_json::to_string(&DiskClaimState::Pending).ok(),
            Some("\"Pending\"".into())
        );
        assert_eq!(
            serde_json::to_string(&DiskClaimState::Extending).ok(),
            Some("\"Extending\"".into())
        );
    }

    #[test]
    fn bound_disk_names_skip_empty_refs() {
        let mut claim = LocalDiskClaim::new(
            "claim-1",
            LocalDiskClaimSpec {
                node_name: "node-1".into(),
                owner: "local-disk-manager".into(),
                ..Default::default()
            },
        );
        claim.spec.disk_refs = vec![
            corev1::ObjectReference {
                name: Some("localdisk-abc".into()),
                ..Default::default()
            },
            corev1::ObjectReference::default(),
        ];
        assert_eq!(claim.bound_disk_names(), vec!["localdisk-abc".to_string()]);
        assert!(claim.lists_disk("localdisk-abc"));
        assert!(!claim.lists_disk("localdisk-def"));
    }
}

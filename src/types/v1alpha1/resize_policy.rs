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

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};

/// Selector-scoped thresholds governing automatic capacity growth of PVC
/// requests. A policy with no selector at all is the cluster-wide default.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, KubeSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "ResizePolicy",
    plural = "resizepolicies",
    singular = "resizepolicy",
    printcolumn = r#"{"name":"ResizeThreshold", "type":"integer", "jsonPath":".spec.resizeThreshold"}"#,
    printcolumn = r#"{"name":"WarningThreshold", "type":"integer", "jsonPath":".spec.warningThreshold"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct ResizePolicySpec {
    /// Utilization percentage at which a PVC is enlarged.
    pub resize_threshold: u8,

    /// Target percentage the enlarged size must bring utilization under
    /// (minus one).
    pub warning_threshold: u8,

    /// Per-pool usage percentage above which no resize happens.
    pub node_pool_usage_limit: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_selector: Option<metav1::LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<metav1::LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_selector: Option<metav1::LabelSelector>,
}

impl ResizePolicy {
    pub fn name(&self) -> String {
        self.name_any()
    }

    /// Cluster-wide default: no selector of any kind.
    pub fn is_cluster_default(&self) -> bool {
        self.spec.pvc_selector.is_none()
            && self.spec.namespace_selector.is_none()
            && self.spec.storage_class_selector.is_none()
    }
}

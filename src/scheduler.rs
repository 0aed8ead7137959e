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

//! Scheduler plugin. `filter` is a pure function over its inputs and
//! performs no side effects; reservation happens later, when the volume is
//! actually created. The external scheduler calls the loader wrapper.

use crate::context::{self, Context};
use crate::types::v1alpha1::disk::{DiskClass, LocalDisk};
use crate::types::v1alpha1::node::{LocalDiskNode, NodeState};
use crate::types::v1alpha1::volume::LocalDiskVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ListParams;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(display("pvc '{}' has no storage class", pvc))]
    NoStorageClass { pvc: String },
}

/// One pending volume request, derived from a PVC and its storage class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRequest {
    pub name: String,
    pub class: DiskClass,
    pub capacity: i64,
}

/// Pure placement check.
///
/// * an Offline candidate never fits;
/// * every bound volume must live on the candidate;
/// * per class, sort pending requests and available disks by capacity
///   descending and pair them largest-vs-largest; any shortfall is a no.
pub fn filter(
    candidate: &str,
    candidate_state: NodeState,
    bound_volume_nodes: &[(String, String)],
    pending: &[VolumeRequest],
    available_disks: &[(DiskClass, i64)],
) -> bool {
    if candidate_state == NodeState::Offline {
        return false;
    }

    for (volume, node) in bound_volume_nodes {
        if node != candidate {
            debug!(volume = %volume, node = %node, candidate, "bound volume lives elsewhere");
            return false;
        }
    }

    let pending = dedup_by_name(pending);

    for class in DiskClass::all() {
        let mut requests: Vec<i64> = pending
            .iter()
            .filter(|r| r.class == class)
            .map(|r| r.capacity)
            .collect();
        let mut disks: Vec<i64> = available_disks
            .iter()
            .filter(|(c, _)| *c == class)
            .map(|(_, cap)| *cap)
            .collect();

        if requests.is_empty() {
            continue;
        }
        if requests.len() > disks.len() {
            return false;
        }

        requests.sort_unstable_by(|a, b| b.cmp(a));
        disks.sort_unstable_by(|a, b| b.cmp(a));

        if requests.iter().zip(disks.iter()).any(|(req, disk)| disk < req) {
            return false;
        }
    }

    true
}

/// Duplicate claims (one pod mounting a volume twice) count once.
fn dedup_by_name(pending: &[VolumeRequest]) -> Vec<VolumeRequest> {
    let mut seen = BTreeMap::new();
    for request in pending {
        seen.entry(request.name.clone()).or_insert_with(|| request.clone());
    }
    seen.into_values().collect()
}

/// Derive class and capacity from a PVC and its storage class parameters.
pub fn request_from_pvc(pvc: &PersistentVolumeClaim, sc: &StorageClass) -> VolumeRequest {
    let class = sc
        .parameters
        .as_ref()
        .and_then(|p| p.get("diskType"))
        .map(|s| parse_disk_class(s))
        .unwrap_or_default();

    let capacity = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .and_then(|q| crate::resizer::parse_quantity(&q.0))
        .unwrap_or(0);

    VolumeRequest {
        name: pvc.metadata.name.clone().unwrap_or_default(),
        class,
        capacity,
    }
}

pub fn parse_disk_class(value: &str) -> DiskClass {
    match value.to_ascii_uppercase().as_str() {
        "SSD" => DiskClass::SSD,
        "NVME" => DiskClass::NVMe,
        _ => DiskClass::HDD,
    }
}

/// Store-backed wrapper used by the external scheduler.
pub struct DiskVolumeScheduler {
    ctx: Arc<Context>,
}

impl DiskVolumeScheduler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Load the records `filter` needs and evaluate the candidate node.
    pub async fn filter_node(
        &self,
        bound_volumes: &[String],
        pending_pvcs: &[PersistentVolumeClaim],
        candidate: &str,
    ) -> Result<bool, Error> {
        let node_state = self
            .ctx
            .get_opt::<LocalDiskNode>(candidate)
            .await?
            .map(|n| n.state())
            .unwrap_or(NodeState::Offline);

        let mut bound_volume_nodes = Vec::new();
        for name in bound_volumes {
            let volume = self.ctx.get::<LocalDiskVolume>(name).await?;
            bound_volume_nodes.push((name.clone(), volume.owning_node().to_string()));
        }

        let mut pending = Vec::new();
        for pvc in pending_pvcs {
            let sc_name =
                pvc.spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.clone())
                    .ok_or_else(|| Error::NoStorageClass {
                        pvc: pvc.metadata.name.clone().unwrap_or_default(),
                    })?;
            let sc = self.ctx.get::<StorageClass>(&sc_name).await?;
            pending.push(request_from_pvc(pvc, &sc));
        }

        let available: Vec<(DiskClass, i64)> = self
            .ctx
            .list::<LocalDisk>(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|d| {
                d.spec.node_name == candidate
                    && d.is_active()
                    && d.lifecycle().selectable()
                    && !d.spec.reserved
                    && !d.spec.has_partition
            })
            .map(|d| (d.spec.disk_attributes.disk_type, d.spec.capacity))
            .collect();

        Ok(filter(
            candidate,
            node_state,
            &bound_volume_nodes,
            &pending,
            &available,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1 << 30;

    fn request(name: &str, class: DiskClass, capacity: i64) -> VolumeRequest {
        VolumeRequest {
            name: name.into(),
            class,
            capacity,
        }
    }

    #[test]
    fn offline_node_never_fits() {
        assert!(!filter("n1", NodeState::Offline, &[], &[], &[]));
    }

    #[test]
    fn bound_volume_pins_to_its_node() {
        let bound = vec![("v1".to_string(), "n1".to_string())];
        assert!(filter("n1", NodeState::Ready, &bound, &[], &[]));
        assert!(!filter("n2", NodeState::Ready, &bound, &[], &[]));
    }

    #[test]
    fn pairwise_largest_vs_largest_within_class() {
        let pending = vec![
            request("p1", DiskClass::HDD, 100 * GIB),
            request("p2", DiskClass::HDD, 50 * GIB),
        ];
        let disks = vec![(DiskClass::HDD, 120 * GIB), (DiskClass::HDD, 60 * GIB)];
        assert!(filter("n1", NodeState::Ready, &[], &pending, &disks));

        // the second-largest disk cannot carry the second-largest request
        let tight = vec![(DiskClass::HDD, 120 * GIB), (DiskClass::HDD, 40 * GIB)];
        assert!(!filter("n1", NodeState::Ready, &[], &pending, &tight));
    }

    #[test]
    fn more_requests_than_disks_fails() {
        let pending = vec![
            request("p1", DiskClass::HDD, GIB),
            request("p2", DiskClass::HDD, GIB),
        ];
        let disks = vec![(DiskClass::HDD, 100 * GIB)];
        assert!(!filter("n1", NodeState::Ready, &[], &pending, &disks));
    }

    #[test]
    fn classes_are_partitioned() {
        let pending = vec![request("p1", DiskClass::SSD, GIB)];
        // an enormous HDD does not satisfy an SSD request
        let disks = vec![(DiskClass::HDD, 1000 * GIB)];
        assert!(!filter("n1", NodeState::Ready, &[], &pending, &disks));
    }

    #[test]
    fn duplicate_pending_claims_count_once() {
        let pending = vec![
            request("p1", DiskClass::HDD, GIB),
            request("p1", DiskClass::HDD, GIB),
        ];
        let disks = vec![(DiskClass::HDD, 2 * GIB)];
        assert!(filter("n1", NodeState::Ready, &[], &pending, &disks));
    }

    #[test]
    fn filter_is_deterministic() {
        let pending = vec![
            request("p1", DiskClass::HDD, 30 * GIB),
            request("p2", DiskClass::SSD, 20 * GIB),
        ];
        let disks = vec![(DiskClass::HDD, 40 * GIB), (DiskClass::SSD, 25 * GIB)];
        let first = filter("n1", NodeState::Ready, &[], &pending, &disks);
        for _ in 0..10 {
            assert_eq!(filter("n1", NodeState::Ready, &[], &pending, &disks), first);
        }
    }

    #[test]
    fn storage_class_params_parse() {
        assert_eq!(parse_disk_class("SSD"), DiskClass::SSD);
        assert_eq!(parse_disk_class("nvme"), DiskClass::NVMe);
        assert_eq!(parse_disk_class("HDD"), DiskClass::HDD);
        assert_eq!(parse_disk_class("anything"), DiskClass::HDD);
    }
}

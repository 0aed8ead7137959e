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

//! Node pool manager. Groups the node's claimed disks into per-class
//! pools, keeps the host symlink trees in step, and publishes the pool
//! summary on the LocalDiskNode record. The summary is advisory for the
//! scheduler and authoritative for the auto-resizer.

use crate::context::{self, Context};
use crate::pool::DiskPool;
use crate::types::v1alpha1::claim::{DiskClaimState, LocalDiskClaim, LocalDiskClaimSpec};
use crate::types::v1alpha1::disk::{DiskClass, DiskLifecycle, LocalDisk};
use crate::types::v1alpha1::node::{LocalDiskNode, LocalDiskNodeSpec, LocalPool, PoolDisk};
use crate::types::v1alpha1::volume::{LocalDiskVolume, VolumeState};
use crate::types::v1alpha1::OWNER_LOCAL_DISK_MANAGER;
use kube::api::ListParams;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Pool { source: crate::pool::Error },
}

pub struct NodePoolManager {
    ctx: Arc<Context>,
    node: String,
    pool: DiskPool,
}

impl NodePoolManager {
    pub fn new(ctx: Arc<Context>, node: String, pool: DiskPool) -> Self {
        Self { ctx, node, pool }
    }

    /// Create the LocalDiskNode record for this worker if it is missing.
    pub async fn ensure_node_record(&self) -> Result<(), Error> {
        if self.ctx.get_opt::<LocalDiskNode>(&self.node).await?.is_some() {
            return Ok(());
        }
        let record = LocalDiskNode::new(
            &self.node,
            LocalDiskNodeSpec {
                node_name: self.node.clone(),
                attach_node: self.node.clone(),
            },
        );
        self.ctx.create(&record).await?;
        info!(node = %self.node, "LocalDiskNode record created");
        Ok(())
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "pool refresh failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            }
        }
        info!("node pool manager stopped");
    }

    /// Recompute the pool summary and push it to the node record. The
    /// node's Ready/Offline state belongs to the liveness detector and is
    /// left untouched by the merge patch.
    pub async fn refresh(&self) -> Result<(), Error> {
        let disks: Vec<LocalDisk> = self
            .ctx
            .list::<LocalDisk>(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|d| d.spec.node_name == self.node)
            .collect();

        let volumes: Vec<LocalDiskVolume> = self
            .ctx
            .list::<LocalDiskVolume>(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|v| v.owning_node() == self.node && v.state() != VolumeState::Deleted)
            .collect();

        // keep the host symlink tree in step with pool membership
        for disk in disks.iter().filter(|d| in_pool(d)) {
            if let Err(err) = self.pool.extend(
                disk.spec.disk_attributes.disk_type,
                &disk.spec.dev_links,
                &disk.spec.disk_attributes.serial_number,
            ) {
                warn!(disk = %disk.name(), error = %err, "failed to link disk into pool");
            }
        }

        let pools = summarize(&disks, &volumes);
        let extend_records = self.pool_extend_records().await?;

        let totals = pools.values().fold((0i64, 0i64, 0i64, 0i64), |acc, p| {
            (
                acc.0 + p.disks.len() as i64,
                acc.1 + p.free_volume_count,
                acc.2 + p.total_capacity_bytes,
                acc.3 + p.free_capacity_bytes,
            )
        });

        let status = serde_json::json!({
            "pools": pools,
            "poolExtendRecords": extend_records,
            "totalDisk": totals.0,
            "freeDisk": totals.1,
            "totalCapacity": totals.2,
            "freeCapacity": totals.3,
        });
        self.ctx
            .patch_status::<LocalDiskNode>(&self.node, status)
            .await?;
        Ok(())
    }

    /// Mirror the Bound claim descriptions that grew each pool.
    async fn pool_extend_records(
        &self,
    ) -> Result<BTreeMap<String, Vec<LocalDiskClaimSpec>>, Error> {
        let claims = self
            .ctx
            .list::<LocalDiskClaim>(&ListParams::default())
            .await?
            .items;

        let mut records: BTreeMap<String, Vec<LocalDiskClaimSpec>> = BTreeMap::new();
        for claim in claims {
            if claim.spec.node_name != self.node
                || claim.spec.owner != OWNER_LOCAL_DISK_MANAGER
                || claim.state() != DiskClaimState::Bound
            {
                continue;
            }
            let pool_name = claim.spec.description.disk_type.pool_name();
            records.entry(pool_name).or_default().push(claim.spec.clone());
        }
        Ok(records)
    }
}

/// A disk belongs to a pool once it is claimed for local-disk-manager use.
fn in_pool(disk: &LocalDisk) -> bool {
    disk.is_active()
        && disk.spec.owner == OWNER_LOCAL_DISK_MANAGER
        && matches!(
            disk.lifecycle(),
            DiskLifecycle::Bound | DiskLifecycle::InUse | DiskLifecycle::Released
        )
}

/// Pure pool summary over the node's disks and volumes.
pub fn summarize(
    disks: &[LocalDisk],
    volumes: &[LocalDiskVolume],
) -> BTreeMap<String, LocalPool> {
    let mut pools = BTreeMap::new();

    for class in DiskClass::all() {
        let pool_disks: Vec<&LocalDisk> = disks
            .iter()
            .filter(|d| in_pool(d) && d.spec.disk_attributes.disk_type == class)
            .collect();
        let pool_volumes: Vec<&LocalDiskVolume> = volumes
            .iter()
            .filter(|v| v.spec.disk_type == class)
            .collect();

        if pool_disks.is_empty() && pool_volumes.is_empty() {
            continue;
        }

        let consumed: Vec<&str> = pool_volumes
            .iter()
            .filter_map(|v| v.status.as_ref())
            .map(|s| s.local_disk_name.as_str())
            .filter(|n| !n.is_empty())
            .collect();

        let total_capacity: i64 = pool_disks.iter().map(|d| d.spec.capacity).sum();
        let used_capacity: i64 = pool_disks
            .iter()
            .filter(|d| consumed.contains(&d.name().as_str()))
            .map(|d| d.spec.capacity)
            .sum();

        let total_volumes = pool_disks.len() as i64;
        let used_volumes = pool_volumes.len() as i64;

        let mut summary = LocalPool {
            name: class.pool_name(),
            class,
            total_capacity_bytes: total_capacity,
            used_capacity_bytes: used_capacity,
            free_capacity_bytes: total_capacity - used_capacity,
            total_volume_count: total_volumes,
            used_volume_count: used_volumes,
            free_volume_count: (total_volumes - used_volumes).max(0),
            disks: pool_disks
                .iter()
                .map(|d| PoolDisk {
                    dev_path: d.spec.device_path.clone(),
                    capacity: d.spec.capacity,
                    disk_type: class,
                    state: if consumed.contains(&d.name().as_str()) {
                        DiskLifecycle::InUse
                    } else {
                        d.lifecycle()
                    },
                })
                .collect(),
            volumes: pool_volumes.iter().map(|v| v.name()).collect(),
        };
        summary.volumes.sort();
        pools.insert(summary.name.clone(), summary);
    }

    pools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{disk_on_node, volume_on_node};

    const GIB: i64 = 1 << 30;

    fn pooled_disk(name: &str, class: DiskClass, capacity: i64) -> LocalDisk {
        let mut disk = disk_on_node(name, "n1", class, capacity, DiskLifecycle::Bound);
        disk.spec.owner = OWNER_LOCAL_DISK_MANAGER.into();
        disk
    }

    #[test]
    fn summary_tracks_capacity_and_counts_per_class() {
        let disks = vec![
            pooled_disk("localdisk-a", DiskClass::HDD, 100 * GIB),
            pooled_disk("localdisk-b", DiskClass::HDD, 200 * GIB),
            pooled_disk("localdisk-c", DiskClass::SSD, 50 * GIB),
        ];
        let mut volume = volume_on_node("v1", "n1", DiskClass::HDD, 10 * GIB);
        volume.status.get_or_insert_default().local_disk_name = "localdisk-a".into();
        let volumes = vec![volume];

        let pools = summarize(&disks, &volumes);

        let hdd = pools.get("LocalDisk_PoolHDD").cloned().unwrap_or_default();
        assert_eq!(hdd.total_capacity_bytes, 300 * GIB);
        assert_eq!(hdd.used_capacity_bytes, 100 * GIB);
        assert_eq!(hdd.free_capacity_bytes, 200 * GIB);
        assert_eq!(hdd.total_volume_count, 2);
        assert_eq!(hdd.used_volume_count, 1);
        assert_eq!(hdd.free_volume_count, 1);
        assert_eq!(hdd.volumes, vec!["v1".to_string()]);

        let ssd = pools.get("LocalDisk_PoolSSD").cloned().unwrap_or_default();
        assert_eq!(ssd.total_capacity_bytes, 50 * GIB);
        assert_eq!(ssd.used_volume_count, 0);

        assert!(!pools.contains_key("LocalDisk_PoolNVMe"));
    }

    #[test]
    fn summary_marks_consumed_disks_in_use() {
        let disks = vec![pooled_disk("localdisk-a", DiskClass::HDD, 100 * GIB)];
        let mut volume = volume_on_node("v1", "n1", DiskClass::HDD, 10 * GIB);
        volume.status.get_or_insert_default().local_disk_name = "localdisk-a".into();

        let pools = summarize(&disks, &[volume]);
        let hdd = pools.get("LocalDisk_PoolHDD").cloned().unwrap_or_default();
        assert_eq!(hdd.disks.len(), 1);
        assert_eq!(hdd.disks[0].state, DiskLifecycle::InUse);
    }

    #[test]
    fn unclaimed_disks_stay_out_of_pools() {
        let disks = vec![disk_on_node(
            "localdisk-a",
            "n1",
            DiskClass::HDD,
            100 * GIB,
            DiskLifecycle::Available,
        )];
        assert!(summarize(&disks, &[]).is_empty());
    }
}

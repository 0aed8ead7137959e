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

//! The surface the CSI adapter calls into. Mutations are watched-record
//! writes; the per-node reconciler does the actual host work, and the
//! blocking calls here poll the record until it reaches the wanted state
//! or the caller's deadline expires.

use crate::context::{self, CAS_RETRIES, Context};
use crate::types::v1alpha1::TOPOLOGY_NODE_KEY;
use crate::types::v1alpha1::disk::DiskClass;
use crate::types::v1alpha1::volume::{
    AccessibilityTopology, LocalDiskVolume, LocalDiskVolumeSpec, MountPoint, MountPointPhase,
    VolumeAccessType, VolumeState,
};
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often the blocking calls re-read the record.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(display("volume '{}' not found", name))]
    VolumeNotFound { name: String },

    #[snafu(display(
        "volume '{}' required capacity may not shrink from {} to {}",
        name,
        current,
        requested
    ))]
    CapacityShrink {
        name: String,
        current: i64,
        requested: i64,
    },

    #[snafu(display("volume '{}' still has {} mount point(s)", name, count))]
    MountPointsRemain { name: String, count: usize },

    #[snafu(display("deadline exceeded waiting for volume '{}' to reach {}", name, wanted))]
    DeadlineExceeded { name: String, wanted: String },

    #[snafu(display("conflict persisted after {} retries on volume '{}'", retries, name))]
    TooManyConflicts { name: String, retries: usize },
}

/// Snapshot returned to the adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub capacity: i64,
    pub node: String,
    pub ready: bool,
}

pub struct VolumeOperations {
    ctx: Arc<Context>,
}

impl VolumeOperations {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// The single topology label each node reports.
    pub fn topology_key() -> &'static str {
        TOPOLOGY_NODE_KEY
    }

    /// Create the volume record on the preferred node. Idempotent: an
    /// existing record with sufficient capacity is returned as-is.
    pub async fn create_volume(
        &self,
        name: &str,
        class: DiskClass,
        min_capacity: i64,
        node: &str,
        pvc: &str,
    ) -> Result<VolumeInfo, Error> {
        if let Some(existing) = self.ctx.get_opt::<LocalDiskVolume>(name).await? {
            if existing.spec.required_capacity_bytes < min_capacity {
                return self.update_volume(name, min_capacity).await;
            }
            return Ok(snapshot(&existing));
        }

        let volume = LocalDiskVolume::new(
            name,
            LocalDiskVolumeSpec {
                disk_type: class,
                required_capacity_bytes: min_capacity,
                accessibility: AccessibilityTopology { node: node.into() },
                persistent_volume_claim_name: pvc.into(),
                can_wipe: false,
            },
        );
        let created = self.ctx.create(&volume).await?;
        let created: LocalDiskVolume = self
            .ctx
            .patch_status(name, serde_json::json!({ "state": VolumeState::Created }))
            .await
            .unwrap_or(created);

        info!(volume = name, node, "volume record created");
        Ok(snapshot(&created))
    }

    /// Raise the required capacity. Shrinking is rejected.
    pub async fn update_volume(&self, name: &str, min_capacity: i64) -> Result<VolumeInfo, Error> {
        for _ in 0..CAS_RETRIES {
            let Some(mut volume) = self.ctx.get_opt::<LocalDiskVolume>(name).await? else {
                return Err(Error::VolumeNotFound { name: name.into() });
            };

            if min_capacity < volume.spec.required_capacity_bytes {
                return Err(Error::CapacityShrink {
                    name: name.into(),
                    current: volume.spec.required_capacity_bytes,
                    requested: min_capacity,
                });
            }
            if min_capacity == volume.spec.required_capacity_bytes {
                return Ok(snapshot(&volume));
            }

            volume.spec.required_capacity_bytes = min_capacity;
            match self.ctx.update(&volume).await {
                Ok(updated) => return Ok(snapshot(&updated)),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::TooManyConflicts {
            name: name.into(),
            retries: CAS_RETRIES,
        })
    }

    /// Append a mount point and block until the volume reports Ready with
    /// that mount point Mounted.
    pub async fn node_publish(
        &self,
        name: &str,
        target_path: &str,
        access_type: VolumeAccessType,
        fs_type: &str,
        mount_options: &[String],
        deadline: Duration,
    ) -> Result<(), Error> {
        self.mutate_status(name, |volume| {
            if volume.mount_point(target_path).is_some() {
                return false;
            }
            let status = volume.status.get_or_insert_default();
            status.mount_points.push(MountPoint {
                target_path: target_path.to_string(),
                access_type,
                fs_type: fs_type.to_string(),
                mount_options: mount_options.to_vec(),
                phase: MountPointPhase::ToBeMounted,
            });
            status.state = VolumeState::NotReady;
            true
        })
        .await?;

        self.wait_for(name, deadline, "Ready", |volume| {
            volume.state() == VolumeState::Ready
                && volume
                    .mount_point(target_path)
                    .map(|m| m.phase == MountPointPhase::Mounted)
                    .unwrap_or(false)
        })
        .await
    }

    /// Flag a mount point for unmount and block until it is gone.
    pub async fn node_unpublish(
        &self,
        name: &str,
        target_path: &str,
        deadline: Duration,
    ) -> Result<(), Error> {
        let mutated = self
            .mutate_status(name, |volume| {
                let Some(status) = volume.status.as_mut() else {
                    return false;
                };
                let Some(point) = status
                    .mount_points
                    .iter_mut()
                    .find(|m| m.target_path == target_path)
                else {
                    return false;
                };
                if point.phase == MountPointPhase::ToBeUnMounted {
                    return false;
                }
                point.phase = MountPointPhase::ToBeUnMounted;
                status.state = VolumeState::ToBeUnmount;
                true
            })
            .await?;

        if !mutated {
            // never mounted or already unpublished
            return Ok(());
        }

        self.wait_for(name, deadline, "unmounted", |volume| {
            volume.mount_point(target_path).is_none()
        })
        .await
    }

    /// Request deletion. Fails fast while mount points remain; blocks
    /// until the record is gone.
    pub async fn delete_volume(&self, name: &str, deadline: Duration) -> Result<(), Error> {
        let Some(volume) = self.ctx.get_opt::<LocalDiskVolume>(name).await? else {
            return Ok(());
        };

        let count = volume.mount_points().len();
        if count > 0 {
            return Err(Error::MountPointsRemain {
                name: name.into(),
                count,
            });
        }

        self.mutate_status(name, |volume| {
            let status = volume.status.get_or_insert_default();
            if matches!(status.state, VolumeState::ToBeDeleted | VolumeState::Deleted) {
                return false;
            }
            status.state = VolumeState::ToBeDeleted;
            true
        })
        .await?;

        let start = tokio::time::Instant::now();
        loop {
            if self.ctx.get_opt::<LocalDiskVolume>(name).await?.is_none() {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(Error::DeadlineExceeded {
                    name: name.into(),
                    wanted: "Deleted".into(),
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub async fn get_volume_info(&self, name: &str) -> Result<VolumeInfo, Error> {
        let volume = self
            .ctx
            .get_opt::<LocalDiskVolume>(name)
            .await?
            .ok_or_else(|| Error::VolumeNotFound { name: name.into() })?;
        Ok(snapshot(&volume))
    }

    /// Re-read, mutate the status, write back with the observed
    /// resourceVersion; conflicts retry from a fresh read. The closure
    /// returns false to signal that no write is needed.
    async fn mutate_status<F>(&self, name: &str, mutate: F) -> Result<bool, Error>
    where
        F: Fn(&mut LocalDiskVolume) -> bool,
    {
        for _ in 0..CAS_RETRIES {
            let Some(mut volume) = self.ctx.get_opt::<LocalDiskVolume>(name).await? else {
                return Err(Error::VolumeNotFound { name: name.into() });
            };

            if !mutate(&mut volume) {
                return Ok(false);
            }

            let rv = volume.metadata.resource_version.clone().unwrap_or_default();
            let status = serde_json::to_value(volume.status.clone().unwrap_or_default())
                .map_err(context::Error::from)?;
            match self
                .ctx
                .patch_status_cas::<LocalDiskVolume>(name, &rv, status)
                .await
            {
                Ok(_) => return Ok(true),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::TooManyConflicts {
            name: name.into(),
            retries: CAS_RETRIES,
        })
    }

    async fn wait_for<F>(
        &self,
        name: &str,
        deadline: Duration,
        wanted: &str,
        done: F,
    ) -> Result<(), Error>
    where
        F: Fn(&LocalDiskVolume) -> bool,
    {
        let start = tokio::time::Instant::now();
        loop {
            let Some(volume) = self.ctx.get_opt::<LocalDiskVolume>(name).await? else {
                return Err(Error::VolumeNotFound { name: name.into() });
            };
            if done(&volume) {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(Error::DeadlineExceeded {
                    name: name.into(),
                    wanted: wanted.into(),
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

fn snapshot(volume: &LocalDiskVolume) -> VolumeInfo {
    VolumeInfo {
        name: volume.name(),
        capacity: volume.spec.required_capacity_bytes,
        node: volume.owning_node().to_string(),
        ready: volume.state() == VolumeState::Ready,
    }
}

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

//! Volume state machine. One reconciler per node, single task per volume
//! key, every transition idempotent: the record is re-read before any
//! state change and all status writes carry the observed resourceVersion.
//!
//!   Empty/Created -> NotReady -> Ready -> ToBeUnmount -> Ready
//!                                  \-> ToBeDeleted -> Deleted (terminal)

use crate::context::{self, CAS_RETRIES, Context};
use crate::csi::mounter::{self, Mounter};
use crate::device::classifier::{self, DeviceAttributes};
use crate::pool::{self, DiskPool};
use crate::types::v1alpha1::claim::{DiskClaimState, LocalDiskClaim, LocalDiskClaimSpec};
use crate::types::v1alpha1::disk::{DiskLifecycle, LocalDisk, LocalDiskStatus};
use crate::types::v1alpha1::volume::{
    LocalDiskVolume, MountPoint, MountPointPhase, VolumeAccessType, VolumeState,
};
use crate::types::v1alpha1::{LINK_BY_ID, OWNER_LOCAL_DISK_MANAGER, VOLUME_FINALIZER};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Pool { source: pool::Error },

    #[snafu(transparent)]
    Mount { source: mounter::Error },

    #[snafu(display("conflict persisted after {} retries on volume '{}'", retries, name))]
    TooManyConflicts { name: String, retries: usize },
}

pub struct VolumeReconcilerCtx {
    pub ctx: Arc<Context>,
    pub node: String,
    pub pool: DiskPool,
    pub mounter: Arc<dyn Mounter>,
    pub sysfs_root: PathBuf,
}

/// Name of the one-shot claim derived for a volume.
pub fn derived_claim_name(volume: &str) -> String {
    format!("ldv-{volume}")
}

pub async fn reconcile_volume(
    volume: Arc<LocalDiskVolume>,
    rctx: Arc<VolumeReconcilerCtx>,
) -> Result<Action, Error> {
    if volume.owning_node() != rctx.node {
        return Ok(Action::await_change());
    }

    // always act on a fresh read
    let Some(volume) = rctx.ctx.get_opt::<LocalDiskVolume>(&volume.name()).await? else {
        return Ok(Action::await_change());
    };

    ensure_finalizer(&rctx.ctx, &volume).await?;

    match volume.state() {
        VolumeState::Empty | VolumeState::Created => reconcile_created(&volume, &rctx).await,
        VolumeState::NotReady => reconcile_mount(&volume, &rctx).await,
        VolumeState::Ready => {
            if volume
                .mount_points()
                .iter()
                .any(|m| m.phase == MountPointPhase::ToBeMounted)
            {
                reconcile_mount(&volume, &rctx).await
            } else if volume
                .mount_points()
                .iter()
                .any(|m| m.phase == MountPointPhase::ToBeUnMounted)
            {
                reconcile_unmount(&volume, &rctx).await
            } else {
                Ok(Action::await_change())
            }
        }
        VolumeState::ToBeUnmount => reconcile_unmount(&volume, &rctx).await,
        VolumeState::ToBeDeleted => reconcile_to_be_deleted(&volume, &rctx).await,
        VolumeState::Deleted => reconcile_deleted(&volume, &rctx).await,
    }
}

pub fn error_policy(
    _volume: Arc<LocalDiskVolume>,
    error: &Error,
    _rctx: Arc<VolumeReconcilerCtx>,
) -> Action {
    if matches!(error, Error::Context { source } if source.is_not_found()) {
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}

/// The store must not purge the record before on-disk teardown completes.
async fn ensure_finalizer(ctx: &Context, volume: &LocalDiskVolume) -> Result<(), Error> {
    if volume.state() == VolumeState::Deleted {
        return Ok(());
    }
    if volume.finalizers().iter().any(|f| f == VOLUME_FINALIZER) {
        return Ok(());
    }

    let mut fresh = volume.clone();
    fresh
        .metadata
        .finalizers
        .get_or_insert_default()
        .push(VOLUME_FINALIZER.to_string());
    match ctx.update(&fresh).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_conflict() => Ok(()), // next pass retries
        Err(err) => Err(err.into()),
    }
}

/// Select a disk through a derived one-shot claim, then materialize the
/// volume symlink once a mount point shows up.
async fn reconcile_created(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;

    if volume
        .status
        .as_ref()
        .map(|s| s.local_disk_name.is_empty())
        .unwrap_or(true)
    {
        return bind_disk_via_claim(volume, rctx).await;
    }

    if volume.mount_points().is_empty() {
        // nothing published yet
        return Ok(Action::await_change());
    }

    // find the disk symlink through the by-id/by-path set recorded on bind
    let disk_name = volume
        .status
        .as_ref()
        .map(|s| s.local_disk_name.clone())
        .unwrap_or_default();
    let disk = ctx.get::<LocalDisk>(&disk_name).await?;

    let leaf = rctx.pool.extend(
        volume.spec.disk_type,
        &disk.spec.dev_links,
        &disk.spec.disk_attributes.serial_number,
    )?;
    let link_path = rctx
        .pool
        .create_volume(volume.spec.disk_type, &volume.name(), &leaf)?;
    info!(volume = %volume.name(), link = %link_path.display(), "volume symlink materialized");

    mutate_status(ctx, &volume.name(), |v| {
        let status = v.status.get_or_insert_default();
        status.volume_path = link_path.to_string_lossy().into_owned();
        status.state = VolumeState::NotReady;
        true
    })
    .await?;
    Ok(Action::requeue(Duration::from_millis(100)))
}

async fn bind_disk_via_claim(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let claim_name = derived_claim_name(&volume.name());

    let Some(claim) = ctx.get_opt::<LocalDiskClaim>(&claim_name).await? else {
        let claim = LocalDiskClaim::new(
            &claim_name,
            LocalDiskClaimSpec {
                node_name: rctx.node.clone(),
                owner: OWNER_LOCAL_DISK_MANAGER.to_string(),
                description: crate::types::v1alpha1::claim::DiskClaimDescription {
                    disk_type: volume.spec.disk_type,
                    capacity: volume.spec.required_capacity_bytes,
                    ..Default::default()
                },
                disk_refs: Vec::new(),
            },
        );
        ctx.create(&claim).await?;
        debug!(volume = %volume.name(), claim = %claim_name, "derived claim created");
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    if claim.state() != DiskClaimState::Bound {
        return Ok(Action::requeue(Duration::from_secs(2)));
    }

    let Some(disk_name) = claim.bound_disk_names().into_iter().next() else {
        warn!(claim = %claim_name, "claim Bound without disk refs");
        return Ok(Action::requeue(Duration::from_secs(2)));
    };
    let disk = ctx.get::<LocalDisk>(&disk_name).await?;

    mutate_status(ctx, &volume.name(), |v| {
        let status = v.status.get_or_insert_default();
        status.local_disk_name = disk_name.clone();
        status.dev_path = disk.spec.device_path.clone();
        status.dev_links = disk.dev_links_by_family();
        status.allocated_capacity_bytes = disk.spec.capacity;
        if status.state == VolumeState::Empty {
            status.state = VolumeState::Created;
        }
        true
    })
    .await?;

    ctx.record(
        volume,
        EventType::Normal,
        "DiskSelected",
        &format!("disk {disk_name} bound to volume"),
    )
    .await
    .ok();
    Ok(Action::requeue(Duration::from_millis(100)))
}

/// NotReady -> Ready: mount every pending mount point, flip phases, latch
/// canWipe on the first success.
async fn reconcile_mount(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let dev_path = volume
        .status
        .as_ref()
        .map(|s| s.dev_path.clone())
        .unwrap_or_default();
    let volume_path = volume
        .status
        .as_ref()
        .map(|s| s.volume_path.clone())
        .unwrap_or_default();

    if volume.mount_points().is_empty() {
        debug!(volume = %volume.name(), "no mount points, nothing to mount");
        return Ok(Action::await_change());
    }
    // a publish can arrive before a disk is bound or the symlink exists;
    // run the setup flow first, it requeues back here
    if dev_path.is_empty() || volume_path.is_empty() {
        return reconcile_created(volume, rctx).await;
    }

    // refuse to mount while two live devices advertise the chosen symlink
    if let Err(reason) = safe_to_mount(volume, rctx).await {
        warn!(volume = %volume.name(), reason = %reason, "unsafe to mount, requeueing");
        ctx.record(volume, EventType::Warning, "DuplicateDeviceLink", &reason)
            .await
            .ok();
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    let outcome = mount_pending(rctx.mounter.as_ref(), &dev_path, volume.mount_points()).await;

    if !outcome.mounted.is_empty() || outcome.failed.is_empty() {
        mutate_status(ctx, &volume.name(), |v| {
            let status = v.status.get_or_insert_default();
            for target in &outcome.mounted {
                if let Some(point) = status
                    .mount_points
                    .iter_mut()
                    .find(|m| m.target_path == *target)
                {
                    point.phase = MountPointPhase::Mounted;
                }
            }
            if status
                .mount_points
                .iter()
                .all(|m| m.phase == MountPointPhase::Mounted)
            {
                status.state = VolumeState::Ready;
            }
            true
        })
        .await?;
    }

    // once any mount succeeded the disk carries data and will be wiped on
    // delete
    if !outcome.mounted.is_empty() && !volume.spec.can_wipe {
        set_can_wipe(ctx, &volume.name()).await?;
    }

    if outcome.failed.is_empty() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(5)))
    }
}

async fn reconcile_unmount(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let mut removed = Vec::new();
    let mut requeue = false;

    for point in volume.mount_points() {
        if point.phase != MountPointPhase::ToBeUnMounted {
            continue;
        }
        match rctx.mounter.unmount(&point.target_path).await {
            Ok(()) => removed.push(point.target_path.clone()),
            Err(err) => {
                warn!(volume = %volume.name(), target = %point.target_path, error = %err, "unmount failed");
                requeue = true;
            }
        }
    }

    mutate_status(ctx, &volume.name(), |v| {
        let status = v.status.get_or_insert_default();
        status
            .mount_points
            .retain(|m| !removed.contains(&m.target_path));
        if !requeue {
            // a volume may serve several pods; the record goes back to
            // Ready even when the mount point set drained empty
            status.state = VolumeState::Ready;
        }
        true
    })
    .await?;

    if requeue {
        Ok(Action::requeue(Duration::from_secs(5)))
    } else {
        Ok(Action::await_change())
    }
}

async fn reconcile_to_be_deleted(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let remaining = volume.mount_points().len();
    if remaining > 0 {
        rctx.ctx
            .record(
                volume,
                EventType::Warning,
                "MountPointsRemain",
                &format!("{remaining} mount point(s) still present, refusing to delete"),
            )
            .await
            .ok();
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    mutate_status(&rctx.ctx, &volume.name(), |v| {
        v.status.get_or_insert_default().state = VolumeState::Deleted;
        true
    })
    .await?;
    Ok(Action::requeue(Duration::from_millis(100)))
}

/// Terminal teardown: symlink gone, disk wiped (when it carried data),
/// disk handed back Released, finalizer cleared, record deleted.
async fn reconcile_deleted(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let name = volume.name();

    rctx.pool.delete_volume(volume.spec.disk_type, &name)?;

    let status = volume.status.clone().unwrap_or_default();
    if volume.spec.can_wipe && !status.dev_path.is_empty() {
        rctx.mounter.wipe(&status.dev_path).await?;
        info!(volume = %name, device = %status.dev_path, "disk wiped");
    }

    if !status.local_disk_name.is_empty() {
        release_disk(ctx, &status.local_disk_name).await?;
    }

    let claim_name = derived_claim_name(&name);
    match ctx.delete::<LocalDiskClaim>(&claim_name).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    // drop the finalizer so the store can purge the record
    let mut fresh = match ctx.get_opt::<LocalDiskVolume>(&name).await? {
        Some(v) => v,
        None => return Ok(Action::await_change()),
    };
    if let Some(finalizers) = fresh.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != VOLUME_FINALIZER);
        ctx.update(&fresh).await?;
    }
    match ctx.delete::<LocalDiskVolume>(&name).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    ctx.record(volume, EventType::Normal, "VolumeDeleted", "volume deleted")
        .await
        .ok();
    Ok(Action::await_change())
}

/// Bound -> Released; the claim reference is cleared so the record keeps
/// exactly one owner through its life.
async fn release_disk(ctx: &Context, disk_name: &str) -> Result<(), Error> {
    for _ in 0..CAS_RETRIES {
        let Some(mut disk) = ctx.get_opt::<LocalDisk>(disk_name).await? else {
            return Ok(());
        };
        if disk.lifecycle() == DiskLifecycle::Released && disk.spec.claim_ref.is_none() {
            return Ok(());
        }

        disk.spec.claim_ref = None;
        let updated = match ctx.update(&disk).await {
            Ok(updated) => updated,
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        };

        let rv = updated.metadata.resource_version.clone().unwrap_or_default();
        let status = LocalDiskStatus {
            state: DiskLifecycle::Released,
        };
        match ctx
            .patch_status_cas::<LocalDisk>(
                disk_name,
                &rv,
                serde_json::to_value(&status).map_err(context::Error::from)?,
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::TooManyConflicts {
        name: disk_name.into(),
        retries: CAS_RETRIES,
    })
}

/// The duplicate-link guard behind P7: the chosen dev-symlink must resolve
/// to exactly one live device.
async fn safe_to_mount(
    volume: &LocalDiskVolume,
    rctx: &VolumeReconcilerCtx,
) -> Result<(), String> {
    let Some(status) = volume.status.as_ref() else {
        return Err("volume has no status".into());
    };
    if status.dev_links.is_empty() {
        return Err(format!("no devlinks found for volume {}", volume.name()));
    }
    // without a by-id link there is nothing to cross-check against
    if status
        .dev_links
        .get(LINK_BY_ID)
        .map(Vec::is_empty)
        .unwrap_or(true)
    {
        return Ok(());
    }

    let chosen = rctx
        .pool
        .volume_dev_link(volume.spec.disk_type, &volume.name())
        .map_err(|e| e.to_string())?;

    let devices = classifier::list_block_devices(&rctx.sysfs_root)
        .await
        .map_err(|e| e.to_string())?;

    match devices_with_link(&devices, &chosen).as_slice() {
        [] | [_] => Ok(()),
        [a, b, ..] => Err(format!(
            "device {a} and {b} has the same device link {chosen}"
        )),
    }
}

/// Names of live devices advertising the given symlink.
pub fn devices_with_link(devices: &[DeviceAttributes], link: &str) -> Vec<String> {
    devices
        .iter()
        .filter(|d| d.dev_links.iter().any(|l| l == link))
        .map(|d| d.dev_name.clone())
        .collect()
}

pub struct MountOutcome {
    pub mounted: Vec<String>,
    pub failed: Vec<String>,
}

/// Host side of the mount pass, kept free of store access.
pub async fn mount_pending(
    mounter: &dyn Mounter,
    dev_path: &str,
    mount_points: &[MountPoint],
) -> MountOutcome {
    let mut outcome = MountOutcome {
        mounted: Vec::new(),
        failed: Vec::new(),
    };

    for point in mount_points {
        if point.phase != MountPointPhase::ToBeMounted {
            continue;
        }
        let result = match point.access_type {
            VolumeAccessType::FileSystem => {
                mounter
                    .format_and_mount(
                        dev_path,
                        &point.target_path,
                        &point.fs_type,
                        &point.mount_options,
                    )
                    .await
            }
            VolumeAccessType::RawBlock => {
                mounter.mount_raw_block(dev_path, &point.target_path).await
            }
        };
        match result {
            Ok(()) => outcome.mounted.push(point.target_path.clone()),
            Err(err) => {
                warn!(target = %point.target_path, error = %err, "mount failed");
                outcome.failed.push(point.target_path.clone());
            }
        }
    }
    outcome
}

async fn set_can_wipe(ctx: &Context, name: &str) -> Result<(), Error> {
    for _ in 0..CAS_RETRIES {
        let Some(mut volume) = ctx.get_opt::<LocalDiskVolume>(name).await? else {
            return Ok(());
        };
        if volume.spec.can_wipe {
            return Ok(());
        }
        volume.spec.can_wipe = true;
        match ctx.update(&volume).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::TooManyConflicts {
        name: name.into(),
        retries: CAS_RETRIES,
    })
}

/// Re-read, mutate the status, CAS write.
async fn mutate_status<F>(ctx: &Context, name: &str, mutate: F) -> Result<bool, Error>
where
    F: Fn(&mut LocalDiskVolume) -> bool,
{
    for _ in 0..CAS_RETRIES {
        let Some(mut volume) = ctx.get_opt::<LocalDiskVolume>(name).await? else {
            return Ok(false);
        };
        if !mutate(&mut volume) {
            return Ok(false);
        }
        let rv = volume.metadata.resource_version.clone().unwrap_or_default();
        let status = serde_json::to_value(volume.status.clone().unwrap_or_default())
            .map_err(context::Error::from)?;
        match ctx
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::mounter::fake::FakeMounter;
    use crate::tests::device_attrs;
    use crate::types::v1alpha1::disk::DiskClass;

    fn point(target: &str, access: VolumeAccessType, phase: MountPointPhase) -> MountPoint {
        MountPoint {
            target_path: target.into(),
            access_type: access,
            fs_type: "xfs".into(),
            mount_options: Vec::new(),
            phase,
        }
    }

    #[tokio::test]
    async fn mount_pending_flips_only_to_be_mounted() {
        let mounter = FakeMounter::new();
        let points = vec![
            point("/t1", VolumeAccessType::FileSystem, MountPointPhase::ToBeMounted),
            point("/t2", VolumeAccessType::RawBlock, MountPointPhase::Mounted),
            point("/t3", VolumeAccessType::RawBlock, MountPointPhase::ToBeMounted),
        ];

        let outcome = mount_pending(&mounter, "/dev/sdb", &points).await;
        assert_eq!(outcome.mounted, vec!["/t1".to_string(), "/t3".to_string()]);
        assert!(outcome.failed.is_empty());

        let mounts = mounter.mounts.lock().map(|m| m.len()).unwrap_or_default();
        assert_eq!(mounts, 2);
    }

    #[tokio::test]
    async fn mount_pending_reports_failures_for_requeue() {
        let mounter = FakeMounter::new();
        if let Ok(mut fail) = mounter.fail_targets.lock() {
            fail.push("/bad".into());
        }
        let points = vec![
            point("/good", VolumeAccessType::FileSystem, MountPointPhase::ToBeMounted),
            point("/bad", VolumeAccessType::FileSystem, MountPointPhase::ToBeMounted),
        ];

        let outcome = mount_pending(&mounter, "/dev/sdb", &points).await;
        assert_eq!(outcome.mounted, vec!["/good".to_string()]);
        assert_eq!(outcome.failed, vec!["/bad".to_string()]);
    }

    #[test]
    fn duplicate_link_detection_counts_devices() {
        let link = "/dev/disk/by-path/pci-0000:03:00.0-scsi-0:0:0:0";
        let mut a = device_attrs("sdb", "S1", DiskClass::HDD, 1 << 30);
        a.dev_links = vec![link.to_string()];
        let mut b = device_attrs("sdc", "S2", DiskClass::HDD, 1 << 30);
        b.dev_links = vec![link.to_string()];
        let c = device_attrs("sdd", "S3", DiskClass::HDD, 1 << 30);

        let one = devices_with_link(std::slice::from_ref(&a), link);
        assert_eq!(one, vec!["sdb".to_string()]);

        let two = devices_with_link(&[a, b, c], link);
        assert_eq!(two, vec!["sdb".to_string(), "sdc".to_string()]);
    }

    #[test]
    fn derived_claim_name_is_stable() {
        assert_eq!(derived_claim_name("pvc-123"), "ldv-pvc-123");
    }
}

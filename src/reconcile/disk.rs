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

//! Disk inventory. Two cooperating pieces:
//!
//!  * the event ingester, sole writer for disk attributes and the
//!    Active/Inactive transition, fed by the probe channel;
//!  * the LocalDisk controller, which walks the claim-facing lifecycle
//!    ladder (Available/Reserved/InUse and the release back-edges).
//!    Bind transitions belong to the claim resolver, not here.

use crate::context::{self, CAS_RETRIES, Context};
use crate::device::classifier::{self, DeviceAttributes};
use crate::device::identity;
use crate::device::probe::{DeviceEvent, DeviceEventKind};
use crate::device::smart::SmartCollector;
use crate::types::v1alpha1::disk::{
    DiskLifecycle, DiskState, LocalDisk, LocalDiskSpec, LocalDiskStatus, PartitionInfo,
};
use crate::types::v1alpha1::OWNER_SYSTEM;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(display("conflict persisted after {} retries on disk '{}'", retries, name))]
    TooManyConflicts { name: String, retries: usize },
}

/// Consumes the normalized probe stream and reconciles each event into
/// create/update/inactivate operations on LocalDisk records.
pub struct DiskInventory {
    ctx: Arc<Context>,
    node: String,
    sysfs_root: PathBuf,
}

impl DiskInventory {
    pub fn new(ctx: Arc<Context>, node: String, sysfs_root: PathBuf) -> Self {
        Self {
            ctx,
            node,
            sysfs_root,
        }
    }

    /// Sweep stale records, then drain the event queue until cancelled.
    pub async fn run(self, mut rx: mpsc::Receiver<DeviceEvent>, cancel: CancellationToken) {
        if let Err(err) = self.stale_disk_sweep().await {
            warn!(error = %err, "stale disk sweep failed, periodic enumeration will catch up");
        }

        let mut smart = SmartCollector::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = self.on_event(&event).await {
                        warn!(device = %event.dev_name, error = %err, "failed to reconcile device event");
                    }
                    if let Err(err) = self.refresh_smart(&event, &mut smart).await {
                        warn!(device = %event.dev_name, error = %err, "failed to refresh smart info");
                    }
                }
            }
        }
        info!("disk inventory stopped");
    }

    /// Attach the overall-health bit to the record, honoring the sweep
    /// window. A failed probe writes Unknown and is never an error.
    async fn refresh_smart(
        &self,
        event: &DeviceEvent,
        smart: &mut SmartCollector,
    ) -> Result<(), Error> {
        let Some(attrs) = event.attributes.as_ref() else {
            return Ok(());
        };
        let Some(uuid) = identity::disk_uuid(attrs, &self.node) else {
            return Ok(());
        };
        let Some(info) = smart.probe(&attrs.dev_path).await else {
            return Ok(());
        };

        let name = identity::object_name(&uuid);
        let Some(mut disk) = self.ctx.get_opt::<LocalDisk>(&name).await? else {
            return Ok(());
        };
        disk.spec.support_smart =
            info.overall_health != crate::types::v1alpha1::disk::SmartAssessResult::Unknown;
        disk.spec.smart_info = Some(info);
        match self.ctx.update(&disk).await {
            Ok(_) => Ok(()),
            // the next sweep retries; losing one smart refresh is fine
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// On node-local restart: every Active record for this node that the
    /// current exist-set does not match (by serial, then by dev-link
    /// intersection) was unplugged while we were away.
    pub async fn stale_disk_sweep(&self) -> Result<(), Error> {
        let existing = classifier::list_block_devices(&self.sysfs_root)
            .await
            .unwrap_or_default();

        let records = self.list_node_disks().await?;
        for disk in records {
            if !disk.is_active() {
                continue;
            }
            if is_matched_by(&disk, &existing) {
                continue;
            }
            info!(disk = %disk.name(), "marking stale disk Inactive");
            self.write_inactive(&disk.name()).await?;
        }
        Ok(())
    }

    pub async fn on_event(&self, event: &DeviceEvent) -> Result<(), Error> {
        match event.kind {
            DeviceEventKind::Remove => self.handle_remove(event).await,
            DeviceEventKind::Add | DeviceEventKind::Change | DeviceEventKind::Exist => {
                let Some(attrs) = event.attributes.as_ref() else {
                    warn!(device = %event.dev_name, "dropping attribute-less event");
                    return Ok(());
                };
                self.apply_attributes(attrs).await
            }
        }
    }

    async fn apply_attributes(&self, attrs: &DeviceAttributes) -> Result<(), Error> {
        let Some(uuid) = identity::disk_uuid(attrs, &self.node) else {
            warn!(device = %attrs.dev_name, "device has no usable identity, skipping");
            return Ok(());
        };
        let name = identity::object_name(&uuid);

        match self.ctx.get_opt::<LocalDisk>(&name).await? {
            None => {
                let disk = new_local_disk(&name, &uuid, &self.node, attrs);
                self.ctx.create(&disk).await?;
                // fresh records start Available; the lifecycle ladder
                // promotes partitioned disks from there
                self.ctx
                    .patch_status::<LocalDisk>(
                        &name,
                        serde_json::json!({ "state": DiskLifecycle::Available }),
                    )
                    .await?;
                info!(disk = %name, device = %attrs.dev_name, "created disk record");
                Ok(())
            }
            Some(disk) => self.update_attributes(disk, attrs).await,
        }
    }

    async fn update_attributes(
        &self,
        mut disk: LocalDisk,
        attrs: &DeviceAttributes,
    ) -> Result<(), Error> {
        // capacity and class are immutable per identity; a change means two
        // devices collided on one id, and that record must not be touched
        if disk.spec.capacity != 0
            && disk.spec.disk_attributes.disk_type != attrs.class
        {
            warn!(disk = %disk.name(), "device class changed under a stable identity");
            self.ctx
                .record(
                    &disk,
                    EventType::Warning,
                    "DiskIdentityConflict",
                    &format!(
                        "device {} reports class {} but record has {}",
                        attrs.dev_name, attrs.class, disk.spec.disk_attributes.disk_type
                    ),
                )
                .await
                .ok();
            return Ok(());
        }

        // a Bound disk resurfacing on a different node needs an operator
        if disk.spec.state == DiskState::Inactive
            && !disk.spec.pre_node_name.is_empty()
            && disk.spec.pre_node_name != self.node
            && !disk.lifecycle().selectable()
        {
            self.ctx
                .record(
                    &disk,
                    EventType::Warning,
                    "DiskRecoveredOnOtherNode",
                    &format!(
                        "disk was bound on node {} and reappeared on {}; lifecycle left untouched",
                        disk.spec.pre_node_name, self.node
                    ),
                )
                .await
                .ok();
            return Ok(());
        }

        for attempt in 0..CAS_RETRIES {
            let changed = update_mutable_attributes(&mut disk, &self.node, attrs);
            if !changed {
                return Ok(());
            }
            match self.ctx.update(&disk).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    debug!(disk = %disk.name(), attempt, "conflict updating attributes, retrying");
                    disk = self.ctx.get::<LocalDisk>(&disk.name()).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::TooManyConflicts {
            name: disk.name(),
            retries: CAS_RETRIES,
        })
    }

    async fn handle_remove(&self, event: &DeviceEvent) -> Result<(), Error> {
        let matches: Vec<LocalDisk> = self
            .list_node_disks()
            .await?
            .into_iter()
            .filter(|d| d.is_active() && d.spec.device_path == event.dev_path)
            .collect();

        match matches.len() {
            0 => {
                debug!(device = %event.dev_name, "remove event for unknown device");
                Ok(())
            }
            1 => self.write_inactive(&matches[0].name()).await,
            n => {
                // ambiguous; the probe must re-establish the mapping
                warn!(device = %event.dev_name, matches = n, "ambiguous remove event, skipping");
                Ok(())
            }
        }
    }

    async fn write_inactive(&self, name: &str) -> Result<(), Error> {
        for _ in 0..CAS_RETRIES {
            let Some(mut disk) = self.ctx.get_opt::<LocalDisk>(name).await? else {
                return Ok(());
            };
            if disk.spec.state == DiskState::Inactive {
                return Ok(());
            }
            inactivate(&mut disk);
            match self.ctx.update(&disk).await {
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

    async fn list_node_disks(&self) -> Result<Vec<LocalDisk>, Error> {
        let all = self.ctx.list::<LocalDisk>(&ListParams::default()).await?;
        Ok(all
            .items
            .into_iter()
            .filter(|d| d.spec.node_name == self.node)
            .collect())
    }
}

/// Build a fresh record from an attribute bundle.
pub fn new_local_disk(
    name: &str,
    uuid: &str,
    node: &str,
    attrs: &DeviceAttributes,
) -> LocalDisk {
    let mut disk = LocalDisk::new(name, LocalDiskSpec::default());
    disk.spec.uuid = uuid.to_string();
    disk.spec.node_name = node.to_string();
    update_mutable_attributes(&mut disk, node, attrs);
    // immutable after first observation
    disk.spec.capacity = attrs.capacity;
    disk.spec.disk_attributes.disk_type = attrs.class;
    disk
}

/// Refresh the fields the probe owns without touching lifecycle state,
/// owner, or claim reference. Returns true when anything changed.
pub fn update_mutable_attributes(
    disk: &mut LocalDisk,
    node: &str,
    attrs: &DeviceAttributes,
) -> bool {
    let partitions: Vec<PartitionInfo> = attrs.partitions.clone();

    let before = serde_json::to_string(&disk.spec).unwrap_or_default();

    disk.spec.node_name = node.to_string();
    disk.spec.state = DiskState::Active;
    disk.spec.device_path = attrs.dev_path.clone();
    disk.spec.dev_links = attrs.dev_links.clone();
    disk.spec.major = attrs.major.clone();
    disk.spec.minor = attrs.minor.clone();
    disk.spec.capacity = attrs.capacity;
    disk.spec.has_partition = !partitions.is_empty();
    disk.spec.partition_info = partitions;
    disk.spec.disk_attributes.dev_type = attrs.dev_type.clone();
    disk.spec.disk_attributes.vendor = attrs.vendor.clone();
    disk.spec.disk_attributes.model_name = attrs.model.clone();
    disk.spec.disk_attributes.serial_number = attrs.serial.clone();
    disk.spec.disk_attributes.wwn = attrs.wwn.clone();
    disk.spec.disk_attributes.bus = attrs.bus.clone();
    disk.spec.disk_attributes.part_table_type = attrs.part_table_type.clone();
    disk.spec.disk_attributes.fs_type = attrs.fs_type.clone();

    let after = serde_json::to_string(&disk.spec).unwrap_or_default();
    before != after
}

/// Active -> Inactive: snapshot where the disk was, clear where it is.
pub fn inactivate(disk: &mut LocalDisk) {
    disk.spec.pre_node_name = disk.spec.node_name.clone();
    disk.spec.pre_device_path = disk.spec.device_path.clone();
    disk.spec.state = DiskState::Inactive;
    disk.spec.node_name = String::new();
    disk.spec.device_path = String::new();
    disk.spec.major = String::new();
    disk.spec.minor = String::new();
}

/// Stale-sweep matcher: serial first, dev-link intersection second.
pub fn is_matched_by(disk: &LocalDisk, existing: &[DeviceAttributes]) -> bool {
    let serial = &disk.spec.disk_attributes.serial_number;
    if !serial.is_empty() && existing.iter().any(|d| &d.serial == serial) {
        return true;
    }
    existing.iter().any(|d| {
        d.dev_links
            .iter()
            .any(|link| disk.spec.dev_links.contains(link))
    })
}

// ---------------------------------------------------------------------------
// Lifecycle ladder controller
// ---------------------------------------------------------------------------

/// Decide the next lifecycle step for a disk. Bind/Release transitions
/// belong to the claim resolver and the volume reconciler; this ladder
/// only reflects observations (partitions, reservation, cleared claims).
pub fn next_lifecycle(disk: &LocalDisk) -> Option<DiskLifecycle> {
    let has_content = disk.spec.has_partition || !disk.spec.disk_attributes.fs_type.is_empty();
    let claimed = disk.spec.claim_ref.is_some();

    match disk.lifecycle() {
        DiskLifecycle::Available => {
            if claimed {
                Some(DiskLifecycle::Bound)
            } else if has_content {
                // used by something outside the claim protocol, e.g. rootfs
                Some(DiskLifecycle::InUse)
            } else if disk.spec.reserved {
                Some(DiskLifecycle::Reserved)
            } else {
                None
            }
        }
        DiskLifecycle::Reserved => {
            if claimed {
                Some(DiskLifecycle::Bound)
            } else if !disk.spec.reserved {
                Some(DiskLifecycle::Available)
            } else {
                None
            }
        }
        DiskLifecycle::Bound => {
            if !claimed && !has_content {
                Some(DiskLifecycle::Available)
            } else {
                None
            }
        }
        DiskLifecycle::InUse => {
            if !claimed && !has_content {
                Some(DiskLifecycle::Available)
            } else {
                None
            }
        }
        // Released disks stay Released until re-selected
        DiskLifecycle::Released => None,
    }
}

pub struct DiskLadderCtx {
    pub ctx: Arc<Context>,
    pub node: String,
}

/// Controller reconcile fn for the lifecycle ladder.
pub async fn reconcile_disk(disk: Arc<LocalDisk>, rctx: Arc<DiskLadderCtx>) -> Result<Action, Error> {
    if disk.spec.node_name != rctx.node {
        return Ok(Action::await_change());
    }

    let Some(next) = next_lifecycle(&disk) else {
        return Ok(Action::await_change());
    };

    let name = disk.name();
    let rv = disk.metadata.resource_version.clone().unwrap_or_default();
    let status = LocalDiskStatus { state: next };

    match rctx
        .ctx
        .patch_status_cas::<LocalDisk>(
            &name,
            &rv,
            serde_json::to_value(&status).map_err(context::Error::from)?,
        )
        .await
    {
        Ok(_) => {}
        Err(err) if err.is_conflict() => return Ok(Action::requeue(Duration::from_secs(1))),
        Err(err) => return Err(err.into()),
    }

    let reason = match next {
        DiskLifecycle::InUse => "DiskInUse",
        DiskLifecycle::Bound => "DiskBound",
        DiskLifecycle::Reserved => "DiskReserved",
        _ => "DiskAvailable",
    };
    let note = if next == DiskLifecycle::InUse && disk.spec.owner.is_empty() {
        format!("disk {name} has partitions or a filesystem, owned by {OWNER_SYSTEM}")
    } else {
        format!("disk {name} moved to {next}")
    };
    rctx.ctx
        .record(disk.as_ref(), EventType::Normal, reason, &note)
        .await
        .ok();

    Ok(Action::await_change())
}

pub fn error_policy(_disk: Arc<LocalDisk>, error: &Error, _rctx: Arc<DiskLadderCtx>) -> Action {
    if matches!(error, Error::Context { source } if source.is_not_found()) {
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::device_attrs;
    use crate::types::v1alpha1::disk::DiskClass;

    #[test]
    fn same_add_event_twice_yields_same_record() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        let first = serde_json::to_string(&disk.spec).unwrap_or_default();

        // replaying the identical event must not change anything
        assert!(!update_mutable_attributes(&mut disk, "node-1", &attrs));
        let second = serde_json::to_string(&disk.spec).unwrap_or_default();
        assert_eq!(first, second);
    }

    #[test]
    fn update_never_touches_ownership() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        disk.spec.owner = "local-disk-manager".into();
        disk.spec.claim_ref = Some(Default::default());
        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Bound,
        });

        let mut renamed = device_attrs("sdc", "SER-1", DiskClass::HDD, 100 << 30);
        renamed.dev_path = "/dev/sdc".into();
        assert!(update_mutable_attributes(&mut disk, "node-1", &renamed));

        assert_eq!(disk.spec.device_path, "/dev/sdc");
        assert_eq!(disk.spec.owner, "local-disk-manager");
        assert!(disk.spec.claim_ref.is_some());
        assert_eq!(disk.lifecycle(), DiskLifecycle::Bound);
    }

    #[test]
    fn inactivate_snapshots_previous_location() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        inactivate(&mut disk);

        assert_eq!(disk.spec.state, DiskState::Inactive);
        assert_eq!(disk.spec.pre_node_name, "node-1");
        assert_eq!(disk.spec.pre_device_path, "/dev/sdb");
        assert!(disk.spec.node_name.is_empty());
        assert!(disk.spec.device_path.is_empty());
        assert!(disk.spec.major.is_empty());
    }

    #[test]
    fn sweep_matches_by_serial_then_dev_links() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);

        // serial match wins even with a different name
        let renamed = device_attrs("sdz", "SER-1", DiskClass::HDD, 100 << 30);
        assert!(is_matched_by(&disk, &[renamed]));

        // no serial: dev-link intersection
        let mut linked = device_attrs("sdz", "", DiskClass::HDD, 100 << 30);
        linked.dev_links = disk.spec.dev_links.clone();
        assert!(is_matched_by(&disk, std::slice::from_ref(&linked)));

        let stranger = device_attrs("sdq", "OTHER", DiskClass::HDD, 100 << 30);
        assert!(!is_matched_by(&disk, &[stranger]));
        assert!(!is_matched_by(&disk, &[]));
    }

    #[test]
    fn ladder_promotes_partitioned_disk_to_in_use() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Available,
        });
        disk.spec.has_partition = true;
        assert_eq!(next_lifecycle(&disk), Some(DiskLifecycle::InUse));

        disk.spec.has_partition = false;
        disk.spec.disk_attributes.fs_type = "xfs".into();
        assert_eq!(next_lifecycle(&disk), Some(DiskLifecycle::InUse));
    }

    #[test]
    fn ladder_reserved_follows_reservation_flag() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Available,
        });
        disk.spec.reserved = true;
        assert_eq!(next_lifecycle(&disk), Some(DiskLifecycle::Reserved));

        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Reserved,
        });
        disk.spec.reserved = false;
        assert_eq!(next_lifecycle(&disk), Some(DiskLifecycle::Available));
    }

    #[test]
    fn ladder_releases_bound_disk_when_claim_clears() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Bound,
        });
        assert_eq!(next_lifecycle(&disk), Some(DiskLifecycle::Available));

        disk.spec.claim_ref = Some(Default::default());
        assert_eq!(next_lifecycle(&disk), None);
    }

    #[test]
    fn ladder_leaves_released_disks_alone() {
        let attrs = device_attrs("sdb", "SER-1", DiskClass::HDD, 100 << 30);
        let mut disk = new_local_disk("localdisk-x", "x", "node-1", &attrs);
        disk.status = Some(LocalDiskStatus {
            state: DiskLifecycle::Released,
        });
        assert_eq!(next_lifecycle(&disk), None);
    }
}

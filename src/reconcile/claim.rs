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

//! Disk claim resolver. Single writer per node: matches Pending claims
//! against the node's disks, best-fit, and binds them one CAS at a time.

use crate::context::{self, CAS_RETRIES, Context};
use crate::types::v1alpha1::claim::{DiskClaimState, LocalDiskClaim, LocalDiskClaimStatus};
use crate::types::v1alpha1::disk::{DiskLifecycle, LocalDisk, LocalDiskStatus};
use crate::types::v1alpha1::{API_GROUP, RESERVED_PVC_LABEL};
use k8s_openapi::api::core::v1 as corev1;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requeue delay while no disk satisfies a Pending claim.
const NO_DISK_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(display("claim '{}' lost every bind race this pass", name))]
    AllBindsConflicted { name: String },
}

pub struct ClaimResolverCtx {
    pub ctx: Arc<Context>,
    pub node: String,
}

/// True when the disk can satisfy the claim right now.
pub fn matches_claim(disk: &LocalDisk, claim: &LocalDiskClaim) -> bool {
    let desc = &claim.spec.description;

    if disk.spec.node_name != claim.spec.node_name {
        return false;
    }
    if !disk.is_active() {
        return false;
    }
    if !disk.lifecycle().selectable() {
        return false;
    }
    if disk.spec.reserved {
        return false;
    }
    if disk.spec.has_partition {
        return false;
    }
    if disk.spec.disk_attributes.dev_type != "disk" && !disk.spec.disk_attributes.dev_type.is_empty()
    {
        return false;
    }
    if !disk.spec.owner.is_empty() && disk.spec.owner != claim.spec.owner {
        return false;
    }
    if disk.spec.disk_attributes.disk_type != desc.disk_type {
        return false;
    }
    if desc.exclude_disks.iter().any(|n| *n == disk.name()) {
        return false;
    }
    if !desc.local_disk_names.is_empty() && !desc.local_disk_names.contains(&disk.name()) {
        return false;
    }
    if !desc.device_paths.is_empty() && !desc.device_paths.contains(&disk.spec.device_path) {
        return false;
    }
    true
}

/// Best fit: the smallest disk still satisfying the minimum, ties broken
/// by name lexicographically so repeated passes are deterministic.
pub fn best_fit<'a>(candidates: &[&'a LocalDisk], min_capacity: i64) -> Option<&'a LocalDisk> {
    candidates
        .iter()
        .filter(|d| d.spec.capacity >= min_capacity)
        .min_by(|a, b| {
            a.spec
                .capacity
                .cmp(&b.spec.capacity)
                .then_with(|| a.name().cmp(&b.name()))
        })
        .copied()
}

/// Aggregate capacity of the disks already bound to the claim.
pub fn bound_capacity(claim: &LocalDiskClaim, disks: &[LocalDisk]) -> i64 {
    claim
        .bound_disk_names()
        .iter()
        .filter_map(|name| disks.iter().find(|d| d.name() == *name))
        .map(|d| d.spec.capacity)
        .sum()
}

pub async fn reconcile_claim(
    claim: Arc<LocalDiskClaim>,
    rctx: Arc<ClaimResolverCtx>,
) -> Result<Action, Error> {
    if claim.spec.node_name != rctx.node {
        return Ok(Action::await_change());
    }

    match claim.state() {
        DiskClaimState::Empty => {
            patch_claim_status(&rctx.ctx, &claim, DiskClaimState::Pending).await?;
            Ok(Action::requeue(Duration::from_millis(100)))
        }
        DiskClaimState::Pending | DiskClaimState::Extending => resolve(&claim, &rctx).await,
        DiskClaimState::Bound => Ok(Action::await_change()),
    }
}

async fn resolve(claim: &LocalDiskClaim, rctx: &ClaimResolverCtx) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let all_disks: Vec<LocalDisk> = ctx
        .list::<LocalDisk>(&ListParams::default())
        .await?
        .items;

    let required = claim.spec.description.capacity;
    let mut already_bound = bound_capacity(claim, &all_disks);
    let mut bound_names = claim.bound_disk_names();
    let mut refs = claim.spec.disk_refs.clone();
    let mut progressed = false;
    let mut conflicted = false;

    // multi-disk claims keep selecting until the aggregate is satisfied
    while already_bound < required || bound_names.is_empty() {
        let candidates: Vec<&LocalDisk> = all_disks
            .iter()
            .filter(|d| matches_claim(d, claim))
            .filter(|d| !bound_names.contains(&d.name()))
            .collect();

        let remaining = (required - already_bound).max(0);
        let Some(selected) = best_fit(&candidates, remaining) else {
            break;
        };

        match bind_disk(ctx, selected, claim).await {
            Ok(()) => {
                info!(claim = %claim.name(), disk = %selected.name(), "bound disk to claim");
                bound_names.push(selected.name());
                refs.push(corev1::ObjectReference {
                    name: Some(selected.name()),
                    kind: Some("LocalDisk".into()),
                    api_version: Some(format!("{API_GROUP}/v1alpha1")),
                    ..Default::default()
                });
                already_bound += selected.spec.capacity;
                progressed = true;
            }
            Err(err) if err.is_conflict() => {
                // someone else won the disk; rebuild the view next pass
                debug!(claim = %claim.name(), disk = %selected.name(), "bind conflict");
                conflicted = true;
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }

    if progressed {
        let mut updated = ctx.get::<LocalDiskClaim>(&claim.name()).await?;
        updated.spec.disk_refs = refs;
        ctx.update(&updated).await?;
    }

    if !bound_names.is_empty() && already_bound >= required {
        patch_claim_status(ctx, claim, DiskClaimState::Bound).await?;
        return Ok(Action::await_change());
    }

    if !bound_names.is_empty() {
        patch_claim_status(ctx, claim, DiskClaimState::Extending).await?;
        return Ok(Action::requeue(NO_DISK_REQUEUE));
    }

    if conflicted {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // no available disk: keep Pending and surface an event
    warn!(claim = %claim.name(), "no available disk for claim");
    ctx.record(
        claim,
        EventType::Warning,
        "NoAvailableDisk",
        &format!(
            "no disk on node {} satisfies class {} capacity {}",
            claim.spec.node_name, claim.spec.description.disk_type, required
        ),
    )
    .await
    .ok();
    if claim.state() != DiskClaimState::Pending {
        patch_claim_status(ctx, claim, DiskClaimState::Pending).await?;
    }
    Ok(Action::requeue(NO_DISK_REQUEUE))
}

/// CAS the disk to Bound with a claim reference. A conflict means another
/// writer touched the record; the caller restarts from a fresh list.
async fn bind_disk(
    ctx: &Context,
    disk: &LocalDisk,
    claim: &LocalDiskClaim,
) -> Result<(), context::Error> {
    let mut fresh = ctx.get::<LocalDisk>(&disk.name()).await?;

    // idempotent: this claim already owns the disk
    if let Some(existing) = fresh.spec.claim_ref.as_ref() {
        if existing.uid == claim.metadata.uid && existing.name.as_deref() == Some(&claim.name()) {
            return Ok(());
        }
    }

    // the snapshot may be stale; re-verify on the fresh read
    if !fresh.lifecycle().selectable() || fresh.spec.reserved {
        return Err(context::Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: format!("disk {} no longer selectable", fresh.name()),
                reason: "Conflict".into(),
                code: 409,
            }),
        });
    }

    fresh.spec.claim_ref = Some(corev1::ObjectReference {
        name: Some(claim.name()),
        kind: Some("LocalDiskClaim".into()),
        api_version: Some(format!("{API_GROUP}/v1alpha1")),
        uid: claim.metadata.uid.clone(),
        ..Default::default()
    });
    fresh.spec.owner = claim.spec.owner.clone();
    let updated = ctx.update(&fresh).await?;

    let rv = updated.metadata.resource_version.clone().unwrap_or_default();
    let status = LocalDiskStatus {
        state: DiskLifecycle::Bound,
    };
    ctx.patch_status_cas::<LocalDisk>(
        &updated.name(),
        &rv,
        serde_json::to_value(&status).map_err(context::Error::from)?,
    )
    .await?;

    ctx.record(
        &updated,
        EventType::Normal,
        "DiskBound",
        &format!("bound by LocalDiskClaim {}", claim.name()),
    )
    .await
    .ok();
    Ok(())
}

async fn patch_claim_status(
    ctx: &Context,
    claim: &LocalDiskClaim,
    state: DiskClaimState,
) -> Result<(), Error> {
    let status = LocalDiskClaimStatus { status: state };
    ctx.patch_status::<LocalDiskClaim>(
        &claim.name(),
        serde_json::to_value(&status).map_err(context::Error::from)?,
    )
    .await?;
    Ok(())
}

pub fn error_policy(
    _claim: Arc<LocalDiskClaim>,
    error: &Error,
    _rctx: Arc<ClaimResolverCtx>,
) -> Action {
    if matches!(error, Error::Context { source } if source.is_not_found()) {
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}

// ---------------------------------------------------------------------------
// Reservation by PVC (used by the external scheduler's Reserve path)
// ---------------------------------------------------------------------------

/// Reserve one disk on the node for a PVC, labeling it so the reservation
/// survives restarts. Wants exactly one disk per PVC.
pub async fn reserve_disk_for_pvc(
    ctx: &Context,
    node: &str,
    class: crate::types::v1alpha1::disk::DiskClass,
    capacity: i64,
    pvc: &str,
) -> Result<(), Error> {
    if find_reserved_disk(ctx, pvc).await?.is_some() {
        return Ok(());
    }

    for _ in 0..CAS_RETRIES {
        let disks: Vec<LocalDisk> = ctx.list::<LocalDisk>(&ListParams::default()).await?.items;
        let candidates: Vec<&LocalDisk> = disks
            .iter()
            .filter(|d| {
                d.spec.node_name == node
                    && d.is_active()
                    && d.lifecycle().selectable()
                    && !d.spec.reserved
                    && !d.spec.has_partition
                    && d.spec.disk_attributes.disk_type == class
            })
            .collect();

        let Some(selected) = best_fit(&candidates, capacity) else {
            return Ok(());
        };

        let mut fresh = ctx.get::<LocalDisk>(&selected.name()).await?;
        fresh.spec.reserved = true;
        fresh
            .metadata
            .labels
            .get_or_insert_default()
            .insert(RESERVED_PVC_LABEL.to_string(), pvc.to_string());
        match ctx.update(&fresh).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Clear the reservation labels the Reserve path set for a PVC.
pub async fn unreserve_disk_for_pvc(ctx: &Context, pvc: &str) -> Result<(), Error> {
    let Some(disk) = find_reserved_disk(ctx, pvc).await? else {
        return Ok(());
    };

    for _ in 0..CAS_RETRIES {
        let mut fresh = ctx.get::<LocalDisk>(&disk.name()).await?;
        fresh.spec.reserved = false;
        if let Some(labels) = fresh.metadata.labels.as_mut() {
            labels.remove(RESERVED_PVC_LABEL);
        }
        match ctx.update(&fresh).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn find_reserved_disk(ctx: &Context, pvc: &str) -> Result<Option<LocalDisk>, Error> {
    let params = ListParams::default().labels(&format!("{RESERVED_PVC_LABEL}={pvc}"));
    let list = ctx.list::<LocalDisk>(&params).await?;
    Ok(list.items.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{claim_for, disk_on_node};
    use crate::types::v1alpha1::disk::DiskClass;

    #[test]
    fn best_fit_picks_smallest_sufficient_disk() {
        let d100 = disk_on_node("localdisk-a", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);
        let d50 = disk_on_node("localdisk-b", "n1", DiskClass::HDD, 50, DiskLifecycle::Available);
        let d200 = disk_on_node("localdisk-c", "n1", DiskClass::HDD, 200, DiskLifecycle::Available);
        let candidates = vec![&d100, &d50, &d200];

        assert_eq!(best_fit(&candidates, 40).map(|d| d.name()), Some("localdisk-b".into()));
        assert_eq!(best_fit(&candidates, 60).map(|d| d.name()), Some("localdisk-a".into()));
        assert_eq!(best_fit(&candidates, 150).map(|d| d.name()), Some("localdisk-c".into()));
        assert_eq!(best_fit(&candidates, 300), None);
    }

    #[test]
    fn best_fit_breaks_capacity_ties_by_name() {
        let a = disk_on_node("localdisk-bbb", "n1", DiskClass::HDD, 50, DiskLifecycle::Available);
        let b = disk_on_node("localdisk-aaa", "n1", DiskClass::HDD, 50, DiskLifecycle::Available);
        assert_eq!(
            best_fit(&[&a, &b], 10).map(|d| d.name()),
            Some("localdisk-aaa".into())
        );
    }

    #[test]
    fn matcher_rejects_wrong_node_class_and_lifecycle() {
        let claim = claim_for("n1", DiskClass::HDD, 50);

        let good = disk_on_node("localdisk-a", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);
        assert!(matches_claim(&good, &claim));

        let released = disk_on_node("localdisk-r", "n1", DiskClass::HDD, 100, DiskLifecycle::Released);
        assert!(matches_claim(&released, &claim));

        let wrong_node = disk_on_node("localdisk-b", "n2", DiskClass::HDD, 100, DiskLifecycle::Available);
        assert!(!matches_claim(&wrong_node, &claim));

        let wrong_class = disk_on_node("localdisk-c", "n1", DiskClass::SSD, 100, DiskLifecycle::Available);
        assert!(!matches_claim(&wrong_class, &claim));

        let bound = disk_on_node("localdisk-d", "n1", DiskClass::HDD, 100, DiskLifecycle::Bound);
        assert!(!matches_claim(&bound, &claim));

        let in_use = disk_on_node("localdisk-e", "n1", DiskClass::HDD, 100, DiskLifecycle::InUse);
        assert!(!matches_claim(&in_use, &claim));
    }

    #[test]
    fn matcher_rejects_reserved_partitioned_and_excluded() {
        let mut claim = claim_for("n1", DiskClass::HDD, 50);

        let mut reserved =
            disk_on_node("localdisk-a", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);
        reserved.spec.reserved = true;
        assert!(!matches_claim(&reserved, &claim));

        let mut partitioned =
            disk_on_node("localdisk-b", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);
        partitioned.spec.has_partition = true;
        assert!(!matches_claim(&partitioned, &claim));

        let excluded = disk_on_node("localdisk-c", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);
        claim.spec.description.exclude_disks = vec!["localdisk-c".into()];
        assert!(!matches_claim(&excluded, &claim));
    }

    #[test]
    fn matcher_honours_name_and_path_pins() {
        let mut claim = claim_for("n1", DiskClass::HDD, 50);
        let disk = disk_on_node("localdisk-a", "n1", DiskClass::HDD, 100, DiskLifecycle::Available);

        claim.spec.description.local_disk_names = vec!["localdisk-other".into()];
        assert!(!matches_claim(&disk, &claim));
        claim.spec.description.local_disk_names = vec!["localdisk-a".into()];
        assert!(matches_claim(&disk, &claim));

        claim.spec.description.device_paths = vec!["/dev/sdz".into()];
        assert!(!matches_claim(&disk, &claim));
        claim.spec.description.device_paths = vec![disk.spec.device_path.clone()];
        assert!(matches_claim(&disk, &claim));
    }

    #[test]
    fn bound_capacity_sums_only_listed_disks() {
        let mut claim = claim_for("n1", DiskClass::HDD, 150);
        let a = disk_on_node("localdisk-a", "n1", DiskClass::HDD, 100, DiskLifecycle::Bound);
        let b = disk_on_node("localdisk-b", "n1", DiskClass::HDD, 50, DiskLifecycle::Available);
        claim.spec.disk_refs = vec![corev1::ObjectReference {
            name: Some("localdisk-a".into()),
            ..Default::default()
        }];
        assert_eq!(bound_capacity(&claim, &[a, b]), 100);
    }
}

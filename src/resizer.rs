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

//! PVC auto-resize. Two co-operating loops: the policy binder annotates
//! each PVC with the ResizePolicy chosen by selector priority, and the
//! resizer watches volume utilization and raises the PVC request against
//! that policy. Requests only ever grow.

use crate::context::{self, CAS_RETRIES, Context};
use crate::types::v1alpha1::node::LocalDiskNode;
use crate::types::v1alpha1::resize_policy::ResizePolicy;
use crate::types::v1alpha1::volume::LocalDiskVolume;
use crate::types::v1alpha1::{DEFAULT_RESIZE_POLICY_LABEL, RESIZE_POLICY_ANNOTATION};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// LVM extent granularity; every computed size is aligned up to this.
pub const LVM_EXTENT_BYTES: i64 = 4 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },
}

// ---------------------------------------------------------------------------
// Pure arithmetic
// ---------------------------------------------------------------------------

/// Round up to the next LVM extent boundary; never below one extent.
pub fn align_to_extent(bytes: i64) -> i64 {
    if bytes <= LVM_EXTENT_BYTES {
        return LVM_EXTENT_BYTES;
    }
    if bytes % LVM_EXTENT_BYTES == 0 {
        return bytes;
    }
    (bytes / LVM_EXTENT_BYTES + 1) * LVM_EXTENT_BYTES
}

pub fn utilization_percent(used: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    used as f64 * 100.0 / total as f64
}

/// Smallest extent-aligned size that brings utilization strictly under
/// warningThreshold - 1.
pub fn compute_bytes_to_resize(used: i64, warning_threshold: u8) -> i64 {
    let target = (warning_threshold as i64 - 1).max(1);
    let mut size = align_to_extent(used * 100 / target);
    while utilization_percent(used, size) >= target as f64 {
        size += LVM_EXTENT_BYTES;
    }
    size
}

/// Parse a Kubernetes quantity string into bytes. Handles plain integers
/// and the binary/decimal suffixes used for storage requests.
pub fn parse_quantity(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'));
    let (number, suffix) = match split {
        Some(idx) => value.split_at(idx),
        None => (value, ""),
    };
    let number: f64 = number.parse().ok()?;

    let factor: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        _ => return None,
    };
    Some((number * factor) as i64)
}

// ---------------------------------------------------------------------------
// Policy selection
// ---------------------------------------------------------------------------

fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(required) = selector.match_labels.as_ref() {
        for (key, value) in required {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    // matchExpressions are not used by any shipped policy
    true
}

/// Newest created-at wins within one tier.
fn newer<'a>(a: Option<&'a ResizePolicy>, b: &'a ResizePolicy) -> &'a ResizePolicy {
    match a {
        None => b,
        Some(current) => {
            let a_ts = current.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let b_ts = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            if b_ts > a_ts { b } else { current }
        }
    }
}

/// Selector priority: PVC labels, then namespace labels, then
/// storage-class labels, then the cluster-wide default.
pub fn determine_policy<'a>(
    policies: &'a [ResizePolicy],
    pvc_labels: &BTreeMap<String, String>,
    namespace_labels: &BTreeMap<String, String>,
    storage_class_labels: &BTreeMap<String, String>,
) -> Option<&'a ResizePolicy> {
    let mut by_pvc: Option<&ResizePolicy> = None;
    let mut by_namespace: Option<&ResizePolicy> = None;
    let mut by_storage_class: Option<&ResizePolicy> = None;
    let mut default: Option<&ResizePolicy> = None;

    for policy in policies {
        if let Some(selector) = policy.spec.pvc_selector.as_ref() {
            if selector_matches(selector, pvc_labels) {
                by_pvc = Some(newer(by_pvc, policy));
            }
            continue;
        }
        if let Some(selector) = policy.spec.namespace_selector.as_ref() {
            if selector_matches(selector, namespace_labels) {
                by_namespace = Some(newer(by_namespace, policy));
            }
            continue;
        }
        if let Some(selector) = policy.spec.storage_class_selector.as_ref() {
            if selector_matches(selector, storage_class_labels) {
                by_storage_class = Some(newer(by_storage_class, policy));
            }
            continue;
        }
        if policy.is_cluster_default()
            && policy
                .labels()
                .get(DEFAULT_RESIZE_POLICY_LABEL)
                .map(|v| v == "true")
                .unwrap_or(false)
        {
            default = Some(newer(default, policy));
        }
    }

    by_pvc.or(by_namespace).or(by_storage_class).or(default)
}

// ---------------------------------------------------------------------------
// Policy binder
// ---------------------------------------------------------------------------

pub struct ResizerCtx {
    pub ctx: Arc<Context>,
}

/// Controller reconcile fn for PVCs: pick the policy and pin its name in
/// the annotation. Re-runs whenever the PVC, its labels, or any policy
/// changes.
pub async fn reconcile_pvc_binding(
    pvc: Arc<PersistentVolumeClaim>,
    rctx: Arc<ResizerCtx>,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;
    let Some(namespace) = pvc.namespace() else {
        return Ok(Action::await_change());
    };

    let policies = ctx
        .list::<ResizePolicy>(&ListParams::default())
        .await?
        .items;
    if policies.is_empty() {
        return Ok(Action::await_change());
    }

    let ns_labels = ctx
        .get::<Namespace>(&namespace)
        .await
        .map(|ns| ns.labels().clone())
        .unwrap_or_default();

    let sc_labels = match pvc
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_ref())
    {
        Some(sc_name) => ctx
            .get::<StorageClass>(sc_name)
            .await
            .map(|sc| sc.labels().clone())
            .unwrap_or_default(),
        None => BTreeMap::new(),
    };

    let chosen = determine_policy(&policies, pvc.labels(), &ns_labels, &sc_labels);
    let wanted = chosen.map(|p| p.name());
    let current = pvc.annotations().get(RESIZE_POLICY_ANNOTATION).cloned();

    if wanted == current {
        return Ok(Action::await_change());
    }

    let mut fresh: PersistentVolumeClaim =
        ctx.get_namespaced(&pvc.name_any(), &namespace).await?;
    match wanted {
        Some(name) => {
            fresh
                .metadata
                .annotations
                .get_or_insert_default()
                .insert(RESIZE_POLICY_ANNOTATION.to_string(), name.clone());
            info!(pvc = %pvc.name_any(), policy = %name, "resize policy bound");
        }
        None => {
            if let Some(annotations) = fresh.metadata.annotations.as_mut() {
                annotations.remove(RESIZE_POLICY_ANNOTATION);
            }
        }
    }
    ctx.update_namespaced(&fresh, &namespace).await?;
    Ok(Action::await_change())
}

pub fn binder_error_policy(
    _pvc: Arc<PersistentVolumeClaim>,
    _error: &Error,
    _rctx: Arc<ResizerCtx>,
) -> Action {
    Action::requeue(Duration::from_secs(10))
}

// ---------------------------------------------------------------------------
// Resizer
// ---------------------------------------------------------------------------

/// Controller reconcile fn for volumes: grow the PVC request when
/// utilization crossed the policy threshold and the pool has headroom.
pub async fn reconcile_volume_resize(
    volume: Arc<LocalDiskVolume>,
    rctx: Arc<ResizerCtx>,
) -> Result<Action, Error> {
    let ctx = &rctx.ctx;

    let Some((namespace, pvc_name)) = split_pvc_ref(&volume.spec.persistent_volume_claim_name)
    else {
        return Ok(Action::await_change());
    };

    let Some(pvc) = ctx
        .get_namespaced_opt::<PersistentVolumeClaim>(&pvc_name, &namespace)
        .await?
    else {
        return Ok(Action::await_change());
    };

    // only annotated PVCs take part
    let Some(policy_name) = pvc.annotations().get(RESIZE_POLICY_ANNOTATION).cloned() else {
        debug!(pvc = %pvc_name, "pvc has no resize-policy annotation");
        return Ok(Action::await_change());
    };
    let Some(policy) = ctx.get_opt::<ResizePolicy>(&policy_name).await? else {
        warn!(policy = %policy_name, "annotated resize policy not found");
        return Ok(Action::await_change());
    };

    let requested = pvc_requested_bytes(&pvc).unwrap_or(0);
    let used = volume
        .status
        .as_ref()
        .map(|s| s.used_capacity_bytes)
        .unwrap_or(0);
    if requested <= 0 || used <= 0 {
        return Ok(Action::await_change());
    }

    let usage = utilization_percent(used, requested);
    if usage < policy.spec.resize_threshold as f64 {
        return Ok(Action::await_change());
    }

    // the placed pool must stay under the policy's usage limit and keep
    // room for the increment
    let node = ctx.get::<LocalDiskNode>(volume.owning_node()).await?;
    let Some(pool) = node.pool(volume.spec.disk_type) else {
        return Ok(Action::await_change());
    };
    let pool_usage =
        utilization_percent(pool.used_capacity_bytes, pool.total_capacity_bytes);
    if pool_usage >= policy.spec.node_pool_usage_limit as f64 {
        debug!(pvc = %pvc_name, pool = %pool.name, "pool usage beyond limit, not resizing");
        return Ok(Action::await_change());
    }

    let new_size = compute_bytes_to_resize(used, policy.spec.warning_threshold);
    // requests only ever grow
    if new_size <= requested {
        return Ok(Action::await_change());
    }
    let increment = new_size - requested;
    if increment > pool.free_capacity_bytes {
        debug!(pvc = %pvc_name, "pool free capacity cannot carry the increment");
        return Ok(Action::await_change());
    }

    patch_pvc_request(ctx, &namespace, &pvc_name, new_size).await?;
    info!(pvc = %pvc_name, from = requested, to = new_size, "pvc request enlarged");
    Ok(Action::await_change())
}

pub fn resizer_error_policy(
    _volume: Arc<LocalDiskVolume>,
    _error: &Error,
    _rctx: Arc<ResizerCtx>,
) -> Action {
    Action::requeue(Duration::from_secs(10))
}

/// `namespace/name`; a bare name defaults to the default namespace.
pub fn split_pvc_ref(reference: &str) -> Option<(String, String)> {
    if reference.is_empty() {
        return None;
    }
    match reference.split_once('/') {
        Some((namespace, name)) => Some((namespace.to_string(), name.to_string())),
        None => Some(("default".to_string(), reference.to_string())),
    }
}

pub fn pvc_requested_bytes(pvc: &PersistentVolumeClaim) -> Option<i64> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(|q| parse_quantity(&q.0))
}

async fn patch_pvc_request(
    ctx: &Context,
    namespace: &str,
    name: &str,
    new_size: i64,
) -> Result<(), Error> {
    for _ in 0..CAS_RETRIES {
        let Some(mut pvc) = ctx
            .get_namespaced_opt::<PersistentVolumeClaim>(name, namespace)
            .await?
        else {
            return Ok(());
        };

        // re-check monotonicity on the fresh read
        if pvc_requested_bytes(&pvc).unwrap_or(0) >= new_size {
            return Ok(());
        }

        if let Some(requests) = pvc
            .spec
            .as_mut()
            .and_then(|s| s.resources.as_mut())
            .and_then(|r| r.requests.as_mut())
        {
            requests.insert("storage".to_string(), Quantity(new_size.to_string()));
        }
        match ctx.update_namespaced(&pvc, namespace).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const GIB: i64 = 1 << 30;

    fn policy(name: &str, created_secs: i64) -> ResizePolicy {
        let mut policy = ResizePolicy::new(
            name,
            crate::types::v1alpha1::resize_policy::ResizePolicySpec {
                resize_threshold: 85,
                warning_threshold: 95,
                node_pool_usage_limit: 90,
                ..Default::default()
            },
        );
        policy.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::from_timestamp(created_secs, 0).unwrap_or_default(),
        ));
        policy
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(pairs)),
            ..Default::default()
        }
    }

    #[test]
    fn alignment_is_4mib() {
        assert_eq!(align_to_extent(0), LVM_EXTENT_BYTES);
        assert_eq!(align_to_extent(LVM_EXTENT_BYTES), LVM_EXTENT_BYTES);
        assert_eq!(align_to_extent(LVM_EXTENT_BYTES + 1), 2 * LVM_EXTENT_BYTES);
        assert_eq!(align_to_extent(3 * LVM_EXTENT_BYTES), 3 * LVM_EXTENT_BYTES);
    }

    #[test]
    fn resize_target_brings_usage_under_warning_minus_one() {
        // 9 GiB used, warning threshold 95 -> smallest aligned size with
        // usage strictly under 94%
        let used = 9 * GIB;
        let size = compute_bytes_to_resize(used, 95);

        assert_eq!(size % LVM_EXTENT_BYTES, 0);
        assert!(utilization_percent(used, size) < 94.0);
        // one extent less would violate the target
        assert!(utilization_percent(used, size - LVM_EXTENT_BYTES) >= 94.0);
        // ~9.58 GiB
        assert_eq!(size, 10_284_433_408);
    }

    #[test]
    fn quantity_parsing_handles_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity("10737418240"), Some(10 * GIB));
        assert_eq!(parse_quantity("10Gi"), Some(10 * GIB));
        assert_eq!(parse_quantity("512Mi"), Some(512 << 20));
        assert_eq!(parse_quantity("1Ki"), Some(1024));
        assert_eq!(parse_quantity("5G"), Some(5_000_000_000));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("10Qq"), None);
    }

    #[test]
    fn policy_priority_pvc_over_namespace_over_storage_class() {
        let mut by_pvc = policy("by-pvc", 100);
        by_pvc.spec.pvc_selector = Some(selector(&[("app", "db")]));
        let mut by_ns = policy("by-ns", 100);
        by_ns.spec.namespace_selector = Some(selector(&[("team", "storage")]));
        let mut by_sc = policy("by-sc", 100);
        by_sc.spec.storage_class_selector = Some(selector(&[("tier", "fast")]));

        let policies = vec![by_sc, by_ns, by_pvc];
        let pvc_labels = labels(&[("app", "db")]);
        let ns_labels = labels(&[("team", "storage")]);
        let sc_labels = labels(&[("tier", "fast")]);

        let chosen = determine_policy(&policies, &pvc_labels, &ns_labels, &sc_labels);
        assert_eq!(chosen.map(|p| p.name()), Some("by-pvc".into()));

        // drop the pvc match: namespace tier wins
        let chosen = determine_policy(&policies, &BTreeMap::new(), &ns_labels, &sc_labels);
        assert_eq!(chosen.map(|p| p.name()), Some("by-ns".into()));

        let chosen =
            determine_policy(&policies, &BTreeMap::new(), &BTreeMap::new(), &sc_labels);
        assert_eq!(chosen.map(|p| p.name()), Some("by-sc".into()));
    }

    #[test]
    fn newest_policy_wins_within_a_tier() {
        let mut older = policy("older", 100);
        older.spec.pvc_selector = Some(selector(&[("app", "db")]));
        let mut newer_policy = policy("newer", 200);
        newer_policy.spec.pvc_selector = Some(selector(&[("app", "db")]));

        let policies = vec![older, newer_policy];
        let chosen = determine_policy(
            &policies,
            &labels(&[("app", "db")]),
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert_eq!(chosen.map(|p| p.name()), Some("newer".into()));
    }

    #[test]
    fn cluster_default_needs_its_label() {
        let unlabeled = policy("unlabeled", 100);
        let mut labeled = policy("default", 100);
        labeled
            .metadata
            .labels
            .get_or_insert_default()
            .insert(DEFAULT_RESIZE_POLICY_LABEL.to_string(), "true".to_string());

        let policies = vec![unlabeled, labeled];
        let chosen = determine_policy(
            &policies,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert_eq!(chosen.map(|p| p.name()), Some("default".into()));
    }

    #[test]
    fn pvc_reference_splits_namespace() {
        assert_eq!(
            split_pvc_ref("prod/data-0"),
            Some(("prod".into(), "data-0".into()))
        );
        assert_eq!(
            split_pvc_ref("data-0"),
            Some(("default".into(), "data-0".into()))
        );
        assert_eq!(split_pvc_ref(""), None);
    }
}

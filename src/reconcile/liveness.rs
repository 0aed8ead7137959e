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

//! Node liveness. Each worker renews a named Lease; one cluster-side
//! detector promotes node records between Ready and Offline on lease
//! freshness. Both transitions for the same node are ordered by the
//! detector's single task; ordering across nodes is not guaranteed.

use crate::context::{self, CAS_RETRIES, Context};
use crate::types::error::sanitize_name;
use crate::types::v1alpha1::WORKER_LEASE_PREFIX;
use crate::types::v1alpha1::node::{LocalDiskNode, NodeState};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::ListParams;
use kube::ResourceExt;
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Advisory lease duration; the detector runs at the same cadence.
pub const LEASE_DURATION_SECONDS: i32 = 30;

/// Renew at half the lease duration so one missed renewal is survivable.
const RENEW_INTERVAL: Duration = Duration::from_secs(15);

const DETECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },
}

/// `hwameistor-local-disk-manager-worker-<node>`, node name sanitized.
pub fn worker_lease_name(node: &str) -> String {
    format!("{WORKER_LEASE_PREFIX}-{}", sanitize_name(node))
}

/// Renew this node's Lease at a fixed cadence until cancelled.
pub async fn run_lease_renewer(
    ctx: Arc<Context>,
    node: String,
    namespace: String,
    cancel: CancellationToken,
) {
    let name = worker_lease_name(&node);
    loop {
        if let Err(err) = renew_once(&ctx, &name, &namespace).await {
            warn!(lease = %name, error = %err, "lease renewal failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RENEW_INTERVAL) => {}
        }
    }
    info!(lease = %name, "lease renewer stopped");
}

async fn renew_once(ctx: &Context, name: &str, namespace: &str) -> Result<(), Error> {
    let now = MicroTime(Utc::now());
    match ctx.get_namespaced_opt::<Lease>(name, namespace).await? {
        Some(mut lease) => {
            let spec = lease.spec.get_or_insert_default();
            spec.holder_identity = Some(name.to_string());
            spec.lease_duration_seconds = Some(LEASE_DURATION_SECONDS);
            spec.renew_time = Some(now);
            ctx.update_namespaced(&lease, namespace).await?;
        }
        None => {
            let mut lease = Lease::default();
            lease.metadata.name = Some(name.to_string());
            lease.metadata.namespace = Some(namespace.to_string());
            lease.spec = Some(LeaseSpec {
                holder_identity: Some(name.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                renew_time: Some(now),
                ..Default::default()
            });
            ctx.create_namespaced(&lease, namespace).await?;
        }
    }
    Ok(())
}

/// Cluster-side detector loop.
pub async fn run_detector(ctx: Arc<Context>, namespace: String, cancel: CancellationToken) {
    loop {
        if let Err(err) = detect_once(&ctx, &namespace).await {
            warn!(error = %err, "node heartbeat detection failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(DETECT_INTERVAL) => {}
        }
    }
    info!("node heartbeat detector stopped");
}

async fn detect_once(ctx: &Context, namespace: &str) -> Result<(), Error> {
    let nodes = ctx
        .list::<LocalDiskNode>(&ListParams::default())
        .await?
        .items;
    let leases = ctx
        .list_namespaced::<Lease>(namespace, &ListParams::default())
        .await?
        .items;

    let now = Utc::now();
    for node in nodes {
        let lease = leases
            .iter()
            .find(|l| l.name_any() == worker_lease_name(&node.name()));

        let Some(next) = next_node_state(node.state(), lease, now) else {
            continue;
        };

        if lease.is_none() {
            warn!(node = %node.name(), "no node heartbeat found");
        }
        if let Err(err) = patch_node_state(ctx, &node.name(), next).await {
            warn!(node = %node.name(), error = %err, "failed to mark node state");
        } else {
            info!(node = %node.name(), state = %next, "node state updated");
        }
    }
    Ok(())
}

async fn patch_node_state(ctx: &Context, node: &str, state: NodeState) -> Result<(), Error> {
    for _ in 0..CAS_RETRIES {
        let Some(fresh) = ctx.get_opt::<LocalDiskNode>(node).await? else {
            return Ok(());
        };
        let rv = fresh.metadata.resource_version.clone().unwrap_or_default();
        match ctx
            .patch_status_cas::<LocalDiskNode>(node, &rv, serde_json::json!({ "state": state }))
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conflict() => {
                debug!(node, "conflict patching node state, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Freshness in seconds since the last renewal, against the advertised
/// lease duration.
fn lease_age_seconds(lease: &Lease, now: DateTime<Utc>) -> Option<(f64, f64)> {
    let spec = lease.spec.as_ref()?;
    let renew = spec.renew_time.as_ref()?;
    let duration = spec.lease_duration_seconds? as f64;
    let age = (now - renew.0).num_milliseconds() as f64 / 1000.0;
    Some((age, duration))
}

/// Ready with a missing or expired lease goes Offline; Offline with a
/// fresh lease goes back Ready.
pub fn next_node_state(
    current: NodeState,
    lease: Option<&Lease>,
    now: DateTime<Utc>,
) -> Option<NodeState> {
    let fresh = lease
        .and_then(|l| lease_age_seconds(l, now))
        .map(|(age, duration)| age < duration);

    match (current, fresh) {
        (NodeState::Ready, None) | (NodeState::Ready, Some(false)) => Some(NodeState::Offline),
        (NodeState::Offline, Some(true)) => Some(NodeState::Ready),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn lease(renewed_secs_ago: i64, duration: i32, now: DateTime<Utc>) -> Lease {
        let mut lease = Lease::default();
        lease.metadata.name = Some(worker_lease_name("n1"));
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(worker_lease_name("n1")),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(now - TimeDelta::seconds(renewed_secs_ago))),
            ..Default::default()
        });
        lease
    }

    #[test]
    fn lease_name_embeds_sanitized_node() {
        assert_eq!(
            worker_lease_name("10.0.0.1"),
            "hwameistor-local-disk-manager-worker-10-0-0-1"
        );
    }

    #[test]
    fn ready_node_with_stale_lease_goes_offline() {
        let now = Utc::now();
        let stale = lease(35, 30, now);
        assert_eq!(
            next_node_state(NodeState::Ready, Some(&stale), now),
            Some(NodeState::Offline)
        );
    }

    #[test]
    fn ready_node_with_missing_lease_goes_offline() {
        let now = Utc::now();
        assert_eq!(
            next_node_state(NodeState::Ready, None, now),
            Some(NodeState::Offline)
        );
    }

    #[test]
    fn fresh_lease_keeps_ready_and_revives_offline() {
        let now = Utc::now();
        let fresh = lease(10, 30, now);
        assert_eq!(next_node_state(NodeState::Ready, Some(&fresh), now), None);
        assert_eq!(
            next_node_state(NodeState::Offline, Some(&fresh), now),
            Some(NodeState::Ready)
        );
    }

    #[test]
    fn offline_node_with_missing_lease_stays_offline() {
        let now = Utc::now();
        assert_eq!(next_node_state(NodeState::Offline, None, now), None);
        let stale = lease(120, 30, now);
        assert_eq!(next_node_state(NodeState::Offline, Some(&stale), now), None);
    }
}

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

use crate::context::Context;
use crate::csi::mounter::LinuxMounter;
use crate::device::probe::DeviceProbe;
use crate::pool::DiskPool;
use crate::reconcile::claim::{ClaimResolverCtx, reconcile_claim};
use crate::reconcile::disk::{DiskInventory, DiskLadderCtx, reconcile_disk};
use crate::reconcile::node::NodePoolManager;
use crate::reconcile::volume::{VolumeReconcilerCtx, reconcile_volume};
use crate::resizer::{ResizerCtx, reconcile_pvc_binding, reconcile_volume_resize};
use crate::types::error::{namespace_from_env, node_name_from_env};
use crate::types::v1alpha1::claim::LocalDiskClaim;
use crate::types::v1alpha1::disk::LocalDisk;
use crate::types::v1alpha1::node::{DEFAULT_POOL_ROOT, LocalDiskNode};
use crate::types::v1alpha1::resize_policy::ResizePolicy;
use crate::types::v1alpha1::volume::LocalDiskVolume;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::CustomResourceExt;
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::{Api, Client};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod context;
pub mod csi;
pub mod device;
pub mod pool;
pub mod reconcile;
pub mod resizer;
pub mod scheduler;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod tests;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            trigger.cancel();
        }
    });
    token
}

/// Node-local agent: device probe, disk inventory, claim resolver, pool
/// manager, volume reconciler and lease renewer for one worker.
pub async fn run_node() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let node = node_name_from_env()?;
    let namespace = namespace_from_env()?;
    let sysfs_root = PathBuf::from("/sys");
    let pool_root = PathBuf::from(DEFAULT_POOL_ROOT);

    let client = Client::try_default().await?;
    let ctx = Arc::new(Context::new(client.clone()));
    let cancel = shutdown_token();

    // host directories and the node record must exist before anything
    // else starts writing
    let host_pool = DiskPool::new(pool_root.clone());
    host_pool.init()?;
    let pool_manager = NodePoolManager::new(ctx.clone(), node.clone(), host_pool);
    pool_manager.ensure_node_record().await?;

    let (probe, events) = DeviceProbe::new(node.clone(), sysfs_root.clone());
    let inventory = DiskInventory::new(ctx.clone(), node.clone(), sysfs_root.clone());

    let probe_task = tokio::spawn(probe.run(cancel.clone()));
    let inventory_task = tokio::spawn(inventory.run(events, cancel.clone()));
    let pool_task = tokio::spawn(pool_manager.run(cancel.clone()));
    let lease_task = tokio::spawn(reconcile::liveness::run_lease_renewer(
        ctx.clone(),
        node.clone(),
        namespace.clone(),
        cancel.clone(),
    ));

    let disk_ctrl = Controller::new(
        Api::<LocalDisk>::all(client.clone()),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(cancel.clone().cancelled_owned())
    .run(
        reconcile_disk,
        reconcile::disk::error_policy,
        Arc::new(DiskLadderCtx {
            ctx: ctx.clone(),
            node: node.clone(),
        }),
    )
    .for_each(|res| async move {
        match res {
            Ok((disk, _)) => info!(disk = %disk.name, "disk reconciled"),
            Err(e) => warn!("disk reconcile failed: {e}"),
        }
    });

    let claim_ctrl = Controller::new(
        Api::<LocalDiskClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(cancel.clone().cancelled_owned())
    .run(
        reconcile_claim,
        reconcile::claim::error_policy,
        Arc::new(ClaimResolverCtx {
            ctx: ctx.clone(),
            node: node.clone(),
        }),
    )
    .for_each(|res| async move {
        match res {
            Ok((claim, _)) => info!(claim = %claim.name, "claim reconciled"),
            Err(e) => warn!("claim reconcile failed: {e}"),
        }
    });

    let volume_ctrl = Controller::new(
        Api::<LocalDiskVolume>::all(client.clone()),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(cancel.clone().cancelled_owned())
    .run(
        reconcile_volume,
        reconcile::volume::error_policy,
        Arc::new(VolumeReconcilerCtx {
            ctx: ctx.clone(),
            node: node.clone(),
            pool: DiskPool::new(pool_root),
            mounter: Arc::new(LinuxMounter),
            sysfs_root,
        }),
    )
    .for_each(|res| async move {
        match res {
            Ok((volume, _)) => info!(volume = %volume.name, "volume reconciled"),
            Err(e) => warn!("volume reconcile failed: {e}"),
        }
    });

    tokio::join!(disk_ctrl, claim_ctrl, volume_ctrl);
    cancel.cancel();
    let _ = tokio::join!(probe_task, inventory_task, pool_task, lease_task);

    Ok(())
}

/// Cluster-side controllers: liveness detector, resize-policy binder and
/// the auto-resizer. Leader election is the orchestrator's problem; this
/// process assumes it is the only instance.
pub async fn run_controller() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let namespace = namespace_from_env()?;
    let client = Client::try_default().await?;
    let ctx = Arc::new(Context::new(client.clone()));
    let cancel = shutdown_token();

    let detector_task = tokio::spawn(reconcile::liveness::run_detector(
        ctx.clone(),
        namespace,
        cancel.clone(),
    ));

    let resizer_ctx = Arc::new(ResizerCtx { ctx: ctx.clone() });

    // any policy change re-binds every PVC
    let policy_changes = watcher(
        Api::<ResizePolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .touched_objects()
    .filter_map(|r| async move { r.ok() })
    .map(|_| ());

    let binder_ctrl = Controller::new(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .reconcile_all_on(policy_changes)
    .graceful_shutdown_on(cancel.clone().cancelled_owned())
    .run(
        reconcile_pvc_binding,
        resizer::binder_error_policy,
        resizer_ctx.clone(),
    )
    .for_each(|res| async move {
        if let Err(e) = res {
            warn!("pvc binding reconcile failed: {e}");
        }
    });

    let resize_ctrl = Controller::new(
        Api::<LocalDiskVolume>::all(client.clone()),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(cancel.clone().cancelled_owned())
    .run(
        reconcile_volume_resize,
        resizer::resizer_error_policy,
        resizer_ctx,
    )
    .for_each(|res| async move {
        if let Err(e) = res {
            warn!("volume resize reconcile failed: {e}");
        }
    });

    tokio::join!(binder_ctrl, resize_ctrl);
    cancel.cancel();
    let _ = detector_task.await;

    Ok(())
}

/// Print the CRDs for every resource this crate owns.
pub async fn crd(file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Pin<Box<dyn AsyncWrite + Send>> = if let Some(file) = file {
        Box::pin(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(file)
                .await?,
        )
    } else {
        Box::pin(tokio::io::stdout())
    };

    let crds = [
        serde_yaml_ng::to_string(&LocalDisk::crd())?,
        serde_yaml_ng::to_string(&LocalDiskClaim::crd())?,
        serde_yaml_ng::to_string(&LocalDiskNode::crd())?,
        serde_yaml_ng::to_string(&LocalDiskVolume::crd())?,
        serde_yaml_ng::to_string(&ResizePolicy::crd())?,
    ];
    writer.write_all(crds.join("---\n").as_bytes()).await?;

    Ok(())
}

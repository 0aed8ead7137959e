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

pub mod claim;
pub mod disk;
pub mod node;
pub mod resize_policy;
pub mod volume;

/// API group shared by every custom resource in this crate.
pub const API_GROUP: &str = "hwameistor.io";

/// Name prefix of LocalDisk objects; the suffix is the identity hash.
pub const LOCAL_DISK_OBJECT_PREFIX: &str = "localdisk-";

/// Finalizer installed on LocalDiskVolume objects until on-disk teardown
/// has completed.
pub const VOLUME_FINALIZER: &str = "localdisk.hwameistor.io/finalizer";

/// Label recording which PVC a disk was reserved for.
pub const RESERVED_PVC_LABEL: &str = "disk.hwameistor.io/pvc";

/// Annotation on a PVC naming the ResizePolicy chosen by the binder.
pub const RESIZE_POLICY_ANNOTATION: &str = const_str::concat!(API_GROUP, "/resize-policy");

/// Label marking the cluster-wide default ResizePolicy.
pub const DEFAULT_RESIZE_POLICY_LABEL: &str =
    const_str::concat!(API_GROUP, "/is-default-resizepolicy");

/// Topology key reported by each node to the CSI adapter.
pub const TOPOLOGY_NODE_KEY: &str = const_str::concat!("topology.disk.", API_GROUP, "/node");

/// Holder-identity prefix of the per-node liveness Lease.
pub const WORKER_LEASE_PREFIX: &str = "hwameistor-local-disk-manager-worker";

/// Claim owner tags.
pub const OWNER_LOCAL_DISK_MANAGER: &str = "local-disk-manager";
pub const OWNER_SYSTEM: &str = "system";

/// Well-known dev-link families under /dev/disk.
pub const LINK_BY_PATH: &str = "by-path";
pub const LINK_BY_ID: &str = "by-id";
pub const LINK_BY_UUID: &str = "by-uuid";

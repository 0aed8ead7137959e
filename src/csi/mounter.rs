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

//! The mount seam of the volume reconciler. Production uses the host
//! mount/mkfs/umount binaries; tests inject a fake.

use crate::utils::shell;
use async_trait::async_trait;
use snafu::Snafu;
use tracing::{debug, info};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Shell { source: shell::Error },

    #[snafu(display("failed to prepare mount target {}: {}", target, source))]
    Target {
        target: String,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Format the device when it has no filesystem signature, then mount it.
    async fn format_and_mount(
        &self,
        dev_path: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), Error>;

    /// Bind-mount the device node onto the target path.
    async fn mount_raw_block(&self, dev_path: &str, target: &str) -> Result<(), Error>;

    async fn unmount(&self, target: &str) -> Result<(), Error>;

    /// Mount points the kernel currently has for this device.
    async fn device_mount_points(&self, dev_path: &str) -> Vec<String>;

    /// Destructive erase of filesystem signatures, not full zeroing.
    async fn wipe(&self, dev_path: &str) -> Result<(), Error>;
}

pub struct LinuxMounter;

impl LinuxMounter {
    async fn has_filesystem(&self, dev_path: &str) -> bool {
        // non-zero exit means blkid found no signature
        shell::run("blkid", &["-o", "value", "-s", "TYPE", dev_path])
            .await
            .map(|out| !out.is_empty())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn format_and_mount(
        &self,
        dev_path: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), Error> {
        if !self.has_filesystem(dev_path).await {
            info!(device = dev_path, fs = fs_type, "formatting device");
            shell::run(&format!("mkfs.{fs_type}"), &[dev_path]).await?;
        }

        std::fs::create_dir_all(target).map_err(|source| Error::Target {
            target: target.to_string(),
            source,
        })?;

        let joined = options.join(",");
        let mut args: Vec<&str> = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([dev_path, target]);
        shell::run("mount", &args).await?;
        Ok(())
    }

    async fn mount_raw_block(&self, dev_path: &str, target: &str) -> Result<(), Error> {
        if let Some(parent) = std::path::Path::new(target).parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Target {
                target: target.to_string(),
                source,
            })?;
        }
        // bind mounts need an existing file as target
        if !std::path::Path::new(target).exists() {
            std::fs::File::create(target).map_err(|source| Error::Target {
                target: target.to_string(),
                source,
            })?;
        }
        shell::run("mount", &["--bind", dev_path, target]).await?;
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), Error> {
        match shell::run("umount", &[target]).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // cross-check the kernel mount table; unmounting an already
                // unmounted path is success
                if !is_mounted(target) {
                    debug!(target, "target already unmounted");
                    return Ok(());
                }
                Err(err.into())
            }
        }
    }

    async fn device_mount_points(&self, dev_path: &str) -> Vec<String> {
        let Ok(mounts) = proc_mounts::MountIter::new() else {
            return Vec::new();
        };
        mounts
            .flatten()
            .filter(|m| m.source.to_string_lossy() == dev_path)
            .map(|m| m.dest.to_string_lossy().into_owned())
            .collect()
    }

    async fn wipe(&self, dev_path: &str) -> Result<(), Error> {
        shell::run("wipefs", &["-af", dev_path]).await?;
        Ok(())
    }
}

fn is_mounted(target: &str) -> bool {
    let Ok(mounts) = proc_mounts::MountIter::new() else {
        return false;
    };
    mounts
        .flatten()
        .any(|m| m.dest.to_string_lossy() == target)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory mounter recording mounts and wipes.
    #[derive(Default)]
    pub struct FakeMounter {
        /// target -> device
        pub mounts: Mutex<BTreeMap<String, String>>,
        pub wiped: Mutex<Vec<String>>,
        /// targets whose mount should fail
        pub fail_targets: Mutex<Vec<String>>,
    }

    impl FakeMounter {
        pub fn new() -> Self {
            Self::default()
        }

        fn should_fail(&self, target: &str) -> bool {
            self.fail_targets
                .lock()
                .map(|f| f.iter().any(|t| t == target))
                .unwrap_or(false)
        }

        fn record(&self, dev: &str, target: &str) {
            if let Ok(mut mounts) = self.mounts.lock() {
                mounts.insert(target.to_string(), dev.to_string());
            }
        }
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn format_and_mount(
            &self,
            dev_path: &str,
            target: &str,
            _fs_type: &str,
            _options: &[String],
        ) -> Result<(), Error> {
            if self.should_fail(target) {
                return Err(Error::Target {
                    target: target.to_string(),
                    source: std::io::Error::other("injected failure"),
                });
            }
            self.record(dev_path, target);
            Ok(())
        }

        async fn mount_raw_block(&self, dev_path: &str, target: &str) -> Result<(), Error> {
            if self.should_fail(target) {
                return Err(Error::Target {
                    target: target.to_string(),
                    source: std::io::Error::other("injected failure"),
                });
            }
            self.record(dev_path, target);
            Ok(())
        }

        async fn unmount(&self, target: &str) -> Result<(), Error> {
            if let Ok(mut mounts) = self.mounts.lock() {
                mounts.remove(target);
            }
            Ok(())
        }

        async fn device_mount_points(&self, dev_path: &str) -> Vec<String> {
            self.mounts
                .lock()
                .map(|m| {
                    m.iter()
                        .filter(|(_, dev)| dev.as_str() == dev_path)
                        .map(|(t, _)| t.clone())
                        .collect()
                })
                .unwrap_or_default()
        }

        async fn wipe(&self, dev_path: &str) -> Result<(), Error> {
            if let Ok(mut wiped) = self.wiped.lock() {
                wiped.push(dev_path.to_string());
            }
            Ok(())
        }
    }
}

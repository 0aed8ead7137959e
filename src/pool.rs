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

//! Host-side pool directories. Layout is compatibility-critical:
//!
//!   {root}/LocalDisk_Pool{HDD,SSD,NVMe}/disk/<disk-symlink-leaf>
//!   {root}/LocalDisk_Pool{HDD,SSD,NVMe}/volume/<volume-name> -> ../disk/<leaf>
//!
//! Both trees hold plain symlinks and nothing else. Only the node pool
//! manager and the volume reconciler on the owning node write here.

use crate::types::v1alpha1::disk::DiskClass;
use crate::types::v1alpha1::node::{pool_disk_dir, pool_path, pool_volume_dir};
use crate::types::v1alpha1::{LINK_BY_ID, LINK_BY_PATH};
use snafu::Snafu;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pool io error at {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("device has no by-id or by-path symlink, devLinks: {:?}", dev_links))]
    NoUsableDevLink { dev_links: Vec<String> },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Pick the stable dev-link a pool symlink should point at:
/// by-id carrying the serial first, by-path as fallback.
pub fn find_suitable_dev_link(dev_links: &[String], serial: &str) -> Result<String, Error> {
    if !serial.is_empty() {
        for link in dev_links {
            if link.contains(LINK_BY_ID) && link.ends_with(serial) {
                return Ok(link.clone());
            }
        }
    }

    dev_links
        .iter()
        .find(|l| l.contains(LINK_BY_PATH))
        .cloned()
        .ok_or_else(|| Error::NoUsableDevLink {
            dev_links: dev_links.to_vec(),
        })
}

/// `/dev/disk/by-path/pci-...-scsi-0:0:0:0` -> `pci-...-scsi-0:0:0:0`
pub fn dev_link_leaf(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

pub struct DiskPool {
    root: PathBuf,
}

impl DiskPool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the directory skeleton for every class.
    pub fn init(&self) -> Result<(), Error> {
        for class in DiskClass::all() {
            for dir in [
                pool_path(&self.root, class),
                pool_disk_dir(&self.root, class),
                pool_volume_dir(&self.root, class),
            ] {
                std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            }
        }
        Ok(())
    }

    /// Add a disk symlink to the pool; returns the symlink leaf. Idempotent.
    pub fn extend(
        &self,
        class: DiskClass,
        dev_links: &[String],
        serial: &str,
    ) -> Result<String, Error> {
        let target = find_suitable_dev_link(dev_links, serial)?;
        let leaf = dev_link_leaf(&target).to_string();

        let link_path = pool_disk_dir(&self.root, class).join(&leaf);
        if link_path.symlink_metadata().is_ok() {
            return Ok(leaf);
        }
        std::os::unix::fs::symlink(&target, &link_path).map_err(io_err(&link_path))?;
        Ok(leaf)
    }

    pub fn disk_symlink_exists(&self, class: DiskClass, leaf: &str) -> bool {
        pool_disk_dir(&self.root, class)
            .join(leaf)
            .symlink_metadata()
            .is_ok()
    }

    /// Remove a disk symlink after the disk left the pool.
    pub fn remove_disk(&self, class: DiskClass, leaf: &str) -> Result<(), Error> {
        let link_path = pool_disk_dir(&self.root, class).join(leaf);
        match std::fs::remove_file(&link_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Io {
                path: link_path,
                source,
            }),
        }
    }

    /// Materialize `volume/<name> -> ../disk/<leaf>`. Idempotent.
    pub fn create_volume(
        &self,
        class: DiskClass,
        volume: &str,
        disk_leaf: &str,
    ) -> Result<PathBuf, Error> {
        let link_path = pool_volume_dir(&self.root, class).join(volume);
        if link_path.symlink_metadata().is_ok() {
            return Ok(link_path);
        }
        let target = Path::new("../disk").join(disk_leaf);
        std::os::unix::fs::symlink(&target, &link_path).map_err(io_err(&link_path))?;
        Ok(link_path)
    }

    pub fn delete_volume(&self, class: DiskClass, volume: &str) -> Result<(), Error> {
        let link_path = pool_volume_dir(&self.root, class).join(volume);
        match std::fs::remove_file(&link_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Io {
                path: link_path,
                source,
            }),
        }
    }

    pub fn volume_path(&self, class: DiskClass, volume: &str) -> PathBuf {
        pool_volume_dir(&self.root, class).join(volume)
    }

    /// Resolve a volume symlink back to the stable dev-link it was placed
    /// on: volume/<name> -> ../disk/<leaf> -> /dev/disk/by-*/<leaf>.
    pub fn volume_dev_link(&self, class: DiskClass, volume: &str) -> Result<String, Error> {
        let volume_link = self.volume_path(class, volume);
        let disk_rel = std::fs::read_link(&volume_link).map_err(io_err(&volume_link))?;

        let disk_link = pool_path(&self.root, class).join(
            disk_rel
                .strip_prefix("..")
                .unwrap_or(disk_rel.as_path()),
        );
        let target = std::fs::read_link(&disk_link).map_err(io_err(&disk_link))?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// Volume names currently materialized for a class.
    pub fn list_volumes(&self, class: DiskClass) -> Result<Vec<String>, Error> {
        let dir = pool_volume_dir(&self.root, class);
        let entries = std::fs::read_dir(&dir).map_err(io_err(&dir))?;
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool() -> (tempfile::TempDir, DiskPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DiskPool::new(dir.path().to_path_buf());
        pool.init().unwrap();
        (dir, pool)
    }

    #[test]
    fn init_creates_all_class_directories() {
        let (dir, _pool) = pool();
        for class in ["HDD", "SSD", "NVMe"] {
            assert!(dir.path().join(format!("LocalDisk_Pool{class}/disk")).is_dir());
            assert!(dir.path().join(format!("LocalDisk_Pool{class}/volume")).is_dir());
        }
    }

    #[test]
    fn prefers_by_id_with_serial_then_by_path() {
        let links = vec![
            "/dev/disk/by-path/pci-0000:03:00.0-scsi-0:0:0:0".to_string(),
            "/dev/disk/by-id/scsi-ZC11Y2AM".to_string(),
        ];
        assert_eq!(
            find_suitable_dev_link(&links, "ZC11Y2AM").unwrap(),
            "/dev/disk/by-id/scsi-ZC11Y2AM"
        );
        assert_eq!(
            find_suitable_dev_link(&links, "OTHER").unwrap(),
            "/dev/disk/by-path/pci-0000:03:00.0-scsi-0:0:0:0"
        );
        assert!(find_suitable_dev_link(&["/dev/sda".to_string()], "").is_err());
    }

    #[test]
    fn volume_symlink_round_trip() {
        let (dir, pool) = pool();

        // fake stable dev link target
        let by_path = dir.path().join("by-path-target");
        std::fs::write(&by_path, b"").unwrap();
        let links = vec![format!(
            "/dev/disk/by-path/{}",
            by_path.file_name().unwrap().to_string_lossy()
        )];

        let leaf = pool.extend(DiskClass::HDD, &links, "").unwrap();
        assert!(pool.disk_symlink_exists(DiskClass::HDD, &leaf));
        // extending again is a no-op
        assert_eq!(pool.extend(DiskClass::HDD, &links, "").unwrap(), leaf);

        pool.create_volume(DiskClass::HDD, "v1", &leaf).unwrap();
        assert_eq!(pool.list_volumes(DiskClass::HDD).unwrap(), vec!["v1".to_string()]);

        let resolved = pool.volume_dev_link(DiskClass::HDD, "v1").unwrap();
        assert!(resolved.ends_with(&leaf));

        pool.delete_volume(DiskClass::HDD, "v1").unwrap();
        assert!(pool.list_volumes(DiskClass::HDD).unwrap().is_empty());
        // deleting twice stays clean
        pool.delete_volume(DiskClass::HDD, "v1").unwrap();
    }
}

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

//! Two sources feed one normalized event channel: a kernel hotplug
//! subscription (`udevadm monitor`) and a periodic re-enumeration whose
//! interval doubles from 1 to 8 minutes and then wraps. The periodic pass
//! is the safety net when the monitor drops events.

use crate::device::classifier::{self, DeviceAttributes};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Normalized kinds. Remove events carry no attributes; the kernel has
/// already forgotten the device, so parsing would only fabricate data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEventKind {
    Add,
    Change,
    Remove,
    Exist,
}

#[derive(Clone, Debug)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub node: String,
    pub dev_name: String,
    pub dev_path: String,
    pub attributes: Option<DeviceAttributes>,
}

/// Re-enumeration intervals in minutes; the schedule wraps at the end.
const ENUM_BACKOFF_MINUTES: [u64; 4] = [1, 2, 4, 8];

/// Delay before reopening a torn-down monitor.
const MONITOR_REOPEN_DELAY: Duration = Duration::from_secs(5);

pub struct DeviceProbe {
    node: String,
    sysfs_root: PathBuf,
    tx: mpsc::Sender<DeviceEvent>,
}

impl DeviceProbe {
    pub fn new(node: String, sysfs_root: PathBuf) -> (Self, mpsc::Receiver<DeviceEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                node,
                sysfs_root,
                tx,
            },
            rx,
        )
    }

    /// Drive both sources until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let monitor = self.monitor_loop(cancel.clone());
        let enumerate = self.enumerate_loop(cancel);
        tokio::join!(monitor, enumerate);
        info!("device probe stopped");
    }

    async fn monitor_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.watch_monitor(&cancel).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "udev monitor torn down, reopening");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(MONITOR_REOPEN_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One monitor session; returns Ok on cancellation, Err on any stream
    /// failure so the caller reopens it.
    async fn watch_monitor(&self, cancel: &CancellationToken) -> std::io::Result<()> {
        let mut child = Command::new("udevadm")
            .args(["monitor", "--udev", "--property", "--subsystem-match=block"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("udevadm monitor produced no stdout")
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let mut stanza: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => {
                    match line? {
                        Some(line) if line.trim().is_empty() => {
                            self.dispatch_stanza(&stanza).await;
                            stanza.clear();
                        }
                        Some(line) => stanza.push(line),
                        None => {
                            self.dispatch_stanza(&stanza).await;
                            return Err(std::io::Error::other("udevadm monitor stream closed"));
                        }
                    }
                }
            }
        }
    }

    /// Turn one monitor stanza into at most one normalized event.
    /// Malformed stanzas are dropped with a warning.
    async fn dispatch_stanza(&self, stanza: &[String]) {
        if stanza.is_empty() {
            return;
        }

        let props = classifier::parse_udev_properties(&stanza.join("\n"));
        let action = props.get("ACTION").cloned().unwrap_or_default();
        let dev_path = props.get("DEVNAME").cloned().unwrap_or_default();
        let dev_type = props.get("DEVTYPE").cloned().unwrap_or_default();
        let subsystem = props.get("SUBSYSTEM").cloned().unwrap_or_default();
        let dev_name = dev_path.rsplit('/').next().unwrap_or_default().to_string();

        // headers-only stanzas (monitor banner) carry no properties
        if action.is_empty() && dev_path.is_empty() {
            return;
        }

        if !subsystem.is_empty() && subsystem != "block" {
            return;
        }
        if dev_type != "disk" {
            return;
        }

        let kind = match action.as_str() {
            "add" => DeviceEventKind::Add,
            "change" => DeviceEventKind::Change,
            "remove" => DeviceEventKind::Remove,
            other => {
                debug!(action = other, "ignoring udev action");
                return;
            }
        };

        if dev_name.is_empty() {
            warn!(?stanza, "dropping malformed udev event without DEVNAME");
            return;
        }

        let event = match kind {
            DeviceEventKind::Remove => DeviceEvent {
                kind,
                node: self.node.clone(),
                dev_name,
                dev_path,
                attributes: None,
            },
            _ => {
                if classifier::is_virtual_name(&dev_name) {
                    return;
                }
                match classifier::resolve(&dev_path, &self.sysfs_root).await {
                    Ok(attrs) if attrs.is_manageable_disk() => DeviceEvent {
                        kind,
                        node: self.node.clone(),
                        dev_name,
                        dev_path,
                        attributes: Some(attrs),
                    },
                    Ok(_) => return,
                    Err(err) => {
                        warn!(device = %dev_name, error = %err, "dropping unresolvable udev event");
                        return;
                    }
                }
            }
        };

        if self.tx.send(event).await.is_err() {
            debug!("device event channel closed");
        }
    }

    async fn enumerate_loop(&self, cancel: CancellationToken) {
        let mut step = 0usize;
        loop {
            self.enumerate_once().await;

            let minutes = ENUM_BACKOFF_MINUTES[step];
            step = (step + 1) % ENUM_BACKOFF_MINUTES.len();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
            }
        }
    }

    /// Emit an Exist event for every manageable disk currently visible.
    async fn enumerate_once(&self) {
        let devices = match classifier::list_block_devices(&self.sysfs_root).await {
            Ok(devices) => devices,
            Err(err) => {
                warn!(error = %err, "periodic enumeration failed");
                return;
            }
        };

        for attrs in devices {
            if !attrs.is_manageable_disk() {
                continue;
            }
            let event = DeviceEvent {
                kind: DeviceEventKind::Exist,
                node: self.node.clone(),
                dev_name: attrs.dev_name.clone(),
                dev_path: attrs.dev_path.clone(),
                attributes: Some(attrs),
            };
            if self.tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_then_wraps() {
        assert_eq!(ENUM_BACKOFF_MINUTES, [1, 2, 4, 8]);
        let mut step = 0usize;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(ENUM_BACKOFF_MINUTES[step]);
            step = (step + 1) % ENUM_BACKOFF_MINUTES.len();
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 1, 2]);
    }
}

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

//! SMART probing. The probe only interprets the boolean overall-health bit;
//! the attribute table is carried opaquely. A failed probe is never an
//! error for the caller, it just yields Unknown.

use crate::types::v1alpha1::disk::{SmartAssessResult, SmartInfo};
use crate::utils::shell;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Drives are probed at most once per sweep window to avoid wear and
/// kernel pressure.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct SmartCollector {
    last_probe: HashMap<String, Instant>,
}

impl SmartCollector {
    pub fn new() -> Self {
        Self {
            last_probe: HashMap::new(),
        }
    }

    /// Probe one device, honoring the sweep window. Returns None when the
    /// window has not elapsed yet.
    pub async fn probe(&mut self, dev_path: &str) -> Option<SmartInfo> {
        let now = Instant::now();
        if let Some(last) = self.last_probe.get(dev_path)
            && now.duration_since(*last) < SWEEP_INTERVAL
        {
            return None;
        }
        self.last_probe.insert(dev_path.to_string(), now);

        let output = match shell::run("smartctl", &["--health", "--json", dev_path]).await {
            Ok(out) => out,
            Err(err) => {
                debug!(device = dev_path, error = %err, "smart probe failed");
                return Some(SmartInfo::default());
            }
        };

        Some(parse_smartctl_output(&output))
    }
}

impl Default for SmartCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse smartctl JSON; anything unparseable yields Unknown health.
pub fn parse_smartctl_output(output: &str) -> SmartInfo {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(output) else {
        return SmartInfo::default();
    };

    let overall_health = match value.pointer("/smart_status/passed").and_then(|v| v.as_bool()) {
        Some(true) => SmartAssessResult::Passed,
        Some(false) => SmartAssessResult::Failed,
        None => SmartAssessResult::Unknown,
    };

    let mut attributes = BTreeMap::new();
    if let Some(table) = value
        .pointer("/ata_smart_attributes/table")
        .and_then(|v| v.as_array())
    {
        for entry in table {
            let Some(name) = entry.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(raw) = entry.pointer("/raw/string").and_then(|v| v.as_str()) {
                attributes.insert(name.to_string(), raw.to_string());
            }
        }
    }

    SmartInfo {
        overall_health,
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passed_health_bit() {
        let info = parse_smartctl_output(r#"{"smart_status":{"passed":true}}"#);
        assert_eq!(info.overall_health, SmartAssessResult::Passed);
    }

    #[test]
    fn parses_failed_health_bit() {
        let info = parse_smartctl_output(r#"{"smart_status":{"passed":false}}"#);
        assert_eq!(info.overall_health, SmartAssessResult::Failed);
    }

    #[test]
    fn garbage_is_unknown_not_error() {
        let info = parse_smartctl_output("not json at all");
        assert_eq!(info.overall_health, SmartAssessResult::Unknown);
        assert!(info.attributes.is_empty());
    }

    #[test]
    fn attribute_table_is_carried_opaquely() {
        let payload = r#"{
            "smart_status": {"passed": true},
            "ata_smart_attributes": {"table": [
                {"name": "Reallocated_Sector_Ct", "raw": {"string": "0"}},
                {"name": "Temperature_Celsius", "raw": {"string": "34"}}
            ]}
        }"#;
        let info = parse_smartctl_output(payload);
        assert_eq!(info.attributes.get("Temperature_Celsius").map(String::as_str), Some("34"));
        assert_eq!(info.attributes.len(), 2);
    }
}

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

//! Every host command (udevadm, mount, wipefs, smartctl) funnels through
//! here so callers share one timeout and error shape.

use snafu::Snafu;
use std::time::Duration;
use tokio::process::Command;

/// Host commands must not hang a reconciler forever.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to spawn '{}': {}", command, source))]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("'{}' timed out after {:?}", command, timeout))]
    Timeout { command: String, timeout: Duration },

    #[snafu(display("'{}' exited with {}: {}", command, code, stderr))]
    NonZero {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Run a host command and return trimmed stdout.
pub async fn run(program: &str, args: &[&str]) -> Result<String, Error> {
    let rendered = format!("{program} {}", args.join(" "));

    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| Error::Timeout {
        command: rendered.clone(),
        timeout: COMMAND_TIMEOUT,
    })?
    .map_err(|source| Error::Spawn {
        command: rendered.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(Error::NonZero {
            command: rendered,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Split command output into trimmed, non-empty lines.
pub fn lines(output: &str) -> Vec<&str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_drops_blank_entries() {
        assert_eq!(lines("a\n\n  b  \n"), vec!["a", "b"]);
    }
}

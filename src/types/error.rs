// Copyright 2025 HwameiStor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("environment variable '{}' is not set", name))]
    EnvMissing { name: String },

    #[snafu(display("internal error: {}", msg))]
    InternalError { msg: String },

    #[snafu(display("cannot modify immutable field '{}' in {}: {}", field, name, message))]
    ImmutableFieldModified {
        name: String,
        field: String,
        message: String,
    },

    #[snafu(display("serde_json error: {}", source))]
    SerdeJson { source: serde_json::Error },
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::SerdeJson { source }
    }
}

/// NODENAME must be present for each node-local process.
pub fn node_name_from_env() -> Result<String, Error> {
    std::env::var("NODENAME").map_err(|_| Error::EnvMissing {
        name: "NODENAME".into(),
    })
}

/// NAMESPACE must be present for each node-local process.
pub fn namespace_from_env() -> Result<String, Error> {
    std::env::var("NAMESPACE").map_err(|_| Error::EnvMissing {
        name: "NAMESPACE".into(),
    })
}

/// Lease holder identities must be valid object names; node names may be
/// raw IPs, e.g. 10.23.10.12 becomes 10-23-10-12.
pub fn sanitize_name(name: &str) -> String {
    name.replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_replaces_dots() {
        assert_eq!(sanitize_name("10.23.10.12"), "10-23-10-12");
        assert_eq!(sanitize_name("worker-1"), "worker-1");
    }
}

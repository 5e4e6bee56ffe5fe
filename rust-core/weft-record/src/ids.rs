// SPDX-License-Identifier: PMPL-1.0-or-later
//! Identifiers and client-id conventions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of the synthetic root record every operation hangs off.
pub const ROOT_ID: &str = "client:root";

/// Typename of the root record.
pub const ROOT_TYPE: &str = "__Root";

/// Prefix marking identifiers that were minted locally rather than by a server.
pub const CLIENT_ID_PREFIX: &str = "client:";

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(0);

/// Stable key for one logical object inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(String);

impl DataId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root record identifier.
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DataId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key scoping one isolated store environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Name of the partition used when a caller does not pick one.
    pub const DEFAULT: &'static str = "default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of a request: its id (or name) followed by its stable variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestIdentifier(String);

impl RequestIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the client id for a field of `id`, optionally at a list `index`.
///
/// The `client:` prefix is only added once, so nested derivations stay flat.
pub fn generate_client_id(id: &DataId, storage_key: &str, index: Option<usize>) -> DataId {
    let mut key = format!("{}:{}", id.as_str(), storage_key);
    if let Some(index) = index {
        key.push(':');
        key.push_str(&index.to_string());
    }
    if !key.starts_with(CLIENT_ID_PREFIX) {
        key.insert_str(0, CLIENT_ID_PREFIX);
    }
    DataId(key)
}

/// Mint a process-unique client id (`client:local:<n>`).
pub fn generate_unique_client_id() -> DataId {
    let n = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);
    DataId(format!("{CLIENT_ID_PREFIX}local:{n}"))
}

pub fn is_client_id(id: &DataId) -> bool {
    id.as_str().starts_with(CLIENT_ID_PREFIX)
}

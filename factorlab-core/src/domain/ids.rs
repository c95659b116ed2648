use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a locked snapshot (BLAKE3 hex of the captured manifests + lock sequence).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a single dataset's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestHash(pub String);

impl ManifestHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// Sentinel used when a dataset that was locked no longer exists.
    pub fn missing() -> Self {
        Self("<missing>".to_string())
    }
}

impl fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical dataset names.
pub mod dataset {
    pub const PRICES: &str = "prices";
    pub const FUNDAMENTALS: &str = "fundamentals";
    pub const SECURITIES: &str = "securities";

    pub const ALL: [&str; 3] = [PRICES, FUNDAMENTALS, SECURITIES];
}

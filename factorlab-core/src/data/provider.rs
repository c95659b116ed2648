//! Data provider trait and structured error types.
//!
//! The DataProvider trait is the only way the backtester reaches market data.
//! Every call carries the run's snapshot id and an as-of date; implementations
//! must not return a record whose availability is after that date.

use chrono::NaiveDate;
use thiserror::Error;

use crate::domain::{DateRange, FundamentalRecord, ManifestHash, PriceRecord, Security, SnapshotId};

/// Structured error types for data operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    #[error(
        "manifest version changed for dataset '{dataset}' under snapshot {snapshot_id} \
         (locked {locked}, now {current}); restart the run under a fresh snapshot"
    )]
    ManifestVersionChanged {
        snapshot_id: SnapshotId,
        dataset: String,
        locked: ManifestHash,
        current: ManifestHash,
    },

    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(SnapshotId),

    #[error("dataset not found: {0}")]
    DatasetMissing(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    pub fn is_manifest_changed(&self) -> bool {
        matches!(self, DataError::ManifestVersionChanged { .. })
    }
}

/// Trait for point-in-time data backends.
///
/// Backends are swappable (in-memory, CSV directory, synthetic); the snapshot
/// check lives in [`super::VersionCheckedProvider`] so backends only implement
/// the as-of filtering.
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Adjusted daily prices for `symbols` with `date` in `range` and
    /// `available_at <= as_of`, sorted by (symbol, date).
    fn get_prices(
        &self,
        symbols: &[String],
        range: DateRange,
        as_of: NaiveDate,
        snapshot: &SnapshotId,
    ) -> Result<Vec<PriceRecord>, DataError>;

    /// Fundamental records for `symbols` usable on `as_of`:
    /// `period_end + filing_lag_days <= as_of` and `available_at <= as_of`.
    /// Sorted by (symbol, field, period_end).
    fn get_fundamentals(
        &self,
        symbols: &[String],
        as_of: NaiveDate,
        filing_lag_days: u32,
        snapshot: &SnapshotId,
    ) -> Result<Vec<FundamentalRecord>, DataError>;

    /// Securities known as of `as_of`. With `include_inactive` the list also
    /// contains securities delisted on or before `as_of`, which is what a
    /// survivorship-free universe needs.
    fn get_security_universe(
        &self,
        as_of: NaiveDate,
        include_inactive: bool,
        snapshot: &SnapshotId,
    ) -> Result<Vec<Security>, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_change_is_detectable() {
        let err = DataError::ManifestVersionChanged {
            snapshot_id: SnapshotId::from_bytes(b"s"),
            dataset: "prices".into(),
            locked: ManifestHash::from_bytes(b"a"),
            current: ManifestHash::from_bytes(b"b"),
        };
        assert!(err.is_manifest_changed());
        assert!(err.to_string().contains("prices"));
        assert!(!DataError::Other("x".into()).is_manifest_changed());
    }
}

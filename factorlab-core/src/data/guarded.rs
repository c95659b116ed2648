//! Snapshot-checked provider.
//!
//! Wraps any backend and verifies the caller's snapshot before and after every
//! call. A read that overlaps a concurrent mutation therefore fails instead of
//! returning data from either version, and once a snapshot is invalidated every
//! later call fails fast with `DataError::ManifestVersionChanged`.

use std::sync::Arc;

use chrono::NaiveDate;

use super::provider::{DataError, DataProvider};
use crate::domain::{DateRange, FundamentalRecord, PriceRecord, Security, SnapshotId};
use crate::snapshot::SnapshotManager;

pub struct VersionCheckedProvider {
    inner: Arc<dyn DataProvider>,
    snapshots: Arc<SnapshotManager>,
}

impl VersionCheckedProvider {
    pub fn new(inner: Arc<dyn DataProvider>, snapshots: Arc<SnapshotManager>) -> Self {
        Self { inner, snapshots }
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    fn checked<T>(
        &self,
        snapshot: &SnapshotId,
        call: impl FnOnce(&dyn DataProvider) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        self.snapshots.verify(snapshot)?;
        let out = call(self.inner.as_ref())?;
        self.snapshots.verify(snapshot)?;
        Ok(out)
    }
}

impl DataProvider for VersionCheckedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_prices(
        &self,
        symbols: &[String],
        range: DateRange,
        as_of: NaiveDate,
        snapshot: &SnapshotId,
    ) -> Result<Vec<PriceRecord>, DataError> {
        self.checked(snapshot, |p| p.get_prices(symbols, range, as_of, snapshot))
    }

    fn get_fundamentals(
        &self,
        symbols: &[String],
        as_of: NaiveDate,
        filing_lag_days: u32,
        snapshot: &SnapshotId,
    ) -> Result<Vec<FundamentalRecord>, DataError> {
        self.checked(snapshot, |p| {
            p.get_fundamentals(symbols, as_of, filing_lag_days, snapshot)
        })
    }

    fn get_security_universe(
        &self,
        as_of: NaiveDate,
        include_inactive: bool,
        snapshot: &SnapshotId,
    ) -> Result<Vec<Security>, DataError> {
        self.checked(snapshot, |p| {
            p.get_security_universe(as_of, include_inactive, snapshot)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryProvider;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup() -> (Arc<InMemoryProvider>, VersionCheckedProvider) {
        let store = Arc::new(InMemoryProvider::default());
        store
            .upsert_securities(vec![Security {
                symbol: "AAA".into(),
                listed: d(2020, 1, 1),
                delisted: None,
            }])
            .unwrap();
        let manager = Arc::new(SnapshotManager::new(store.clone()));
        let guarded = VersionCheckedProvider::new(store.clone(), manager);
        (store, guarded)
    }

    #[test]
    fn passes_through_under_valid_snapshot() {
        let (_store, guarded) = setup();
        let snap = guarded.snapshots().lock().unwrap();
        let universe = guarded
            .get_security_universe(d(2020, 6, 1), true, &snap)
            .unwrap();
        assert_eq!(universe.len(), 1);
    }

    #[test]
    fn every_call_fails_after_mutation() {
        let (store, guarded) = setup();
        let snap = guarded.snapshots().lock().unwrap();
        store
            .upsert_securities(vec![Security {
                symbol: "BBB".into(),
                listed: d(2020, 1, 1),
                delisted: None,
            }])
            .unwrap();

        let syms = vec!["AAA".to_string()];
        let range = DateRange::new(d(2020, 1, 1), d(2020, 1, 31)).unwrap();
        assert!(guarded
            .get_security_universe(d(2020, 6, 1), true, &snap)
            .unwrap_err()
            .is_manifest_changed());
        assert!(guarded
            .get_prices(&syms, range, d(2020, 2, 1), &snap)
            .unwrap_err()
            .is_manifest_changed());
        assert!(guarded
            .get_fundamentals(&syms, d(2020, 2, 1), 45, &snap)
            .unwrap_err()
            .is_manifest_changed());
    }

    #[test]
    fn unknown_snapshot_rejected() {
        let (_store, guarded) = setup();
        let bogus = SnapshotId::from_bytes(b"never-locked");
        assert!(matches!(
            guarded.get_security_universe(d(2020, 6, 1), true, &bogus),
            Err(DataError::UnknownSnapshot(_))
        ));
    }
}

//! In-memory data store.
//!
//! Holds prices, fundamentals and the security master behind a `RwLock` and
//! implements both `DataProvider` and `ManifestSource`. Each dataset's
//! manifest is the BLAKE3 hash of its canonical JSON, recomputed on every
//! mutation, so writing to the store while a run holds a snapshot is a
//! manifest change.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::provider::{DataError, DataProvider};
use crate::domain::{
    dataset, DateRange, FundamentalRecord, ManifestHash, PriceRecord, Security, SnapshotId,
};
use crate::snapshot::ManifestSource;

/// Full contents of a store, in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDump {
    pub prices: Vec<PriceRecord>,
    pub fundamentals: Vec<FundamentalRecord>,
    pub securities: Vec<Security>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// symbol → records sorted by date (one per date).
    prices: BTreeMap<String, Vec<PriceRecord>>,
    /// symbol → records sorted by (field, period_end).
    fundamentals: BTreeMap<String, Vec<FundamentalRecord>>,
    /// symbol → security.
    securities: BTreeMap<String, Security>,
    manifests: BTreeMap<String, ManifestHash>,
}

impl StoreState {
    fn rehash(&mut self, name: &str) -> Result<(), DataError> {
        let bytes = match name {
            dataset::PRICES => serde_json::to_vec(&self.prices),
            dataset::FUNDAMENTALS => serde_json::to_vec(&self.fundamentals),
            dataset::SECURITIES => serde_json::to_vec(&self.securities),
            other => return Err(DataError::DatasetMissing(other.to_string())),
        }
        .map_err(|e| DataError::Other(format!("manifest serialization: {e}")))?;
        self.manifests
            .insert(name.to_string(), ManifestHash::from_bytes(&bytes));
        Ok(())
    }
}

/// Thread-safe in-memory provider.
#[derive(Debug)]
pub struct InMemoryProvider {
    name: String,
    state: RwLock<StoreState>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryProvider {
    /// An empty store. All three datasets exist (empty) from the start.
    pub fn new(name: impl Into<String>) -> Self {
        let mut state = StoreState::default();
        for ds in dataset::ALL {
            // Serializing empty maps cannot fail.
            let _ = state.rehash(ds);
        }
        Self {
            name: name.into(),
            state: RwLock::new(state),
        }
    }

    /// Build a store from a full dump.
    pub fn from_dump(name: impl Into<String>, dump: DatasetDump) -> Result<Self, DataError> {
        let store = Self::new(name);
        store.upsert_securities(dump.securities)?;
        store.insert_prices(dump.prices)?;
        store.insert_fundamentals(dump.fundamentals)?;
        Ok(store)
    }

    /// Insert or replace price records (keyed by symbol and date).
    pub fn insert_prices(&self, records: Vec<PriceRecord>) -> Result<(), DataError> {
        for rec in &records {
            if !rec.is_sane() {
                return Err(DataError::Validation(format!(
                    "price record {} {} failed sanity check",
                    rec.symbol, rec.date
                )));
            }
        }
        let mut state = self.write();
        for rec in records {
            let series = state.prices.entry(rec.symbol.clone()).or_default();
            match series.binary_search_by_key(&rec.date, |p| p.date) {
                Ok(i) => series[i] = rec,
                Err(i) => series.insert(i, rec),
            }
        }
        state.rehash(dataset::PRICES)
    }

    /// Insert or replace fundamental records (keyed by symbol, field and period end).
    pub fn insert_fundamentals(&self, records: Vec<FundamentalRecord>) -> Result<(), DataError> {
        let mut state = self.write();
        for rec in records {
            let series = state.fundamentals.entry(rec.symbol.clone()).or_default();
            let position = series.binary_search_by(|f| {
                (f.field.as_str(), f.period_end).cmp(&(rec.field.as_str(), rec.period_end))
            });
            match position {
                Ok(i) => series[i] = rec,
                Err(i) => series.insert(i, rec),
            }
        }
        state.rehash(dataset::FUNDAMENTALS)
    }

    /// Insert or replace security master entries.
    pub fn upsert_securities(&self, securities: Vec<Security>) -> Result<(), DataError> {
        let mut state = self.write();
        for sec in securities {
            if let Some(delisted) = sec.delisted {
                if delisted <= sec.listed {
                    return Err(DataError::Validation(format!(
                        "security {} delisted {} on or before listing {}",
                        sec.symbol, delisted, sec.listed
                    )));
                }
            }
            state.securities.insert(sec.symbol.clone(), sec);
        }
        state.rehash(dataset::SECURITIES)
    }

    /// Copy of the full store contents.
    pub fn dump(&self) -> DatasetDump {
        let state = self.read();
        DatasetDump {
            prices: state.prices.values().flatten().cloned().collect(),
            fundamentals: state.fundamentals.values().flatten().cloned().collect(),
            securities: state.securities.values().cloned().collect(),
        }
    }

    /// Distinct trading dates present in the price dataset.
    pub fn trading_dates(&self) -> Vec<NaiveDate> {
        let state = self.read();
        let mut dates: Vec<NaiveDate> = state.prices.values().flatten().map(|p| p.date).collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataProvider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_prices(
        &self,
        symbols: &[String],
        range: DateRange,
        as_of: NaiveDate,
        _snapshot: &SnapshotId,
    ) -> Result<Vec<PriceRecord>, DataError> {
        let state = self.read();
        let mut sorted: Vec<&String> = symbols.iter().collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut out = Vec::new();
        for symbol in sorted {
            let Some(series) = state.prices.get(symbol) else {
                continue;
            };
            let lo = series.partition_point(|p| p.date < range.start);
            let hi = series.partition_point(|p| p.date <= range.end);
            out.extend(
                series[lo..hi]
                    .iter()
                    .filter(|p| p.available_at <= as_of)
                    .cloned(),
            );
        }
        Ok(out)
    }

    fn get_fundamentals(
        &self,
        symbols: &[String],
        as_of: NaiveDate,
        filing_lag_days: u32,
        _snapshot: &SnapshotId,
    ) -> Result<Vec<FundamentalRecord>, DataError> {
        let state = self.read();
        let mut sorted: Vec<&String> = symbols.iter().collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut out = Vec::new();
        for symbol in sorted {
            if let Some(series) = state.fundamentals.get(symbol) {
                out.extend(
                    series
                        .iter()
                        .filter(|f| f.is_available(as_of, filing_lag_days))
                        .cloned(),
                );
            }
        }
        Ok(out)
    }

    fn get_security_universe(
        &self,
        as_of: NaiveDate,
        include_inactive: bool,
        _snapshot: &SnapshotId,
    ) -> Result<Vec<Security>, DataError> {
        let state = self.read();
        Ok(state
            .securities
            .values()
            .filter(|s| {
                if include_inactive {
                    s.existed_by(as_of)
                } else {
                    s.is_listed_on(as_of)
                }
            })
            .cloned()
            .collect())
    }
}

impl ManifestSource for InMemoryProvider {
    fn datasets(&self) -> Vec<String> {
        self.read().manifests.keys().cloned().collect()
    }

    fn manifest(&self, name: &str) -> Result<ManifestHash, DataError> {
        self.read()
            .manifests
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::DatasetMissing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn price(symbol: &str, date: NaiveDate, available_at: NaiveDate, close: f64) -> PriceRecord {
        PriceRecord {
            symbol: symbol.into(),
            date,
            available_at,
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
        }
    }

    fn snap() -> SnapshotId {
        SnapshotId::from_bytes(b"test")
    }

    fn store() -> InMemoryProvider {
        let store = InMemoryProvider::default();
        store
            .upsert_securities(vec![
                Security {
                    symbol: "AAA".into(),
                    listed: d(2020, 1, 1),
                    delisted: None,
                },
                Security {
                    symbol: "BBB".into(),
                    listed: d(2020, 1, 1),
                    delisted: Some(d(2020, 1, 4)),
                },
                Security {
                    symbol: "CCC".into(),
                    listed: d(2020, 1, 3),
                    delisted: None,
                },
            ])
            .unwrap();
        store
            .insert_prices(vec![
                price("AAA", d(2020, 1, 1), d(2020, 1, 1), 10.0),
                price("AAA", d(2020, 1, 2), d(2020, 1, 2), 11.0),
                // Late-published correction: dated Jan 3, observable Jan 5.
                price("AAA", d(2020, 1, 3), d(2020, 1, 5), 12.0),
                price("BBB", d(2020, 1, 2), d(2020, 1, 2), 20.0),
            ])
            .unwrap();
        store
    }

    #[test]
    fn prices_filtered_by_availability() {
        let s = store();
        let range = DateRange::new(d(2020, 1, 1), d(2020, 1, 31)).unwrap();
        let syms = vec!["AAA".to_string()];

        let early = s.get_prices(&syms, range, d(2020, 1, 3), &snap()).unwrap();
        assert_eq!(early.len(), 2);
        assert!(early.iter().all(|p| p.available_at <= d(2020, 1, 3)));

        let late = s.get_prices(&syms, range, d(2020, 1, 5), &snap()).unwrap();
        assert_eq!(late.len(), 3);
    }

    #[test]
    fn prices_sorted_by_symbol_then_date() {
        let s = store();
        let range = DateRange::new(d(2020, 1, 1), d(2020, 1, 31)).unwrap();
        let syms = vec!["BBB".to_string(), "AAA".to_string(), "AAA".to_string()];
        let out = s.get_prices(&syms, range, d(2020, 2, 1), &snap()).unwrap();
        let keys: Vec<(&str, NaiveDate)> = out.iter().map(|p| (p.symbol.as_str(), p.date)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn universe_includes_delisted_when_requested() {
        let s = store();
        let all = s.get_security_universe(d(2020, 1, 10), true, &snap()).unwrap();
        assert_eq!(all.len(), 3);
        let active = s.get_security_universe(d(2020, 1, 10), false, &snap()).unwrap();
        let names: Vec<&str> = active.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(names, vec!["AAA", "CCC"]);
    }

    #[test]
    fn universe_excludes_not_yet_listed() {
        let s = store();
        let early = s.get_security_universe(d(2020, 1, 2), true, &snap()).unwrap();
        assert!(early.iter().all(|sec| sec.symbol != "CCC"));
    }

    #[test]
    fn fundamentals_respect_filing_lag() {
        let s = InMemoryProvider::default();
        s.insert_fundamentals(vec![FundamentalRecord {
            symbol: "AAA".into(),
            field: "eps".into(),
            period_end: d(2020, 3, 31),
            available_at: d(2020, 4, 20),
            value: 1.0,
        }])
        .unwrap();
        let syms = vec!["AAA".to_string()];
        assert!(s.get_fundamentals(&syms, d(2020, 5, 14), 45, &snap()).unwrap().is_empty());
        assert_eq!(s.get_fundamentals(&syms, d(2020, 5, 15), 45, &snap()).unwrap().len(), 1);
    }

    #[test]
    fn mutation_changes_manifest() {
        let s = store();
        let before = s.manifest(dataset::PRICES).unwrap();
        let untouched = s.manifest(dataset::SECURITIES).unwrap();
        s.insert_prices(vec![price("AAA", d(2020, 1, 6), d(2020, 1, 6), 13.0)])
            .unwrap();
        assert_ne!(before, s.manifest(dataset::PRICES).unwrap());
        assert_eq!(untouched, s.manifest(dataset::SECURITIES).unwrap());
    }

    #[test]
    fn identical_content_has_identical_manifest() {
        let a = store();
        let b = InMemoryProvider::from_dump("copy", a.dump()).unwrap();
        for ds in dataset::ALL {
            assert_eq!(a.manifest(ds).unwrap(), b.manifest(ds).unwrap());
        }
    }

    #[test]
    fn insane_price_rejected() {
        let s = InMemoryProvider::default();
        let mut bad = price("AAA", d(2020, 1, 2), d(2020, 1, 2), 10.0);
        bad.high = 5.0;
        assert!(s.insert_prices(vec![bad]).is_err());
    }

    #[test]
    fn trading_dates_are_distinct_and_sorted() {
        let s = store();
        assert_eq!(
            s.trading_dates(),
            vec![d(2020, 1, 1), d(2020, 1, 2), d(2020, 1, 3)]
        );
    }
}

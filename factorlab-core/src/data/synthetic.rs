//! Deterministic synthetic dataset generator.
//!
//! Produces a small equity universe with the features point-in-time research
//! has to cope with: staggered listings, mid-sample delistings, persistent
//! per-security drift (so trailing-return alphas carry real signal), and
//! quarterly fundamentals published some days after period end.
//! Identical configuration and seed always produce identical data.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::memory::{DatasetDump, InMemoryProvider};
use super::provider::DataError;
use crate::domain::{FundamentalRecord, PriceRecord, Security};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticUniverse {
    pub n_securities: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub seed: u64,
    /// Fraction of securities delisted somewhere in the second half of the sample.
    pub delist_fraction: f64,
    /// Fraction of securities listed after the sample start.
    pub late_listing_fraction: f64,
    /// Half-width of the uniform per-security daily drift.
    pub drift_dispersion: f64,
    /// Daily return volatility.
    pub volatility: f64,
    /// Days between a fiscal period end and the EPS publication.
    pub report_delay_days: u32,
}

impl Default for SyntheticUniverse {
    fn default() -> Self {
        Self {
            n_securities: 30,
            start: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default(),
            end: NaiveDate::from_ymd_opt(2021, 12, 31).unwrap_or_default(),
            seed: 42,
            delist_fraction: 0.2,
            late_listing_fraction: 0.2,
            drift_dispersion: 0.001,
            volatility: 0.015,
            report_delay_days: 30,
        }
    }
}

impl SyntheticUniverse {
    pub fn validate(&self) -> Result<(), DataError> {
        if self.n_securities == 0 {
            return Err(DataError::Validation("n_securities must be positive".into()));
        }
        if self.start > self.end {
            return Err(DataError::Validation(format!(
                "synthetic start {} is after end {}",
                self.start, self.end
            )));
        }
        for (name, value) in [
            ("delist_fraction", self.delist_fraction),
            ("late_listing_fraction", self.late_listing_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DataError::Validation(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.volatility < 0.0 || self.drift_dispersion < 0.0 {
            return Err(DataError::Validation(
                "volatility and drift_dispersion must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Generate the dataset into a fresh in-memory store.
    pub fn generate(&self) -> Result<InMemoryProvider, DataError> {
        let dump = self.generate_dump()?;
        InMemoryProvider::from_dump(format!("synthetic:{}", self.seed), dump)
    }

    pub fn generate_dump(&self) -> Result<DatasetDump, DataError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let days = weekdays(self.start, self.end);
        let n_days = days.len();
        let mut dump = DatasetDump::default();

        for i in 0..self.n_securities {
            let symbol = format!("S{i:03}");
            let drift = if self.drift_dispersion > 0.0 {
                rng.gen_range(-self.drift_dispersion..=self.drift_dispersion)
            } else {
                0.0
            };

            let listed_idx = if n_days > 3 && rng.gen_bool(self.late_listing_fraction) {
                rng.gen_range(1..n_days / 3 + 1)
            } else {
                0
            };
            let delisted_idx = if n_days > 4 && rng.gen_bool(self.delist_fraction) {
                let lo = (n_days / 2).max(listed_idx + 2);
                (lo < n_days).then(|| rng.gen_range(lo..n_days))
            } else {
                None
            };

            let listed = days.get(listed_idx).copied().unwrap_or(self.start);
            let delisted = delisted_idx.and_then(|k| days.get(k).copied());
            dump.securities.push(Security {
                symbol: symbol.clone(),
                listed,
                delisted,
            });

            let mut close: f64 = rng.gen_range(20.0..200.0);
            let last_idx = delisted_idx.unwrap_or(n_days);
            let mut closes = Vec::with_capacity(last_idx.saturating_sub(listed_idx));
            for &date in &days[listed_idx..last_idx] {
                let open = close;
                // Unit-variance uniform shock.
                let shock = rng.gen_range(-1.0..1.0) * 3.0_f64.sqrt();
                close = (open * (1.0 + drift + self.volatility * shock)).max(0.01);
                let high = open.max(close) * 1.005;
                let low = open.min(close) * 0.995;
                dump.prices.push(PriceRecord {
                    symbol: symbol.clone(),
                    date,
                    available_at: date,
                    open,
                    high,
                    low,
                    close,
                    volume: rng.gen_range(10_000..1_000_000),
                });
                closes.push((date, close));
            }

            // Earnings yield tilted toward the drift so value alphas carry signal.
            let earnings_yield = 0.05 + 20.0 * drift;
            for period_end in quarter_ends(self.start, self.end) {
                let Some(&(_, px)) = closes.iter().rev().find(|(d, _)| *d <= period_end) else {
                    continue;
                };
                if delisted.is_some_and(|d| d <= period_end) {
                    continue;
                }
                let available_at = period_end
                    .checked_add_days(Days::new(u64::from(self.report_delay_days)))
                    .unwrap_or(period_end);
                let noise = rng.gen_range(-0.005..0.005);
                dump.fundamentals.push(FundamentalRecord {
                    symbol: symbol.clone(),
                    field: "eps".into(),
                    period_end,
                    available_at,
                    value: px * (earnings_yield + noise) / 4.0,
                });
            }
        }

        Ok(dump)
    }
}

/// Monday-to-Friday dates in `[start, end]`.
pub fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

fn quarter_ends(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    for year in start.year()..=end.year() {
        for (m, d) in [(3, 31), (6, 30), (9, 30), (12, 31)] {
            if let Some(q) = NaiveDate::from_ymd_opt(year, m, d) {
                if q >= start && q <= end {
                    out.push(q);
                }
            }
        }
    }
    out
}

//! Point-in-time records: adjusted prices, fundamentals, and the security master.
//!
//! Every record carries an availability date distinct from its nominal date.
//! Availability is what point-in-time filtering compares against the simulated
//! date; the nominal date is only used for ordering and labelling.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Daily OHLCV record for one security.
///
/// Prices are backward-adjusted for splits and dividends by the data layer.
/// `available_at` is the first date on which the record could have been observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub available_at: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl PriceRecord {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic OHLC sanity check.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.close > 0.0
            && self.available_at >= self.date
    }
}

/// A single reported fundamental value (e.g. quarterly EPS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalRecord {
    pub symbol: String,
    pub field: String,
    pub period_end: NaiveDate,
    /// Publication date reported by the vendor.
    pub available_at: NaiveDate,
    pub value: f64,
}

impl FundamentalRecord {
    /// Earliest date the record may be used under a filing-lag rule.
    ///
    /// The later of the vendor's publication date and `period_end + filing_lag_days`.
    pub fn effective_available(&self, filing_lag_days: u32) -> NaiveDate {
        let lagged = self
            .period_end
            .checked_add_days(Days::new(u64::from(filing_lag_days)))
            .unwrap_or(NaiveDate::MAX);
        lagged.max(self.available_at)
    }

    pub fn is_available(&self, as_of: NaiveDate, filing_lag_days: u32) -> bool {
        self.effective_available(filing_lag_days) <= as_of
    }
}

/// Security master entry. Delisted securities stay in the master forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    pub symbol: String,
    pub listed: NaiveDate,
    /// First date on which the security no longer trades.
    pub delisted: Option<NaiveDate>,
}

impl Security {
    /// Tradable on `date`: listed on or before it and not yet delisted.
    pub fn is_listed_on(&self, date: NaiveDate) -> bool {
        self.listed <= date && self.delisted.map_or(true, |d| d > date)
    }

    /// Known to exist as of `date`, whether or not it has since been delisted.
    pub fn existed_by(&self, date: NaiveDate) -> bool {
        self.listed <= date
    }

    /// The master entry as it read on `date`: a later delisting is not yet known.
    pub fn as_of(&self, date: NaiveDate) -> Security {
        Security {
            symbol: self.symbol.clone(),
            listed: self.listed,
            delisted: self.delisted.filter(|d| *d <= date),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("invalid date range: start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of calendar days, both ends inclusive.
    pub fn calendar_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

//! Alpha contract — factories, scorers, and the point-in-time view.
//!
//! An `AlphaFactory` turns a parameter combination into a `Scorer`. A scorer
//! sees the market only through a [`PitView`], which cannot be constructed
//! with a record whose availability is after the simulated date. Scorers
//! therefore cannot read the future, whatever they compute.

pub mod builtin;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FundamentalRecord, PriceRecord, Security};

pub use builtin::{BuiltinAlpha, BuiltinAlphaFactory};

/// One parameter combination. `BTreeMap` keeps hashing and display deterministic.
pub type ParamSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlphaError {
    #[error("unknown alpha '{0}' (expected one of: momentum, reversal, earnings_yield)")]
    UnknownAlpha(String),

    #[error("invalid parameter {name}={value}: {reason}")]
    InvalidParam {
        name: String,
        value: f64,
        reason: String,
    },

    #[error("look-ahead: {kind} record for {symbol} available {available_at} used on {date}")]
    LookAhead {
        kind: &'static str,
        symbol: String,
        available_at: NaiveDate,
        date: NaiveDate,
    },

    #[error("scoring failed: {0}")]
    Scoring(String),
}

/// Deterministic short hash of a parameter set.
pub fn params_hash(params: &ParamSet) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, value) in params {
        hasher.update(name.as_bytes());
        hasher.update(&value.to_bits().to_le_bytes());
    }
    hasher.finalize().to_hex()[..16].to_string()
}

/// Render a parameter set as `a=1,b=2`.
pub fn format_params(params: &ParamSet) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Largest accepted integer parameter (about 400 years of trading days).
pub const MAX_INTEGER_PARAM: usize = 100_000;

/// Read an integer-valued parameter with a default and lower bound.
pub fn usize_param(params: &ParamSet, name: &str, default: usize, min: usize) -> Result<usize, AlphaError> {
    let Some(&value) = params.get(name) else {
        return Ok(default);
    };
    if !value.is_finite()
        || value.fract() != 0.0
        || value < min as f64
        || value > MAX_INTEGER_PARAM as f64
    {
        return Err(AlphaError::InvalidParam {
            name: name.to_string(),
            value,
            reason: format!("expected an integer in [{min}, {MAX_INTEGER_PARAM}]"),
        });
    }
    Ok(value as usize)
}

/// Ordered parameter axes; candidates are their cartesian product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid {
    axes: BTreeMap<String, Vec<f64>>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_axis(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.axes.insert(name.into(), values);
        self
    }

    pub fn axes(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.axes
    }

    /// Number of candidates. An empty grid has one (empty) candidate.
    pub fn len(&self) -> usize {
        self.axes.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All candidates in deterministic order (last axis varies fastest).
    pub fn candidates(&self) -> Vec<ParamSet> {
        let mut out = vec![ParamSet::new()];
        for (name, values) in &self.axes {
            let mut next = Vec::with_capacity(out.len() * values.len());
            for partial in &out {
                for &v in values {
                    let mut p = partial.clone();
                    p.insert(name.clone(), v);
                    next.push(p);
                }
            }
            out = next;
        }
        out
    }
}

/// One security's signal value on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub symbol: String,
    pub value: f64,
}

/// Everything a scorer may look at on a simulated date.
#[derive(Debug, Clone, Copy)]
pub struct PitView<'a> {
    date: NaiveDate,
    universe: &'a [Security],
    prices: &'a BTreeMap<String, Vec<PriceRecord>>,
    fundamentals: &'a BTreeMap<String, Vec<FundamentalRecord>>,
}

impl<'a> PitView<'a> {
    /// Build a view, rejecting any record not knowable on `date`.
    pub fn new(
        date: NaiveDate,
        universe: &'a [Security],
        prices: &'a BTreeMap<String, Vec<PriceRecord>>,
        fundamentals: &'a BTreeMap<String, Vec<FundamentalRecord>>,
        filing_lag_days: u32,
    ) -> Result<Self, AlphaError> {
        if let Some(sec) = universe.iter().find(|s| s.listed > date) {
            return Err(AlphaError::LookAhead {
                kind: "listing",
                symbol: sec.symbol.clone(),
                available_at: sec.listed,
                date,
            });
        }
        // Pass `Security::as_of(date)` entries: a future delisting is future data.
        for sec in universe {
            if let Some(delisted) = sec.delisted.filter(|d| *d > date) {
                return Err(AlphaError::LookAhead {
                    kind: "delisting",
                    symbol: sec.symbol.clone(),
                    available_at: delisted,
                    date,
                });
            }
        }
        for p in prices.values().flatten() {
            if p.available_at > date || p.date > date {
                return Err(AlphaError::LookAhead {
                    kind: "price",
                    symbol: p.symbol.clone(),
                    available_at: p.available_at.max(p.date),
                    date,
                });
            }
        }
        for f in fundamentals.values().flatten() {
            let available_at = f.effective_available(filing_lag_days);
            if available_at > date {
                return Err(AlphaError::LookAhead {
                    kind: "fundamental",
                    symbol: f.symbol.clone(),
                    available_at,
                    date,
                });
            }
        }
        Ok(Self {
            date,
            universe,
            prices,
            fundamentals,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn universe(&self) -> &'a [Security] {
        self.universe
    }

    /// Price history for `symbol`, oldest first.
    pub fn price_history(&self, symbol: &str) -> &'a [PriceRecord] {
        self.prices.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest_close(&self, symbol: &str) -> Option<f64> {
        self.price_history(symbol).last().map(|p| p.close)
    }

    pub fn fundamentals(&self, symbol: &str) -> &'a [FundamentalRecord] {
        self.fundamentals.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent period's record for `field`.
    pub fn latest_fundamental(&self, symbol: &str, field: &str) -> Option<&'a FundamentalRecord> {
        self.fundamentals(symbol)
            .iter()
            .filter(|f| f.field == field)
            .max_by_key(|f| f.period_end)
    }
}

/// Produces a cross-sectional signal from a point-in-time view.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    /// Calendar days of price history the scorer needs before the date.
    fn lookback_days(&self) -> u32;

    /// Whether the backtester should fetch fundamentals for this scorer.
    fn uses_fundamentals(&self) -> bool {
        false
    }

    /// Signal for (a subset of) the view's universe. Securities without a
    /// score are left out of the cross-section.
    fn score(&self, view: &PitView<'_>) -> Result<Vec<Score>, AlphaError>;
}

/// Builds scorers from parameter combinations.
pub trait AlphaFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, params: &ParamSet) -> Result<Box<dyn Scorer>, AlphaError>;
}

//! Built-in alphas.
//!
//! - `momentum`: trailing return over `lookback` trading days, ending `skip` days ago
//! - `reversal`: negated trailing return over `lookback` trading days
//! - `earnings_yield`: annualized latest EPS over latest close

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{usize_param, AlphaError, AlphaFactory, ParamSet, PitView, Score, Scorer};

/// Calendar days covering `trading_days` sessions with some slack for holidays.
fn calendar_span(trading_days: usize) -> u32 {
    (u32::try_from(trading_days).unwrap_or(u32::MAX).saturating_mul(7) / 5).saturating_add(10)
}

fn trailing_return(view: &PitView<'_>, symbol: &str, lookback: usize, skip: usize) -> Option<f64> {
    let history = view.price_history(symbol);
    let n = history.len();
    if n < lookback.saturating_add(skip).saturating_add(1) {
        return None;
    }
    let end = history[n - 1 - skip].close;
    let start = history[n - 1 - skip - lookback].close;
    let r = end / start - 1.0;
    r.is_finite().then_some(r)
}

#[derive(Debug, Clone)]
pub struct Momentum {
    pub lookback: usize,
    pub skip: usize,
}

impl Scorer for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn lookback_days(&self) -> u32 {
        calendar_span(self.lookback.saturating_add(self.skip).saturating_add(1))
    }

    fn score(&self, view: &PitView<'_>) -> Result<Vec<Score>, AlphaError> {
        Ok(view
            .universe()
            .iter()
            .filter_map(|sec| {
                trailing_return(view, &sec.symbol, self.lookback, self.skip).map(|value| Score {
                    symbol: sec.symbol.clone(),
                    value,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct Reversal {
    pub lookback: usize,
}

impl Scorer for Reversal {
    fn name(&self) -> &str {
        "reversal"
    }

    fn lookback_days(&self) -> u32 {
        calendar_span(self.lookback.saturating_add(1))
    }

    fn score(&self, view: &PitView<'_>) -> Result<Vec<Score>, AlphaError> {
        Ok(view
            .universe()
            .iter()
            .filter_map(|sec| {
                trailing_return(view, &sec.symbol, self.lookback, 0).map(|r| Score {
                    symbol: sec.symbol.clone(),
                    value: -r,
                })
            })
            .collect())
    }
}

/// Four times the latest quarterly EPS divided by the latest close.
#[derive(Debug, Clone)]
pub struct EarningsYield {
    pub field: String,
}

impl Scorer for EarningsYield {
    fn name(&self) -> &str {
        "earnings_yield"
    }

    fn lookback_days(&self) -> u32 {
        10
    }

    fn uses_fundamentals(&self) -> bool {
        true
    }

    fn score(&self, view: &PitView<'_>) -> Result<Vec<Score>, AlphaError> {
        let mut out = Vec::new();
        for sec in view.universe() {
            let (Some(close), Some(eps)) = (
                view.latest_close(&sec.symbol),
                view.latest_fundamental(&sec.symbol, &self.field),
            ) else {
                continue;
            };
            let value = 4.0 * eps.value / close;
            if value.is_finite() {
                out.push(Score {
                    symbol: sec.symbol.clone(),
                    value,
                });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinAlpha {
    Momentum,
    Reversal,
    EarningsYield,
}

impl BuiltinAlpha {
    pub fn name(self) -> &'static str {
        match self {
            Self::Momentum => "momentum",
            Self::Reversal => "reversal",
            Self::EarningsYield => "earnings_yield",
        }
    }
}

impl FromStr for BuiltinAlpha {
    type Err = AlphaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "momentum" => Ok(Self::Momentum),
            "reversal" => Ok(Self::Reversal),
            "earnings_yield" | "ey" => Ok(Self::EarningsYield),
            other => Err(AlphaError::UnknownAlpha(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinAlphaFactory {
    kind: BuiltinAlpha,
}

impl BuiltinAlphaFactory {
    pub fn new(kind: BuiltinAlpha) -> Self {
        Self { kind }
    }

    pub fn from_name(name: &str) -> Result<Self, AlphaError> {
        Ok(Self::new(name.parse()?))
    }
}

impl AlphaFactory for BuiltinAlphaFactory {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn build(&self, params: &ParamSet) -> Result<Box<dyn Scorer>, AlphaError> {
        match self.kind {
            BuiltinAlpha::Momentum => Ok(Box::new(Momentum {
                lookback: usize_param(params, "lookback", 60, 1)?,
                skip: usize_param(params, "skip", 0, 0)?,
            })),
            BuiltinAlpha::Reversal => Ok(Box::new(Reversal {
                lookback: usize_param(params, "lookback", 5, 1)?,
            })),
            BuiltinAlpha::EarningsYield => Ok(Box::new(EarningsYield {
                field: "eps".to_string(),
            })),
        }
    }
}

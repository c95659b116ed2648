//! PIT Backtester — one alpha configuration over one date range.
//!
//! For each trading date in the range the backtester:
//! 1. filters the survivorship-free security master down to securities listed on that date,
//! 2. fetches price history and fundamentals with `as_of` = the date, under the run's snapshot,
//! 3. hands the scorer a `PitView` (which rejects anything not yet available),
//! 4. correlates the signal with the realized forward return (the IC), and
//! 5. books a dollar-neutral portfolio return from signal-implied weights.
//!
//! Realized forward returns come from a separate label panel that scorers never see.
//! Dates whose cross-section is empty or degenerate record a missing IC and a flat
//! portfolio; they never abort the run.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use factorlab_core::alpha::{params_hash, AlphaError, ParamSet, PitView, Score, Scorer};
use factorlab_core::data::{DataError, DataProvider};
use factorlab_core::domain::{DateRange, FundamentalRecord, PriceRecord, Security, SnapshotId};

use crate::metrics::{self, ComputationIssue, IcMethod};

/// Current artifact schema version. Bump on breaking changes to serialized results.
pub const SCHEMA_VERSION: u32 = 1;

/// Availability rule applied to fundamentals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityRule {
    /// Minimum days between a fiscal period end and first use of its figures.
    pub filing_lag_days: u32,
}

impl Default for AvailabilityRule {
    fn default() -> Self {
        Self { filing_lag_days: 45 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub ic_method: IcMethod,
    /// Forward-return horizon in trading days.
    pub label_horizon_days: usize,
    /// Dates with fewer labelled scores than this record a missing IC.
    pub min_cross_section: usize,
    pub availability: AvailabilityRule,
    pub periods_per_year: f64,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            ic_method: IcMethod::Rank,
            label_horizon_days: 1,
            min_cross_section: 5,
            availability: AvailabilityRule::default(),
            periods_per_year: 252.0,
        }
    }
}

impl BacktestSettings {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.label_horizon_days == 0 {
            return Err(BacktestError::InvalidSettings(
                "label_horizon_days must be at least 1".into(),
            ));
        }
        if self.min_cross_section < 2 {
            return Err(BacktestError::InvalidSettings(
                "min_cross_section must be at least 2".into(),
            ));
        }
        if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
            return Err(BacktestError::InvalidSettings(
                "periods_per_year must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One simulated date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    /// `None` when the cross-section was empty or degenerate.
    pub ic: Option<f64>,
    pub portfolio_return: f64,
    /// Scored securities with a forward-return label.
    pub cross_section: usize,
    pub issue: Option<ComputationIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub n_days: usize,
    pub n_valid_ic: usize,
    /// NaN when no date has a valid IC.
    #[serde(with = "crate::serde_nan")]
    pub mean_ic: f64,
    #[serde(with = "crate::serde_nan")]
    pub ic_std: f64,
    /// Mean IC over population IC std; NaN with fewer than two valid dates.
    #[serde(with = "crate::serde_nan")]
    pub icir: f64,
    /// Fraction of dates with a valid IC.
    pub ic_coverage: f64,
    #[serde(with = "crate::serde_nan")]
    pub sharpe: f64,
    #[serde(with = "crate::serde_nan")]
    pub max_drawdown: f64,
    #[serde(with = "crate::serde_nan")]
    pub total_return: f64,
}

impl BacktestSummary {
    pub fn from_daily(daily: &[DailyRecord], periods_per_year: f64) -> Self {
        let ics: Vec<f64> = daily.iter().filter_map(|d| d.ic).collect();
        let returns: Vec<f64> = daily.iter().map(|d| d.portfolio_return).collect();
        let (mean_ic, ic_std) = if ics.is_empty() {
            (f64::NAN, f64::NAN)
        } else {
            (metrics::mean(&ics), metrics::population_std(&ics))
        };
        let icir = if ics.len() >= 2 && ic_std > 1e-15 {
            mean_ic / ic_std
        } else {
            f64::NAN
        };
        Self {
            n_days: daily.len(),
            n_valid_ic: ics.len(),
            mean_ic,
            ic_std,
            icir,
            ic_coverage: if daily.is_empty() {
                0.0
            } else {
                ics.len() as f64 / daily.len() as f64
            },
            sharpe: metrics::sharpe_ratio(&returns, periods_per_year),
            max_drawdown: metrics::max_drawdown(&returns),
            total_return: metrics::total_return(&returns),
        }
    }
}

/// Output of one backtest. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub schema_version: u32,
    pub alpha: String,
    pub params: ParamSet,
    pub params_hash: String,
    pub range: DateRange,
    pub snapshot_id: SnapshotId,
    pub daily: Vec<DailyRecord>,
    pub summary: BacktestSummary,
}

impl BacktestResult {
    /// Daily portfolio returns in date order.
    pub fn returns(&self) -> Vec<f64> {
        self.daily.iter().map(|d| d.portfolio_return).collect()
    }

    /// Defined ICs in date order; missing dates are skipped.
    pub fn valid_ics(&self) -> Vec<f64> {
        self.daily.iter().filter_map(|d| d.ic).collect()
    }

    pub fn mean_ic(&self) -> f64 {
        self.summary.mean_ic
    }
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("data access failed: {0}")]
    Data(#[from] DataError),

    #[error("alpha failed: {0}")]
    Alpha(#[from] AlphaError),

    #[error("invalid backtest settings: {0}")]
    InvalidSettings(String),
}

impl BacktestError {
    pub fn is_manifest_changed(&self) -> bool {
        matches!(self, Self::Data(e) if e.is_manifest_changed())
    }
}

/// Closes by symbol over the range plus the label horizon, on a shared calendar.
struct LabelPanel {
    calendar: Vec<NaiveDate>,
    closes: BTreeMap<String, Vec<(NaiveDate, f64)>>,
}

impl LabelPanel {
    fn new(records: Vec<PriceRecord>) -> Self {
        let mut calendar: Vec<NaiveDate> = records.iter().map(|p| p.date).collect();
        calendar.sort_unstable();
        calendar.dedup();
        let mut closes: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for p in records {
            closes.entry(p.symbol).or_default().push((p.date, p.close));
        }
        for series in closes.values_mut() {
            series.sort_by_key(|(d, _)| *d);
        }
        Self { calendar, closes }
    }

    /// Return from the close on `calendar[day]` to the close `horizon` trading days later.
    ///
    /// A security that stops trading before the label date (delisting) realizes its
    /// return up to its last available close.
    fn forward_return(&self, security: &Security, day: usize, horizon: usize) -> Option<f64> {
        let date = *self.calendar.get(day)?;
        let target = *self.calendar.get(day + horizon)?;
        let series = self.closes.get(&security.symbol)?;
        let pos = series.binary_search_by_key(&date, |(d, _)| *d).ok()?;
        let last = series.partition_point(|(d, _)| *d <= target).checked_sub(1)?;
        let entry = series[pos].1;
        if last == pos {
            // No later close: only a delisting realizes a (flat) return here.
            return security.delisted.filter(|d| *d <= target).map(|_| 0.0);
        }
        let r = series[last].1 / entry - 1.0;
        r.is_finite().then_some(r)
    }
}

fn group_prices(records: Vec<PriceRecord>) -> BTreeMap<String, Vec<PriceRecord>> {
    let mut out: BTreeMap<String, Vec<PriceRecord>> = BTreeMap::new();
    for p in records {
        out.entry(p.symbol.clone()).or_default().push(p);
    }
    out
}

fn group_fundamentals(records: Vec<FundamentalRecord>) -> BTreeMap<String, Vec<FundamentalRecord>> {
    let mut out: BTreeMap<String, Vec<FundamentalRecord>> = BTreeMap::new();
    for f in records {
        out.entry(f.symbol.clone()).or_default().push(f);
    }
    out
}

/// Dollar-neutral weights proportional to demeaned scores, gross exposure 1.
pub fn signal_weights(scores: &[f64]) -> Option<Vec<f64>> {
    let m = metrics::mean(scores);
    let gross: f64 = scores.iter().map(|s| (s - m).abs()).sum();
    if gross.is_nan() || gross <= 1e-15 {
        return None;
    }
    Some(scores.iter().map(|s| (s - m) / gross).collect())
}

pub struct PitBacktester<'a> {
    provider: &'a dyn DataProvider,
    settings: &'a BacktestSettings,
    label_cutoff: Option<NaiveDate>,
}

impl<'a> PitBacktester<'a> {
    pub fn new(provider: &'a dyn DataProvider, settings: &'a BacktestSettings) -> Self {
        Self {
            provider,
            settings,
            label_cutoff: None,
        }
    }

    /// Only realize forward returns from closes on or before `cutoff`.
    ///
    /// Dates whose label would land after the cutoff record `MissingLabels`.
    /// A cutoff before the range end is raised to the range end.
    pub fn with_label_cutoff(mut self, cutoff: NaiveDate) -> Self {
        self.label_cutoff = Some(cutoff);
        self
    }

    pub fn run(
        &self,
        scorer: &dyn Scorer,
        params: &ParamSet,
        range: DateRange,
        snapshot: &SnapshotId,
    ) -> Result<BacktestResult, BacktestError> {
        self.settings.validate()?;
        let lag = self.settings.availability.filing_lag_days;
        let horizon = self.settings.label_horizon_days;

        // Survivorship-free master: everything that existed by the range end.
        let master = self
            .provider
            .get_security_universe(range.end, true, snapshot)?;
        let all_symbols: Vec<String> = master.iter().map(|s| s.symbol.clone()).collect();

        let mut label_end = range
            .end
            .checked_add_days(Days::new(horizon as u64 * 7 / 5 + 10))
            .unwrap_or(range.end);
        if let Some(cutoff) = self.label_cutoff {
            label_end = label_end.min(cutoff.max(range.end));
        }
        let labels = LabelPanel::new(self.provider.get_prices(
            &all_symbols,
            DateRange {
                start: range.start,
                end: label_end,
            },
            label_end,
            snapshot,
        )?);

        let mut daily = Vec::new();
        for (day, &date) in labels.calendar.iter().enumerate() {
            if !range.contains(date) {
                continue;
            }
            let universe: Vec<Security> = master
                .iter()
                .filter(|s| s.is_listed_on(date))
                .cloned()
                .collect();
            let record = self.simulate_date(scorer, &universe, &labels, day, date, snapshot, lag)?;
            if let Some(issue) = &record.issue {
                debug!(%date, %issue, "no IC for date");
            }
            daily.push(record);
        }

        let summary = BacktestSummary::from_daily(&daily, self.settings.periods_per_year);
        info!(
            alpha = scorer.name(),
            params = %factorlab_core::alpha::format_params(params),
            start = %range.start,
            end = %range.end,
            days = summary.n_days,
            valid_ic = summary.n_valid_ic,
            mean_ic = summary.mean_ic,
            "backtest complete"
        );

        Ok(BacktestResult {
            schema_version: SCHEMA_VERSION,
            alpha: scorer.name().to_string(),
            params: params.clone(),
            params_hash: params_hash(params),
            range,
            snapshot_id: snapshot.clone(),
            daily,
            summary,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn simulate_date(
        &self,
        scorer: &dyn Scorer,
        universe: &[Security],
        labels: &LabelPanel,
        day: usize,
        date: NaiveDate,
        snapshot: &SnapshotId,
        filing_lag_days: u32,
    ) -> Result<DailyRecord, BacktestError> {
        let flat = |issue: ComputationIssue, cross_section: usize| DailyRecord {
            date,
            ic: None,
            portfolio_return: 0.0,
            cross_section,
            issue: Some(issue),
        };
        if universe.is_empty() {
            return Ok(flat(ComputationIssue::EmptyCrossSection, 0));
        }

        let symbols: Vec<String> = universe.iter().map(|s| s.symbol.clone()).collect();
        let history_start = date
            .checked_sub_days(Days::new(u64::from(scorer.lookback_days())))
            .unwrap_or(NaiveDate::MIN);
        let prices = group_prices(self.provider.get_prices(
            &symbols,
            DateRange {
                start: history_start,
                end: date,
            },
            date,
            snapshot,
        )?);
        let fundamentals = if scorer.uses_fundamentals() {
            group_fundamentals(
                self.provider
                    .get_fundamentals(&symbols, date, filing_lag_days, snapshot)?,
            )
        } else {
            BTreeMap::new()
        };

        // Labels need the real delisting dates; the scorer only sees what was known.
        let known: Vec<Security> = universe.iter().map(|s| s.as_of(date)).collect();
        let view = PitView::new(date, &known, &prices, &fundamentals, filing_lag_days)?;
        let scores: Vec<Score> = match scorer.score(&view) {
            Ok(scores) => scores.into_iter().filter(|s| s.value.is_finite()).collect(),
            Err(e) => return Ok(flat(ComputationIssue::Scorer(e.to_string()), 0)),
        };
        if scores.is_empty() {
            return Ok(flat(ComputationIssue::EmptyCrossSection, 0));
        }

        let mut signal = Vec::with_capacity(scores.len());
        let mut forward = Vec::with_capacity(scores.len());
        for score in &scores {
            let Some(sec) = universe.iter().find(|s| s.symbol == score.symbol) else {
                continue;
            };
            if let Some(r) = labels.forward_return(sec, day, self.settings.label_horizon_days) {
                signal.push(score.value);
                forward.push(r);
            }
        }

        let n = signal.len();
        if n == 0 {
            return Ok(flat(ComputationIssue::MissingLabels, 0));
        }
        if n < self.settings.min_cross_section {
            return Ok(flat(
                ComputationIssue::InsufficientCrossSection {
                    got: n,
                    min: self.settings.min_cross_section,
                },
                n,
            ));
        }
        let ic = match metrics::information_coefficient(&signal, &forward, self.settings.ic_method) {
            Ok(ic) => ic,
            Err(issue) => return Ok(flat(issue, n)),
        };
        let Some(weights) = signal_weights(&signal) else {
            return Ok(flat(ComputationIssue::DegenerateSignal, n));
        };
        let portfolio_return = weights.iter().zip(&forward).map(|(w, r)| w * r).sum();

        Ok(DailyRecord {
            date,
            ic: Some(ic),
            portfolio_return,
            cross_section: n,
            issue: None,
        })
    }
}

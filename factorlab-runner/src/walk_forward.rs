//! Walk-Forward Optimizer — rolling train/test evaluation over calendar time.
//!
//! Windows are laid out by calendar months from the run start: window `k` trains on
//! `[start + k*step, start + k*step + train)` and tests on the `test` months that
//! follow. `step >= test` keeps the test windows pairwise disjoint; `step < train`
//! lets train windows overlap, which is allowed but logged as an advisory.
//!
//! For each window every parameter candidate is backtested on the train segment,
//! the candidate with the highest train IC is selected, and only that candidate is
//! backtested on the test segment. Train labels are cut off at the train end, so
//! the last `label_horizon_days` train dates carry no IC rather than returns
//! realized inside the test segment. All backtests of one run share a single locked
//! snapshot; aggregation happens only after every window has finished and the
//! snapshot still verifies.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Days, Months, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use factorlab_core::alpha::{
    format_params, params_hash, AlphaError, AlphaFactory, ParamGrid, ParamSet, Scorer,
};
use factorlab_core::data::{DataError, DataProvider, VersionCheckedProvider};
use factorlab_core::domain::{DateRange, SnapshotId};
use factorlab_core::snapshot::SnapshotManager;

use crate::backtest::{BacktestError, BacktestResult, BacktestSettings, PitBacktester, SCHEMA_VERSION};
use crate::metrics;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub train_months: u32,
    pub test_months: u32,
    pub step_months: u32,
    /// Minimum calendar days in a train span; shorter windows are skipped.
    pub min_train_samples: u32,
    /// `is_overfit` is set when the overfitting ratio strictly exceeds this.
    pub overfitting_threshold: f64,
    /// Worker threads for window and candidate evaluation (0 = one per core).
    pub max_workers: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_months: 12,
            test_months: 3,
            step_months: 3,
            min_train_samples: 180,
            overfitting_threshold: 2.0,
            max_workers: 0,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), WalkForwardError> {
        if self.train_months == 0 || self.test_months == 0 || self.step_months == 0 {
            return Err(WalkForwardError::Configuration(format!(
                "train_months ({}), test_months ({}) and step_months ({}) must all be positive",
                self.train_months, self.test_months, self.step_months
            )));
        }
        if self.step_months < self.test_months {
            return Err(WalkForwardError::Configuration(format!(
                "step_months ({}) < test_months ({}) would overlap test windows",
                self.step_months, self.test_months
            )));
        }
        if !self.overfitting_threshold.is_finite() || self.overfitting_threshold < 0.0 {
            return Err(WalkForwardError::Configuration(format!(
                "overfitting_threshold must be a non-negative number, got {}",
                self.overfitting_threshold
            )));
        }
        Ok(())
    }
}

// ─── Windows ─────────────────────────────────────────────────────────

/// One train/test split. Both segments are inclusive calendar ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub index: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

impl Window {
    pub fn train_range(&self) -> DateRange {
        DateRange {
            start: self.train_start,
            end: self.train_end,
        }
    }

    pub fn test_range(&self) -> DateRange {
        DateRange {
            start: self.test_start,
            end: self.test_end,
        }
    }

    pub fn train_calendar_days(&self) -> i64 {
        self.train_range().calendar_days()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Train span shorter than `min_train_samples` calendar days.
    InsufficientData { train_days: i64, min_train_samples: u32 },
    /// No candidate produced a defined train IC.
    NoViableCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedWindow {
    pub window: Window,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Deterministic window schedule for a date span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPlan {
    pub windows: Vec<Window>,
    pub skipped: Vec<SkippedWindow>,
    /// Non-fatal notes about the schedule (e.g. overlapping train windows).
    pub advisories: Vec<String>,
}

/// Enumerate windows by calendar time, stopping before any window whose test
/// segment would end after `end`.
pub fn generate_windows(
    start: NaiveDate,
    end: NaiveDate,
    config: &WalkForwardConfig,
) -> Result<WindowPlan, WalkForwardError> {
    config.validate()?;
    if start > end {
        return Err(WalkForwardError::Configuration(format!(
            "start {start} is after end {end}"
        )));
    }

    let mut advisories = Vec::new();
    if config.step_months < config.train_months {
        let note = format!(
            "step_months ({}) < train_months ({}): train windows overlap, test windows stay disjoint",
            config.step_months, config.train_months
        );
        warn!(
            step_months = config.step_months,
            train_months = config.train_months,
            "train windows overlap; test windows stay disjoint"
        );
        advisories.push(note);
    }

    // Every boundary is computed from `start` so month-end clamping never drifts.
    let offset = |months: u32| start.checked_add_months(Months::new(months));
    let day_before = |d: NaiveDate| d.checked_sub_days(Days::new(1));

    let mut windows = Vec::new();
    let mut skipped = Vec::new();
    for k in 0u32.. {
        // Month counts past u32 are past any representable date too.
        let Some(shift) = k.checked_mul(config.step_months) else {
            break;
        };
        let Some(train_stop) = shift.checked_add(config.train_months) else {
            break;
        };
        let Some(test_months_end) = train_stop.checked_add(config.test_months) else {
            break;
        };
        let (Some(train_start), Some(test_start), Some(test_stop)) =
            (offset(shift), offset(train_stop), offset(test_months_end))
        else {
            break;
        };
        let (Some(train_end), Some(test_end)) = (day_before(test_start), day_before(test_stop))
        else {
            break;
        };
        if test_end > end {
            break;
        }

        let window = Window {
            index: k as usize,
            train_start,
            train_end,
            test_start,
            test_end,
        };
        let train_days = window.train_calendar_days();
        if train_days < i64::from(config.min_train_samples) {
            warn!(
                window = window.index,
                train_days,
                min_train_samples = config.min_train_samples,
                "skipping window: train span too short"
            );
            skipped.push(SkippedWindow {
                window,
                reason: SkipReason::InsufficientData {
                    train_days,
                    min_train_samples: config.min_train_samples,
                },
            });
        } else {
            windows.push(window);
        }
    }

    Ok(WindowPlan {
        windows,
        skipped,
        advisories,
    })
}

// ─── Result types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: ParamSet,
    #[serde(with = "crate::serde_nan")]
    pub train_ic: f64,
}

/// Outcome of one evaluated window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub window: Window,
    pub selected_params: ParamSet,
    pub params_hash: String,
    /// Train IC of every candidate, in grid order.
    pub candidates: Vec<CandidateScore>,
    #[serde(with = "crate::serde_nan")]
    pub train_ic: f64,
    /// NaN when the test segment had no valid IC date.
    #[serde(with = "crate::serde_nan")]
    pub test_ic: f64,
    pub train: BacktestResult,
    pub test: BacktestResult,
}

/// Out-of-sample aggregates over windows with a defined test IC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub n_valid_windows: usize,
    #[serde(with = "crate::serde_nan")]
    pub mean_train_ic: f64,
    #[serde(with = "crate::serde_nan")]
    pub aggregated_test_ic: f64,
    #[serde(with = "crate::serde_nan")]
    pub aggregated_test_icir: f64,
    #[serde(with = "crate::serde_nan")]
    pub overfitting_ratio: f64,
    pub is_overfit: bool,
}

/// Aggregate `(train_ic, test_ic)` pairs.
///
/// Pairs with an undefined test IC are excluded from every statistic. ICIR uses the
/// population standard deviation and is NaN with fewer than two valid windows.
pub fn aggregate(pairs: &[(f64, f64)], overfitting_threshold: f64) -> Aggregate {
    let valid: Vec<(f64, f64)> = pairs
        .iter()
        .copied()
        .filter(|(_, test)| test.is_finite())
        .collect();
    if valid.is_empty() {
        return Aggregate {
            n_valid_windows: 0,
            mean_train_ic: f64::NAN,
            aggregated_test_ic: f64::NAN,
            aggregated_test_icir: f64::NAN,
            overfitting_ratio: f64::NAN,
            is_overfit: false,
        };
    }

    let train: Vec<f64> = valid.iter().map(|(t, _)| *t).collect();
    let test: Vec<f64> = valid.iter().map(|(_, t)| *t).collect();
    let mean_train_ic = metrics::mean(&train);
    let aggregated_test_ic = metrics::mean(&test);
    let std = metrics::population_std(&test);
    let aggregated_test_icir = if test.len() >= 2 && std > 1e-15 {
        aggregated_test_ic / std
    } else {
        f64::NAN
    };
    let overfitting_ratio = mean_train_ic.abs() / aggregated_test_ic.abs();

    Aggregate {
        n_valid_windows: valid.len(),
        mean_train_ic,
        aggregated_test_ic,
        aggregated_test_icir,
        overfitting_ratio,
        // Strict: a ratio equal to the threshold is not flagged. NaN never is.
        is_overfit: overfitting_ratio > overfitting_threshold,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// How much the selected parameters move between windows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterStability {
    pub distinct_selections: usize,
    /// Fraction of consecutive windows whose selection changed.
    pub switch_rate: f64,
    pub per_param: BTreeMap<String, ParamSummary>,
}

impl ParameterStability {
    pub fn from_selections(selections: &[ParamSet]) -> Self {
        let mut distinct: Vec<String> = selections.iter().map(params_hash).collect();
        distinct.sort();
        distinct.dedup();

        let switches = selections.windows(2).filter(|w| w[0] != w[1]).count();
        let switch_rate = if selections.len() < 2 {
            0.0
        } else {
            switches as f64 / (selections.len() - 1) as f64
        };

        let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for p in selections {
            for (name, v) in p {
                values.entry(name.clone()).or_default().push(*v);
            }
        }
        let per_param = values
            .into_iter()
            .map(|(name, vs)| {
                let summary = ParamSummary {
                    mean: metrics::mean(&vs),
                    std: metrics::population_std(&vs),
                    min: vs.iter().copied().fold(f64::INFINITY, f64::min),
                    max: vs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                (name, summary)
            })
            .collect();

        Self {
            distinct_selections: distinct.len(),
            switch_rate,
            per_param,
        }
    }
}

/// Complete result of a walk-forward run. Produced only after all windows finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub schema_version: u32,
    pub alpha: String,
    pub snapshot_id: SnapshotId,
    pub config: WalkForwardConfig,
    pub windows: Vec<WindowResult>,
    pub skipped: Vec<SkippedWindow>,
    pub advisories: Vec<String>,
    #[serde(flatten)]
    pub aggregate: Aggregate,
    pub stability: ParameterStability,
}

impl WalkForwardResult {
    pub fn aggregated_test_ic(&self) -> f64 {
        self.aggregate.aggregated_test_ic
    }

    pub fn aggregated_test_icir(&self) -> f64 {
        self.aggregate.aggregated_test_icir
    }

    pub fn overfitting_ratio(&self) -> f64 {
        self.aggregate.overfitting_ratio
    }

    pub fn is_overfit(&self) -> bool {
        self.aggregate.is_overfit
    }
}

/// Errors from walk-forward optimization.
#[derive(Debug, Error)]
pub enum WalkForwardError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("parameter grid has no candidates")]
    EmptyParamGrid,

    #[error("no evaluable windows between {start} and {end}")]
    NoWindows { start: NaiveDate, end: NaiveDate },

    #[error("data access failed: {0}")]
    Data(#[from] DataError),

    #[error("alpha construction failed: {0}")]
    Alpha(#[from] AlphaError),

    #[error("backtest error on window {window}: {source}")]
    Backtest {
        window: usize,
        #[source]
        source: BacktestError,
    },

    #[error("walk-forward run cancelled")]
    Cancelled,

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

impl WalkForwardError {
    /// The run saw data change under its snapshot and must restart under a fresh lock.
    pub fn manifest_changed(&self) -> bool {
        match self {
            Self::Data(e) => e.is_manifest_changed(),
            Self::Backtest { source, .. } => source.is_manifest_changed(),
            _ => false,
        }
    }
}

// ─── Optimizer ───────────────────────────────────────────────────────

/// Releases the run's snapshot however the run ends.
struct SnapshotLease<'a> {
    manager: &'a SnapshotManager,
    id: SnapshotId,
}

impl Drop for SnapshotLease<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}

enum WindowOutcome {
    Evaluated(WindowResult),
    Skipped(SkippedWindow),
}

pub struct WalkForwardOptimizer {
    provider: Arc<dyn DataProvider>,
    snapshots: Arc<SnapshotManager>,
    config: WalkForwardConfig,
    settings: BacktestSettings,
}

impl WalkForwardOptimizer {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        snapshots: Arc<SnapshotManager>,
        config: WalkForwardConfig,
        settings: BacktestSettings,
    ) -> Self {
        Self {
            provider,
            snapshots,
            config,
            settings,
        }
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    pub fn run(
        &self,
        factory: &dyn AlphaFactory,
        grid: &ParamGrid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<WalkForwardResult, WalkForwardError> {
        self.run_with_cancel(factory, grid, start, end, None)
    }

    /// Like [`run`](Self::run), checking `cancel` before each window. A cancelled
    /// run discards every completed window and returns `Cancelled`.
    pub fn run_with_cancel(
        &self,
        factory: &dyn AlphaFactory,
        grid: &ParamGrid,
        start: NaiveDate,
        end: NaiveDate,
        cancel: Option<&AtomicBool>,
    ) -> Result<WalkForwardResult, WalkForwardError> {
        let plan = generate_windows(start, end, &self.config)?;
        self.settings
            .validate()
            .map_err(|source| WalkForwardError::Configuration(source.to_string()))?;
        let candidates = grid.candidates();
        if candidates.is_empty() {
            return Err(WalkForwardError::EmptyParamGrid);
        }
        if plan.windows.is_empty() {
            return Err(WalkForwardError::NoWindows { start, end });
        }
        let scorers = candidates
            .into_iter()
            .map(|p| factory.build(&p).map(|s| (p, s)))
            .collect::<Result<Vec<_>, _>>()?;

        let lease = SnapshotLease {
            manager: &self.snapshots,
            id: self.snapshots.lock()?,
        };
        info!(
            alpha = factory.name(),
            snapshot = lease.id.short(),
            windows = plan.windows.len(),
            skipped = plan.skipped.len(),
            candidates = scorers.len(),
            "walk-forward run started"
        );

        let guarded = VersionCheckedProvider::new(self.provider.clone(), self.snapshots.clone());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .build()
            .map_err(|e| WalkForwardError::Pool(e.to_string()))?;

        let outcomes: Vec<Result<WindowOutcome, WalkForwardError>> = pool.install(|| {
            plan.windows
                .par_iter()
                .map(|window| {
                    if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                        return Err(WalkForwardError::Cancelled);
                    }
                    self.evaluate_window(&guarded, window, &scorers, &lease.id)
                })
                .collect()
        });

        if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
            info!(snapshot = lease.id.short(), "walk-forward run cancelled");
            return Err(WalkForwardError::Cancelled);
        }

        let mut windows = Vec::new();
        let mut skipped = plan.skipped;
        let mut failure: Option<WalkForwardError> = None;
        for outcome in outcomes {
            match outcome {
                Ok(WindowOutcome::Evaluated(w)) => windows.push(w),
                Ok(WindowOutcome::Skipped(s)) => skipped.push(s),
                // A manifest change outranks every other failure: the caller must restart.
                Err(e) => {
                    let replace = failure
                        .as_ref()
                        .map_or(true, |prev| e.manifest_changed() && !prev.manifest_changed());
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        skipped.sort_by_key(|s| s.window.index);

        // No aggregate from data that changed while we were reading it.
        self.snapshots.verify(&lease.id)?;

        let pairs: Vec<(f64, f64)> = windows.iter().map(|w| (w.train_ic, w.test_ic)).collect();
        let aggregate = aggregate(&pairs, self.config.overfitting_threshold);
        let selections: Vec<ParamSet> = windows.iter().map(|w| w.selected_params.clone()).collect();
        let stability = ParameterStability::from_selections(&selections);

        info!(
            alpha = factory.name(),
            evaluated = windows.len(),
            skipped = skipped.len(),
            aggregated_test_ic = aggregate.aggregated_test_ic,
            aggregated_test_icir = aggregate.aggregated_test_icir,
            overfitting_ratio = aggregate.overfitting_ratio,
            is_overfit = aggregate.is_overfit,
            "walk-forward run complete"
        );

        Ok(WalkForwardResult {
            schema_version: SCHEMA_VERSION,
            alpha: factory.name().to_string(),
            snapshot_id: lease.id.clone(),
            config: self.config.clone(),
            windows,
            skipped,
            advisories: plan.advisories,
            aggregate,
            stability,
        })
    }

    fn evaluate_window(
        &self,
        provider: &VersionCheckedProvider,
        window: &Window,
        scorers: &[(ParamSet, Box<dyn Scorer>)],
        snapshot: &SnapshotId,
    ) -> Result<WindowOutcome, WalkForwardError> {
        let backtester = PitBacktester::new(provider, &self.settings);
        // Train labels stop at train_end so selection never sees test-period closes.
        let train_backtester =
            PitBacktester::new(provider, &self.settings).with_label_cutoff(window.train_end);
        let in_window = |source| WalkForwardError::Backtest {
            window: window.index,
            source,
        };

        let train: Vec<BacktestResult> = scorers
            .par_iter()
            .map(|(params, scorer)| {
                train_backtester.run(scorer.as_ref(), params, window.train_range(), snapshot)
            })
            .collect::<Result<Vec<_>, BacktestError>>()
            .map_err(in_window)?;

        // Highest train IC wins; ties keep the earlier candidate in grid order.
        let mut best: Option<usize> = None;
        for (i, result) in train.iter().enumerate() {
            let ic = result.mean_ic();
            if ic.is_finite() && best.map_or(true, |b| ic > train[b].mean_ic()) {
                best = Some(i);
            }
        }
        let candidates: Vec<CandidateScore> = train
            .iter()
            .map(|r| CandidateScore {
                params: r.params.clone(),
                train_ic: r.mean_ic(),
            })
            .collect();

        let Some(best) = best else {
            warn!(window = window.index, "skipping window: no candidate has a defined train IC");
            return Ok(WindowOutcome::Skipped(SkippedWindow {
                window: *window,
                reason: SkipReason::NoViableCandidate,
            }));
        };

        let (params, scorer) = &scorers[best];
        let test = backtester
            .run(scorer.as_ref(), params, window.test_range(), snapshot)
            .map_err(in_window)?;
        let mut train = train;
        let train = train.swap_remove(best);

        info!(
            window = window.index,
            params = %format_params(params),
            train_ic = train.mean_ic(),
            test_ic = test.mean_ic(),
            "window evaluated"
        );

        Ok(WindowOutcome::Evaluated(WindowResult {
            window: *window,
            selected_params: params.clone(),
            params_hash: params_hash(params),
            candidates,
            train_ic: train.mean_ic(),
            test_ic: test.mean_ic(),
            train,
            test,
        }))
    }
}

//! Monte Carlo Simulator — resampling robustness for a realized return or IC series.
//!
//! Two resampling methods, with deliberately different readings of their p-value:
//! - **Bootstrap** draws `n` observations with replacement. It keeps the marginal
//!   distribution and destroys order, so its spread measures how much a metric
//!   varies under resampling. It is not a test of "no skill".
//! - **Shuffle** permutes the exact observed multiset. Order-free metrics (mean) are
//!   unchanged; path metrics (drawdown, autocorrelation) move, so a small p-value
//!   says the realized ordering carries time structure.
//!
//! Simulations are split into fixed-size batches; batch `k` draws from an RNG
//! derived from the master seed and `k`, so output is identical for any worker count.

use std::str::FromStr;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use factorlab_core::rng::{resolve_seed, RngHierarchy};

use crate::backtest::{BacktestResult, SCHEMA_VERSION};
use crate::metrics;

const RNG_STREAM: &str = "monte_carlo";

#[derive(Debug, Error, PartialEq)]
pub enum MonteCarloError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("insufficient data: {got} observations, need at least {min}")]
    InsufficientData { got: usize, min: usize },

    #[error("observation {index} is not finite")]
    NonFiniteInput { index: usize },

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// How simulated series are drawn from the observed one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    #[default]
    Bootstrap,
    Shuffle,
}

/// What a method's p-value means. Kept separate per method on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMeaning {
    /// Share of resamples at or above the observed metric; a variance estimate.
    ResamplingVariance,
    /// Share of random orderings at or above the observed metric; an order-dependence test.
    OrderDependence,
}

impl ResampleMethod {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Shuffle => "shuffle",
        }
    }

    pub fn p_value_meaning(self) -> PValueMeaning {
        match self {
            Self::Bootstrap => PValueMeaning::ResamplingVariance,
            Self::Shuffle => PValueMeaning::OrderDependence,
        }
    }

    /// Overwrite `out` with one simulated series.
    fn resample_into(self, series: &[f64], rng: &mut StdRng, out: &mut Vec<f64>) {
        match self {
            Self::Bootstrap => bootstrap_into(series, rng, out),
            Self::Shuffle => shuffle_into(series, rng, out),
        }
    }
}

impl FromStr for ResampleMethod {
    type Err = MonteCarloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(Self::Bootstrap),
            "shuffle" => Ok(Self::Shuffle),
            other => Err(MonteCarloError::Configuration(format!(
                "unknown resampling method '{other}' (expected bootstrap or shuffle)"
            ))),
        }
    }
}

fn bootstrap_into(series: &[f64], rng: &mut StdRng, out: &mut Vec<f64>) {
    let n = series.len();
    out.clear();
    if n == 0 {
        return;
    }
    let idx = Uniform::new(0, n);
    out.extend(idx.sample_iter(&mut *rng).take(n).map(|i| series[i]));
}

fn shuffle_into(series: &[f64], rng: &mut StdRng, out: &mut Vec<f64>) {
    out.clear();
    out.extend_from_slice(series);
    out.shuffle(rng);
}

/// Statistic recomputed on every simulated series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Sharpe,
    Mean,
    MaxDrawdown,
    Autocorrelation,
}

impl TargetMetric {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sharpe => "sharpe",
            Self::Mean => "mean",
            Self::MaxDrawdown => "max_drawdown",
            Self::Autocorrelation => "autocorrelation",
        }
    }

    pub fn compute(self, series: &[f64], periods_per_year: f64) -> f64 {
        match self {
            Self::Sharpe => metrics::sharpe_ratio(series, periods_per_year),
            Self::Mean => metrics::mean(series),
            Self::MaxDrawdown => metrics::max_drawdown(series),
            Self::Autocorrelation => metrics::autocorrelation(series),
        }
    }
}

/// Which series of a backtest to resample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    #[default]
    Returns,
    /// Valid daily ICs; dates with a missing IC are left out.
    Ic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub n_simulations: usize,
    pub method: ResampleMethod,
    /// `None` generates a seed internally and logs a warning.
    pub random_seed: Option<u64>,
    pub metrics: Vec<TargetMetric>,
    /// Simulations per derived RNG stream.
    pub batch_size: usize,
    pub periods_per_year: f64,
    /// Worker threads (0 = one per core).
    pub max_workers: usize,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            n_simulations: 1000,
            method: ResampleMethod::Bootstrap,
            random_seed: None,
            metrics: vec![
                TargetMetric::Sharpe,
                TargetMetric::Mean,
                TargetMetric::MaxDrawdown,
                TargetMetric::Autocorrelation,
            ],
            batch_size: 100,
            periods_per_year: 252.0,
            max_workers: 0,
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<(), MonteCarloError> {
        if self.n_simulations == 0 {
            return Err(MonteCarloError::Configuration(
                "n_simulations must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MonteCarloError::Configuration(
                "batch_size must be positive".into(),
            ));
        }
        if self.metrics.is_empty() {
            return Err(MonteCarloError::Configuration(
                "at least one target metric is required".into(),
            ));
        }
        if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
            return Err(MonteCarloError::Configuration(
                "periods_per_year must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// (5th, 50th, 95th) percentiles of a simulated distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    #[serde(with = "crate::serde_nan")]
    pub lower_5: f64,
    #[serde(with = "crate::serde_nan")]
    pub median: f64,
    #[serde(with = "crate::serde_nan")]
    pub upper_95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDistribution {
    pub metric: TargetMetric,
    #[serde(with = "crate::serde_nan")]
    pub observed: f64,
    pub interval: ConfidenceInterval,
    /// Fraction of simulated values >= observed.
    #[serde(with = "crate::serde_nan")]
    pub p_value: f64,
    /// Simulations with a finite metric value.
    pub n_valid: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub schema_version: u32,
    pub method: ResampleMethod,
    pub p_value_meaning: PValueMeaning,
    /// Seed actually used, whether supplied or generated.
    pub seed: u64,
    pub n_simulations: usize,
    pub n_observations: usize,
    pub metrics: Vec<MetricDistribution>,
}

impl MonteCarloResult {
    pub fn metric(&self, metric: TargetMetric) -> Option<&MetricDistribution> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}

pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> Result<Self, MonteCarloError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.config
    }

    /// Resample `series` and summarize every configured metric.
    pub fn simulate(&self, series: &[f64]) -> Result<MonteCarloResult, MonteCarloError> {
        check_series(series)?;
        let seed = resolve_seed(self.config.random_seed, RNG_STREAM);
        let metrics_list = &self.config.metrics;
        let ppy = self.config.periods_per_year;

        let per_sim: Vec<Vec<f64>> = self.run_batches(series, seed, |draw| {
            metrics_list.iter().map(|m| m.compute(draw, ppy)).collect()
        })?;

        let metrics = metrics_list
            .iter()
            .enumerate()
            .map(|(j, &metric)| {
                let observed = metric.compute(series, ppy);
                let simulated: Vec<f64> = per_sim.iter().map(|v| v[j]).collect();
                summarize(metric, observed, simulated)
            })
            .collect();

        info!(
            method = self.config.method.name(),
            seed,
            n_simulations = self.config.n_simulations,
            n_observations = series.len(),
            "monte carlo complete"
        );

        Ok(MonteCarloResult {
            schema_version: SCHEMA_VERSION,
            method: self.config.method,
            p_value_meaning: self.config.method.p_value_meaning(),
            seed,
            n_simulations: self.config.n_simulations,
            n_observations: series.len(),
            metrics,
        })
    }

    /// Run the simulator on a backtest's return series or valid IC series.
    pub fn simulate_backtest(
        &self,
        result: &BacktestResult,
        kind: SeriesKind,
    ) -> Result<MonteCarloResult, MonteCarloError> {
        let series = match kind {
            SeriesKind::Returns => result.returns(),
            SeriesKind::Ic => result.valid_ics(),
        };
        self.simulate(&series)
    }

    /// The exact simulated series `simulate` would evaluate for `seed`, in order.
    pub fn generate_resamples(
        &self,
        series: &[f64],
        seed: u64,
    ) -> Result<Vec<Vec<f64>>, MonteCarloError> {
        check_series(series)?;
        self.run_batches(series, seed, <[f64]>::to_vec)
    }

    fn run_batches<T, F>(&self, series: &[f64], seed: u64, per_draw: F) -> Result<Vec<T>, MonteCarloError>
    where
        T: Send,
        F: Fn(&[f64]) -> T + Sync,
    {
        let n_sims = self.config.n_simulations;
        let batch_size = self.config.batch_size;
        let n_batches = n_sims.div_ceil(batch_size);
        let method = self.config.method;
        let hierarchy = RngHierarchy::new(seed);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .build()
            .map_err(|e| MonteCarloError::Pool(e.to_string()))?;

        let batches: Vec<Vec<T>> = pool.install(|| {
            (0..n_batches)
                .into_par_iter()
                .map(|k| {
                    let mut rng = hierarchy.rng_for(RNG_STREAM, k as u64);
                    let count = batch_size.min(n_sims - k * batch_size);
                    let mut buf = Vec::with_capacity(series.len());
                    (0..count)
                        .map(|_| {
                            method.resample_into(series, &mut rng, &mut buf);
                            per_draw(&buf)
                        })
                        .collect()
                })
                .collect()
        });
        Ok(batches.into_iter().flatten().collect())
    }
}

fn check_series(series: &[f64]) -> Result<(), MonteCarloError> {
    if series.len() < 2 {
        return Err(MonteCarloError::InsufficientData {
            got: series.len(),
            min: 2,
        });
    }
    if let Some(index) = series.iter().position(|v| !v.is_finite()) {
        return Err(MonteCarloError::NonFiniteInput { index });
    }
    Ok(())
}

fn summarize(metric: TargetMetric, observed: f64, simulated: Vec<f64>) -> MetricDistribution {
    let mut sorted: Vec<f64> = simulated.into_iter().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    let n_valid = sorted.len();
    let p_value = if n_valid == 0 {
        f64::NAN
    } else {
        sorted.iter().filter(|&&v| v >= observed).count() as f64 / n_valid as f64
    };
    MetricDistribution {
        metric,
        observed,
        interval: ConfidenceInterval {
            lower_5: metrics::percentile_sorted(&sorted, 0.05),
            median: metrics::percentile_sorted(&sorted, 0.50),
            upper_95: metrics::percentile_sorted(&sorted, 0.95),
        },
        p_value,
        n_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: ResampleMethod, n: usize) -> MonteCarloConfig {
        MonteCarloConfig {
            n_simulations: n,
            method,
            random_seed: Some(42),
            batch_size: 16,
            max_workers: 2,
            ..Default::default()
        }
    }

    fn series() -> Vec<f64> {
        (0..60).map(|i| ((i * 7919) % 23) as f64 / 1000.0 - 0.01).collect()
    }

    #[test]
    fn method_parsing() {
        assert_eq!("Bootstrap".parse::<ResampleMethod>().unwrap(), ResampleMethod::Bootstrap);
        assert_eq!("shuffle".parse::<ResampleMethod>().unwrap(), ResampleMethod::Shuffle);
        assert!(matches!(
            "jackknife".parse::<ResampleMethod>(),
            Err(MonteCarloError::Configuration(_))
        ));
    }

    #[test]
    fn p_value_meaning_differs_by_method() {
        assert_eq!(
            ResampleMethod::Bootstrap.p_value_meaning(),
            PValueMeaning::ResamplingVariance
        );
        assert_eq!(
            ResampleMethod::Shuffle.p_value_meaning(),
            PValueMeaning::OrderDependence
        );
    }

    #[test]
    fn zero_simulations_rejected() {
        assert!(matches!(
            MonteCarloSimulator::new(config(ResampleMethod::Bootstrap, 0)),
            Err(MonteCarloError::Configuration(_))
        ));
    }

    #[test]
    fn short_or_non_finite_series_rejected() {
        let sim = MonteCarloSimulator::new(config(ResampleMethod::Bootstrap, 10)).unwrap();
        assert_eq!(
            sim.simulate(&[0.1]),
            Err(MonteCarloError::InsufficientData { got: 1, min: 2 })
        );
        assert_eq!(
            sim.simulate(&[0.1, f64::NAN]),
            Err(MonteCarloError::NonFiniteInput { index: 1 })
        );
    }

    #[test]
    fn shuffle_leaves_mean_unchanged() {
        let sim = MonteCarloSimulator::new(config(ResampleMethod::Shuffle, 50)).unwrap();
        let result = sim.simulate(&series()).unwrap();
        let mean = result.metric(TargetMetric::Mean).unwrap();
        assert!((mean.interval.lower_5 - mean.observed).abs() < 1e-12);
        assert!((mean.interval.upper_95 - mean.observed).abs() < 1e-12);
    }

    #[test]
    fn batch_count_covers_remainder() {
        let sim = MonteCarloSimulator::new(config(ResampleMethod::Bootstrap, 37)).unwrap();
        let draws = sim.generate_resamples(&series(), 1).unwrap();
        assert_eq!(draws.len(), 37);
        assert!(draws.iter().all(|d| d.len() == 60));
    }

    #[test]
    fn worker_count_does_not_change_output() {
        let mut one = config(ResampleMethod::Bootstrap, 200);
        one.max_workers = 1;
        let mut four = one.clone();
        four.max_workers = 4;
        let a = MonteCarloSimulator::new(one).unwrap().simulate(&series()).unwrap();
        let b = MonteCarloSimulator::new(four).unwrap().simulate(&series()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn generated_seed_is_recorded() {
        let mut cfg = config(ResampleMethod::Bootstrap, 20);
        cfg.random_seed = None;
        let result = MonteCarloSimulator::new(cfg).unwrap().simulate(&series()).unwrap();
        assert_eq!(result.n_simulations, 20);
        assert_eq!(result.metrics.len(), 4);
    }
}

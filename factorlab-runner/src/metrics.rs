//! Statistics — pure functions over return and signal series.
//!
//! Every metric is a pure function: slices in, scalar out. No dependencies on
//! the data layer or the backtester, so the Monte Carlo simulator and the
//! walk-forward aggregator share exactly the same definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an information coefficient could not be computed for a date.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ComputationIssue {
    #[error("empty cross-section")]
    EmptyCrossSection,
    #[error("cross-section of {got} below minimum {min}")]
    InsufficientCrossSection { got: usize, min: usize },
    #[error("signal has zero variance")]
    DegenerateSignal,
    #[error("forward returns have zero variance")]
    DegenerateReturns,
    #[error("no forward-return labels for scored securities")]
    MissingLabels,
    #[error("scorer failed: {0}")]
    Scorer(String),
}

/// Correlation used for the information coefficient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcMethod {
    /// Spearman rank correlation.
    #[default]
    Rank,
    Pearson,
}

const VARIANCE_EPS: f64 = 1e-15;

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Standard deviation with divisor n.
pub fn population_std(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

/// Standard deviation with divisor n - 1. Zero for fewer than two points.
pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64).sqrt()
}

/// Pearson correlation. `None` if either side has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let (mx, my) = (mean(x), mean(y));
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx < VARIANCE_EPS || syy < VARIANCE_EPS {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}

/// 1-based ranks; ties receive the average of the ranks they span.
pub fn average_ranks(xs: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..xs.len()).collect();
    idx.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));
    let mut ranks = vec![0.0; xs.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && xs[idx[j + 1]] == xs[idx[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &idx[i..=j] {
            ranks[k] = avg;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman rank correlation (Pearson over average ranks).
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    pearson(&average_ranks(x), &average_ranks(y))
}

/// Cross-sectional IC between signal and forward returns.
pub fn information_coefficient(
    signal: &[f64],
    forward: &[f64],
    method: IcMethod,
) -> Result<f64, ComputationIssue> {
    if signal.is_empty() {
        return Err(ComputationIssue::EmptyCrossSection);
    }
    if population_std(signal) < 1e-12 {
        return Err(ComputationIssue::DegenerateSignal);
    }
    if population_std(forward) < 1e-12 {
        return Err(ComputationIssue::DegenerateReturns);
    }
    let ic = match method {
        IcMethod::Rank => spearman(signal, forward),
        IcMethod::Pearson => pearson(signal, forward),
    };
    ic.ok_or(ComputationIssue::DegenerateSignal)
}

/// Annualized Sharpe ratio of a per-period return series.
///
/// Sharpe = mean / sample std * sqrt(periods_per_year).
/// Returns 0.0 if variance is zero or fewer than 2 observations.
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = sample_std(returns);
    if std < VARIANCE_EPS {
        return 0.0;
    }
    mean(returns) / std * periods_per_year.sqrt()
}

/// Maximum drawdown of the compounded return series, as a negative fraction
/// (e.g. -0.15 = 15% drawdown). Returns 0.0 for a monotone curve.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut max_dd = 0.0_f64;
    for r in returns {
        equity *= 1.0 + r;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (equity - peak) / peak;
            if dd < max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Compounded total return.
pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |eq, r| eq * (1.0 + r)) - 1.0
}

/// Lag-1 autocorrelation. 0.0 for fewer than 3 points or a constant series.
pub fn autocorrelation(returns: &[f64]) -> f64 {
    if returns.len() < 3 {
        return 0.0;
    }
    let m = mean(returns);
    let denom: f64 = returns.iter().map(|r| (r - m).powi(2)).sum();
    if denom < VARIANCE_EPS {
        return 0.0;
    }
    let num: f64 = returns.windows(2).map(|w| (w[0] - m) * (w[1] - m)).sum();
    num / denom
}

/// Linear-interpolated percentile of an ascending-sorted slice, `q` in [0, 1].
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    let v = sorted[lo] + (sorted[hi] - sorted[lo]) * frac;
    v.clamp(sorted[lo], sorted[hi])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_stds() {
        let xs = [0.05, 0.03, -0.01];
        assert!((mean(&xs) - 0.023_333).abs() < 1e-5);
        assert!((population_std(&xs) - 0.024_944).abs() < 1e-5);
        assert!((sample_std(&xs) - 0.030_550).abs() < 1e-5);
        assert_eq!(sample_std(&[1.0]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn pearson_perfect_and_degenerate() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson(&x, &y).unwrap() - 1.0).abs() < 1e-12);
        let neg: Vec<f64> = y.iter().map(|v| -v).collect();
        assert!((pearson(&x, &neg).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson(&x, &[1.0, 1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn ranks_average_ties() {
        assert_eq!(average_ranks(&[10.0, 20.0, 20.0, 5.0]), vec![2.0, 3.5, 3.5, 1.0]);
    }

    #[test]
    fn spearman_is_monotone_invariant() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 8.0, 27.0, 64.0, 125.0];
        assert!((spearman(&x, &y).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ic_reports_degenerate_inputs() {
        assert_eq!(
            information_coefficient(&[], &[], IcMethod::Rank),
            Err(ComputationIssue::EmptyCrossSection)
        );
        assert_eq!(
            information_coefficient(&[1.0, 1.0, 1.0], &[0.1, 0.2, 0.3], IcMethod::Rank),
            Err(ComputationIssue::DegenerateSignal)
        );
        assert_eq!(
            information_coefficient(&[1.0, 2.0, 3.0], &[0.1, 0.1, 0.1], IcMethod::Pearson),
            Err(ComputationIssue::DegenerateReturns)
        );
    }

    #[test]
    fn sharpe_zero_for_constant_returns() {
        assert_eq!(sharpe_ratio(&[0.01; 10], 252.0), 0.0);
        assert_eq!(sharpe_ratio(&[0.01], 252.0), 0.0);
    }

    #[test]
    fn sharpe_known_value() {
        let r = [0.01, -0.01, 0.02, 0.0];
        let expected = mean(&r) / sample_std(&r) * 252.0_f64.sqrt();
        assert!((sharpe_ratio(&r, 252.0) - expected).abs() < 1e-12);
        assert!(sharpe_ratio(&r, 252.0) > 0.0);
    }

    #[test]
    fn drawdown_of_compounded_curve() {
        // 1.0 -> 1.1 -> 0.88 -> 0.968
        let dd = max_drawdown(&[0.1, -0.2, 0.1]);
        assert!((dd + 0.2).abs() < 1e-12);
        assert_eq!(max_drawdown(&[0.01, 0.02]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn total_return_compounds() {
        assert!((total_return(&[0.1, 0.1]) - 0.21).abs() < 1e-12);
    }

    #[test]
    fn autocorrelation_signs() {
        let alternating = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        assert!(autocorrelation(&alternating) < -0.5);
        let trending = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert!(autocorrelation(&trending) > 0.0);
        assert_eq!(autocorrelation(&[0.0; 5]), 0.0);
    }

    #[test]
    fn percentiles_interpolate_and_order() {
        let s = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&s, 0.5), 3.0);
        assert_eq!(percentile_sorted(&s, 0.0), 1.0);
        assert_eq!(percentile_sorted(&s, 1.0), 5.0);
        assert!((percentile_sorted(&s, 0.05) - 1.2).abs() < 1e-12);
        assert!(percentile_sorted(&[], 0.5).is_nan());
        let flat = [0.3; 7];
        assert_eq!(percentile_sorted(&flat, 0.05), percentile_sorted(&flat, 0.95));
    }
}

//! Property tests for the Monte Carlo simulator.
//!
//! 1. Every p-value lies in [0, 1] and confidence bounds are ordered
//! 2. Shuffle draws are permutations of the observed series
//! 3. Bootstrap draws only contain observed values
//! 4. A fixed seed reproduces results bit for bit

use proptest::prelude::*;

use factorlab_runner::monte_carlo::{
    MonteCarloConfig, MonteCarloSimulator, PValueMeaning, ResampleMethod, TargetMetric,
};

fn series_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-0.05f64..0.05, 5..60)
}

fn method_strategy() -> impl Strategy<Value = ResampleMethod> {
    prop_oneof![Just(ResampleMethod::Bootstrap), Just(ResampleMethod::Shuffle)]
}

fn simulator(method: ResampleMethod, seed: u64, n: usize) -> MonteCarloSimulator {
    MonteCarloSimulator::new(MonteCarloConfig {
        n_simulations: n,
        method,
        random_seed: Some(seed),
        batch_size: 7,
        max_workers: 2,
        ..Default::default()
    })
    .unwrap()
}

fn sorted(xs: &[f64]) -> Vec<f64> {
    let mut v = xs.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn p_values_and_intervals_are_well_formed(
        series in series_strategy(),
        method in method_strategy(),
        seed in any::<u64>(),
    ) {
        let result = simulator(method, seed, 60).simulate(&series).unwrap();
        prop_assert_eq!(result.n_observations, series.len());
        prop_assert_eq!(result.metrics.len(), 4);
        for m in &result.metrics {
            prop_assert!(m.n_valid <= 60);
            if m.n_valid > 0 {
                prop_assert!((0.0..=1.0).contains(&m.p_value), "{:?} p = {}", m.metric, m.p_value);
                prop_assert!(m.interval.lower_5 <= m.interval.median);
                prop_assert!(m.interval.median <= m.interval.upper_95);
            } else {
                prop_assert!(m.p_value.is_nan());
            }
        }
    }

    #[test]
    fn shuffle_draws_are_permutations(series in series_strategy(), seed in any::<u64>()) {
        let sim = simulator(ResampleMethod::Shuffle, seed, 20);
        let expected = sorted(&series);
        let draws = sim.generate_resamples(&series, seed).unwrap();
        prop_assert_eq!(draws.len(), 20);
        for draw in &draws {
            prop_assert_eq!(sorted(draw), expected.clone());
        }
    }

    #[test]
    fn bootstrap_draws_come_from_the_series(series in series_strategy(), seed in any::<u64>()) {
        let sim = simulator(ResampleMethod::Bootstrap, seed, 20);
        for draw in sim.generate_resamples(&series, seed).unwrap() {
            prop_assert_eq!(draw.len(), series.len());
            prop_assert!(draw.iter().all(|v| series.contains(v)));
        }
    }

    #[test]
    fn fixed_seed_is_bit_identical(
        series in series_strategy(),
        method in method_strategy(),
        seed in any::<u64>(),
    ) {
        let a = simulator(method, seed, 40).simulate(&series).unwrap();
        let b = simulator(method, seed, 40).simulate(&series).unwrap();
        prop_assert_eq!(a.seed, seed);
        for (x, y) in a.metrics.iter().zip(&b.metrics) {
            prop_assert_eq!(x.p_value.to_bits(), y.p_value.to_bits());
            prop_assert_eq!(x.interval.median.to_bits(), y.interval.median.to_bits());
            prop_assert_eq!(x.observed.to_bits(), y.observed.to_bits());
        }
    }
}

#[test]
fn shuffle_cannot_move_order_free_metrics() {
    let series: Vec<f64> = (0..50).map(|i| ((i * 37) % 11) as f64 * 0.001 - 0.004).collect();
    let result = simulator(ResampleMethod::Shuffle, 9, 200).simulate(&series).unwrap();
    assert_eq!(result.p_value_meaning, PValueMeaning::OrderDependence);
    let mean = result.metric(TargetMetric::Mean).unwrap();
    // Every permutation has (up to summation order) the observed mean.
    assert!((mean.interval.lower_5 - mean.observed).abs() < 1e-12);
    assert!((mean.interval.upper_95 - mean.observed).abs() < 1e-12);
}

#[test]
fn trending_series_is_significant_under_bootstrap() {
    // Strong positive drift: resampled Sharpe rarely beats the observed one by chance
    // and the observed value sits inside the resampled distribution.
    let series: Vec<f64> = (0..250).map(|i| 0.002 + 0.01 * ((i as f64) * 0.7).sin()).collect();
    let result = simulator(ResampleMethod::Bootstrap, 1, 500).simulate(&series).unwrap();
    assert_eq!(result.p_value_meaning, PValueMeaning::ResamplingVariance);
    let sharpe = result.metric(TargetMetric::Sharpe).unwrap();
    assert!(sharpe.observed > 0.0);
    assert!(sharpe.interval.lower_5 > 0.0);
    assert!(sharpe.p_value > 0.2 && sharpe.p_value < 0.8, "p = {}", sharpe.p_value);
}

//! FactorLab Runner — backtesting, walk-forward optimization, Monte Carlo robustness.
//!
//! This crate builds on `factorlab-core` to provide:
//! - Point-in-time backtester producing daily IC and long/short returns
//! - Walk-forward optimizer with a snapshot pinned for the whole run
//! - Monte Carlo significance testing (bootstrap and shuffle)
//! - TOML run configuration
//! - JSON/CSV/Parquet export and Markdown reports

pub mod backtest;
pub mod config;
pub mod export;
pub mod metrics;
pub mod monte_carlo;
mod serde_nan;
pub mod walk_forward;

pub use backtest::{
    AvailabilityRule, BacktestError, BacktestResult, BacktestSettings, BacktestSummary,
    DailyRecord, PitBacktester, SCHEMA_VERSION,
};
pub use config::{ConfigError, DataSource, OpenedData, RunConfig};
pub use metrics::{ComputationIssue, IcMethod};
pub use monte_carlo::{
    MonteCarloConfig, MonteCarloError, MonteCarloResult, MonteCarloSimulator, PValueMeaning,
    ResampleMethod, SeriesKind, TargetMetric,
};
pub use walk_forward::{
    generate_windows, Aggregate, SkipReason, SkippedWindow, WalkForwardConfig, WalkForwardError,
    WalkForwardOptimizer, WalkForwardResult, Window, WindowPlan, WindowResult,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn results_are_send_sync() {
        assert_send::<BacktestResult>();
        assert_sync::<BacktestResult>();
        assert_send::<WalkForwardResult>();
        assert_sync::<WalkForwardResult>();
        assert_send::<MonteCarloResult>();
        assert_sync::<MonteCarloResult>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<BacktestError>();
        assert_sync::<BacktestError>();
        assert_send::<WalkForwardError>();
        assert_sync::<WalkForwardError>();
        assert_send::<MonteCarloError>();
        assert_sync::<MonteCarloError>();
    }

    #[test]
    fn engines_are_send_sync() {
        assert_send::<WalkForwardOptimizer>();
        assert_sync::<WalkForwardOptimizer>();
        assert_send::<MonteCarloSimulator>();
        assert_sync::<MonteCarloSimulator>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<RunConfig>();
        assert_sync::<RunConfig>();
        assert_send::<BacktestSettings>();
        assert_sync::<BacktestSettings>();
    }
}

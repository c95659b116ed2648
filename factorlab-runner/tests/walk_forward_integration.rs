//! End-to-end walk-forward runs over a synthetic universe.
//!
//! Covers window evaluation, determinism across worker counts, snapshot
//! release, cancellation, and restart-on-manifest-change.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;

use factorlab_core::alpha::{
    AlphaError, AlphaFactory, BuiltinAlpha, BuiltinAlphaFactory, ParamGrid, ParamSet, PitView,
    Score, Scorer,
};
use factorlab_core::data::{DataError, InMemoryProvider, SyntheticUniverse};
use factorlab_core::domain::PriceRecord;
use factorlab_core::snapshot::SnapshotManager;

use factorlab_runner::backtest::BacktestSettings;
use factorlab_runner::metrics::ComputationIssue;
use factorlab_runner::walk_forward::{
    SkipReason, WalkForwardConfig, WalkForwardError, WalkForwardOptimizer,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn universe() -> SyntheticUniverse {
    SyntheticUniverse {
        n_securities: 15,
        start: d(2019, 1, 1),
        end: d(2020, 12, 31),
        seed: 5,
        ..Default::default()
    }
}

fn wf_config(max_workers: usize) -> WalkForwardConfig {
    WalkForwardConfig {
        train_months: 6,
        test_months: 3,
        step_months: 3,
        min_train_samples: 150,
        max_workers,
        ..Default::default()
    }
}

fn grid() -> ParamGrid {
    ParamGrid::new().with_axis("lookback", vec![10.0, 40.0])
}

fn optimizer(store: Arc<InMemoryProvider>, max_workers: usize) -> (WalkForwardOptimizer, Arc<SnapshotManager>) {
    let snapshots = Arc::new(SnapshotManager::new(store.clone()));
    let opt = WalkForwardOptimizer::new(
        store,
        snapshots.clone(),
        wf_config(max_workers),
        BacktestSettings::default(),
    );
    (opt, snapshots)
}

/// Wraps a builtin scorer and runs `hook` before every score call.
struct Hooked {
    inner: Box<dyn Scorer>,
    hook: Arc<dyn Fn() + Send + Sync>,
}

impl Scorer for Hooked {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn lookback_days(&self) -> u32 {
        self.inner.lookback_days()
    }

    fn score(&self, view: &PitView<'_>) -> Result<Vec<Score>, AlphaError> {
        (self.hook)();
        self.inner.score(view)
    }
}

struct HookedFactory {
    inner: BuiltinAlphaFactory,
    hook: Arc<dyn Fn() + Send + Sync>,
}

impl AlphaFactory for HookedFactory {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn build(&self, params: &ParamSet) -> Result<Box<dyn Scorer>, AlphaError> {
        Ok(Box::new(Hooked {
            inner: self.inner.build(params)?,
            hook: self.hook.clone(),
        }))
    }
}

#[test]
fn full_run_evaluates_every_window() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, snapshots) = optimizer(store, 2);
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Momentum);

    let result = opt.run(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31)).unwrap();

    assert_eq!(result.alpha, "momentum");
    assert_eq!(result.windows.len() + result.skipped.len(), 6);
    assert!(result.advisories.iter().any(|a| a.contains("overlap")));
    for pair in result.windows.windows(2) {
        assert!(pair[0].window.index < pair[1].window.index);
        assert!(pair[0].window.test_end < pair[1].window.test_start);
    }
    for w in &result.windows {
        assert_eq!(w.candidates.len(), 2);
        let best = w
            .candidates
            .iter()
            .map(|c| c.train_ic)
            .filter(|ic| ic.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(w.train_ic, best);
        assert_eq!(w.test.range, w.window.test_range());
        assert_eq!(w.test.snapshot_id, result.snapshot_id);
        assert!(w.test.daily.iter().all(|r| w.window.test_range().contains(r.date)));

        // Train labels end at train_end: the final train date has no realized return.
        let last = w.train.daily.last().unwrap();
        assert!(last.date <= w.window.train_end);
        assert_eq!(last.ic, None);
        assert_eq!(last.issue, Some(ComputationIssue::MissingLabels));
    }
    assert_eq!(result.aggregate.n_valid_windows, result.windows.iter().filter(|w| w.test_ic.is_finite()).count());
    assert!(result.aggregated_test_ic().is_finite());

    // The lease is gone once the run returns.
    assert!(matches!(
        snapshots.verify(&result.snapshot_id),
        Err(DataError::UnknownSnapshot(_))
    ));
}

#[test]
fn worker_count_does_not_change_results() {
    let store = Arc::new(universe().generate().unwrap());
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Momentum);
    let (serial, _) = optimizer(store.clone(), 1);
    let (parallel, _) = optimizer(store, 4);

    let a = serial.run(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31)).unwrap();
    let b = parallel.run(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31)).unwrap();

    assert_eq!(a.windows.len(), b.windows.len());
    for (x, y) in a.windows.iter().zip(&b.windows) {
        assert_eq!(x.selected_params, y.selected_params);
        assert_eq!(x.test.daily, y.test.daily);
    }
    // Debug formatting so undefined (NaN) statistics compare equal.
    assert_eq!(format!("{:?}", a.aggregate), format!("{:?}", b.aggregate));
}

#[test]
fn short_train_windows_are_reported_as_skipped() {
    let store = Arc::new(universe().generate().unwrap());
    let snapshots = Arc::new(SnapshotManager::new(store.clone()));
    let config = WalkForwardConfig {
        train_months: 1,
        test_months: 1,
        step_months: 1,
        min_train_samples: 30,
        max_workers: 2,
        ..Default::default()
    };
    let opt = WalkForwardOptimizer::new(store, snapshots, config, BacktestSettings::default());
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Reversal);

    let result = opt
        .run(&factory, &ParamGrid::new(), d(2020, 1, 1), d(2020, 6, 30))
        .unwrap();

    // Five windows fit; February 2020 (29 days) is reported, not dropped.
    assert_eq!(result.windows.len() + result.skipped.len(), 5);
    let short: Vec<_> = result
        .skipped
        .iter()
        .filter(|s| matches!(s.reason, SkipReason::InsufficientData { .. }))
        .collect();
    assert_eq!(short.len(), 1);
    assert_eq!(short[0].window.index, 1);
    assert_eq!(
        short[0].reason,
        SkipReason::InsufficientData {
            train_days: 29,
            min_train_samples: 30
        }
    );
}

#[test]
fn empty_grid_runs_defaults_once_per_window() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, _) = optimizer(store, 2);
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Reversal);
    let result = opt
        .run(&factory, &ParamGrid::new(), d(2019, 1, 1), d(2020, 12, 31))
        .unwrap();
    assert!(result.windows.iter().all(|w| w.candidates.len() == 1));
    assert!(result.windows.iter().all(|w| w.selected_params.is_empty()));
}

#[test]
fn span_too_short_for_any_window_is_an_error() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, _) = optimizer(store, 1);
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Momentum);
    let err = opt
        .run(&factory, &grid(), d(2020, 1, 1), d(2020, 6, 30))
        .unwrap_err();
    assert!(matches!(err, WalkForwardError::NoWindows { .. }));
}

#[test]
fn invalid_parameters_fail_before_locking() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, _) = optimizer(store, 1);
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Momentum);
    let bad = ParamGrid::new().with_axis("lookback", vec![0.0]);
    let err = opt.run(&factory, &bad, d(2019, 1, 1), d(2020, 12, 31)).unwrap_err();
    assert!(matches!(err, WalkForwardError::Alpha(_)));
}

#[test]
fn pre_cancelled_run_returns_cancelled() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, _) = optimizer(store, 2);
    let factory = BuiltinAlphaFactory::new(BuiltinAlpha::Momentum);
    let cancel = AtomicBool::new(true);
    let err = opt
        .run_with_cancel(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31), Some(&cancel))
        .unwrap_err();
    assert!(matches!(err, WalkForwardError::Cancelled));
}

#[test]
fn cancelling_mid_run_discards_partial_results() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, _) = optimizer(store, 2);
    let cancel = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let hook = {
        let cancel = cancel.clone();
        let calls = calls.clone();
        Arc::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 50 {
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };
    let factory = HookedFactory {
        inner: BuiltinAlphaFactory::new(BuiltinAlpha::Momentum),
        hook,
    };
    let err = opt
        .run_with_cancel(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31), Some(&cancel))
        .unwrap_err();
    assert!(matches!(err, WalkForwardError::Cancelled));
}

#[test]
fn data_change_mid_run_forces_restart() {
    let store = Arc::new(universe().generate().unwrap());
    let (opt, snapshots) = optimizer(store.clone(), 2);
    let mutated = Arc::new(AtomicBool::new(false));
    let hook = {
        let store = store.clone();
        let mutated = mutated.clone();
        Arc::new(move || {
            if !mutated.swap(true, Ordering::SeqCst) {
                // A late correction lands in the price dataset while the run reads it.
                let close = 10.0;
                let date = d(2019, 3, 1);
                store
                    .insert_prices(vec![PriceRecord {
                        symbol: "LATE".into(),
                        date,
                        available_at: date,
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: 100,
                    }])
                    .unwrap();
            }
        })
    };
    let factory = HookedFactory {
        inner: BuiltinAlphaFactory::new(BuiltinAlpha::Momentum),
        hook,
    };

    let err = opt
        .run(&factory, &grid(), d(2019, 1, 1), d(2020, 12, 31))
        .unwrap_err();
    assert!(err.manifest_changed(), "expected a manifest change, got {err}");
    assert!(mutated.load(Ordering::SeqCst));

    // A fresh run locks the corrected data and completes.
    let fresh = opt
        .run(
            &BuiltinAlphaFactory::new(BuiltinAlpha::Momentum),
            &grid(),
            d(2019, 1, 1),
            d(2020, 12, 31),
        )
        .unwrap();
    assert!(matches!(
        snapshots.verify(&fresh.snapshot_id),
        Err(DataError::UnknownSnapshot(_))
    ));
}

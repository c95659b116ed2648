//! Reporting and export — JSON, CSV, Parquet, and Markdown artifacts.
//!
//! - **JSON**: full serialization of backtest, walk-forward and Monte Carlo results
//! - **CSV**: daily records, the per-window table, and Monte Carlo metric table
//! - **Parquet**: daily records as a columnar file for downstream dashboards
//! - **Markdown**: human-readable walk-forward and Monte Carlo summaries
//!
//! Every persisted result carries a `schema_version`. Versions newer than this
//! build understands are rejected on load.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use polars::prelude::{Column, DataFrame, ParquetWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backtest::{BacktestResult, DailyRecord, SCHEMA_VERSION};
use crate::monte_carlo::{MonteCarloResult, PValueMeaning};
use crate::walk_forward::{SkipReason, WalkForwardResult};

/// A persisted result with a schema version.
pub trait Versioned {
    fn schema_version(&self) -> u32;
}

impl Versioned for BacktestResult {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl Versioned for WalkForwardResult {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl Versioned for MonteCarloResult {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_json<T: Serialize>(result: &T) -> Result<String> {
    serde_json::to_string_pretty(result).context("failed to serialize result to JSON")
}

/// Deserialize a result, rejecting unknown (newer) schema versions.
pub fn import_json<T: DeserializeOwned + Versioned>(json: &str) -> Result<T> {
    let result: T = serde_json::from_str(json).context("failed to deserialize result from JSON")?;
    if result.schema_version() > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            result.schema_version(),
            SCHEMA_VERSION
        );
    }
    Ok(result)
}

// ─── CSV export ─────────────────────────────────────────────────────

fn opt(v: Option<f64>) -> String {
    v.filter(|x| x.is_finite())
        .map(|x| format!("{x:.6}"))
        .unwrap_or_default()
}

fn finite(v: f64) -> String {
    opt(Some(v))
}

/// Columns: date, ic, portfolio_return, cross_section, issue
pub fn export_daily_csv(daily: &[DailyRecord]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["date", "ic", "portfolio_return", "cross_section", "issue"])?;
    for d in daily {
        wtr.write_record([
            d.date.to_string(),
            opt(d.ic),
            format!("{:.8}", d.portfolio_return),
            d.cross_section.to_string(),
            d.issue.as_ref().map(ToString::to_string).unwrap_or_default(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per window, evaluated or skipped, in window order.
///
/// Columns: window, train_start, train_end, test_start, test_end, status, params,
/// train_ic, test_ic
pub fn export_windows_csv(result: &WalkForwardResult) -> Result<String> {
    let mut rows: Vec<(usize, [String; 9])> = Vec::new();
    for w in &result.windows {
        rows.push((
            w.window.index,
            [
                w.window.index.to_string(),
                w.window.train_start.to_string(),
                w.window.train_end.to_string(),
                w.window.test_start.to_string(),
                w.window.test_end.to_string(),
                "evaluated".to_string(),
                factorlab_core::alpha::format_params(&w.selected_params),
                finite(w.train_ic),
                finite(w.test_ic),
            ],
        ));
    }
    for s in &result.skipped {
        let status = match s.reason {
            SkipReason::InsufficientData { .. } => "skipped:insufficient_data",
            SkipReason::NoViableCandidate => "skipped:no_viable_candidate",
        };
        rows.push((
            s.window.index,
            [
                s.window.index.to_string(),
                s.window.train_start.to_string(),
                s.window.train_end.to_string(),
                s.window.test_start.to_string(),
                s.window.test_end.to_string(),
                status.to_string(),
                String::new(),
                String::new(),
                String::new(),
            ],
        ));
    }
    rows.sort_by_key(|(index, _)| *index);

    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "window",
        "train_start",
        "train_end",
        "test_start",
        "test_end",
        "status",
        "params",
        "train_ic",
        "test_ic",
    ])?;
    for (_, row) in rows {
        wtr.write_record(row)?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Columns: metric, observed, lower_5, median, upper_95, p_value, n_valid
pub fn export_monte_carlo_csv(result: &MonteCarloResult) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "metric", "observed", "lower_5", "median", "upper_95", "p_value", "n_valid",
    ])?;
    for m in &result.metrics {
        wtr.write_record([
            m.metric.name().to_string(),
            finite(m.observed),
            finite(m.interval.lower_5),
            finite(m.interval.median),
            finite(m.interval.upper_95),
            finite(m.p_value),
            m.n_valid.to_string(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Parquet export ─────────────────────────────────────────────────

pub fn write_daily_parquet(path: &Path, daily: &[DailyRecord]) -> Result<()> {
    let dates: Vec<String> = daily.iter().map(|d| d.date.to_string()).collect();
    let ics: Vec<Option<f64>> = daily.iter().map(|d| d.ic).collect();
    let returns: Vec<f64> = daily.iter().map(|d| d.portfolio_return).collect();
    let cross: Vec<u64> = daily.iter().map(|d| d.cross_section as u64).collect();
    let issues: Vec<Option<String>> = daily
        .iter()
        .map(|d| d.issue.as_ref().map(ToString::to_string))
        .collect();

    let mut df = DataFrame::new(vec![
        Column::new("date".into(), dates),
        Column::new("ic".into(), ics),
        Column::new("portfolio_return".into(), returns),
        Column::new("cross_section".into(), cross),
        Column::new("issue".into(), issues),
    ])
    .context("failed to build daily dataframe")?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create daily parquet {}", path.display()))?;
    ParquetWriter::new(&mut file)
        .finish(&mut df)
        .context("failed to write daily parquet")?;
    Ok(())
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Save the full artifact set for a walk-forward run.
///
/// Creates `{alpha}_wf_{timestamp}/` under `output_dir` containing:
/// - `result.json`: the full `WalkForwardResult`
/// - `windows.csv`: one row per window
/// - `test_daily.csv` / `test_daily.parquet`: out-of-sample daily records, window order
/// - `report.md`: Markdown summary
///
/// Returns the path to the created directory.
pub fn save_walk_forward_artifacts(result: &WalkForwardResult, output_dir: &Path) -> Result<PathBuf> {
    let dirname = format!(
        "{}_wf_{}",
        result.alpha,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let run_dir = output_dir.join(dirname);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    std::fs::write(run_dir.join("result.json"), export_json(result)?)?;
    std::fs::write(run_dir.join("windows.csv"), export_windows_csv(result)?)?;

    let test_daily: Vec<DailyRecord> = result
        .windows
        .iter()
        .flat_map(|w| w.test.daily.iter().cloned())
        .collect();
    std::fs::write(run_dir.join("test_daily.csv"), export_daily_csv(&test_daily)?)?;
    write_daily_parquet(&run_dir.join("test_daily.parquet"), &test_daily)?;
    std::fs::write(run_dir.join("report.md"), walk_forward_report(result))?;

    Ok(run_dir)
}

/// Load a `WalkForwardResult` from an artifact directory's result.json.
pub fn load_walk_forward_artifacts(dir: &Path) -> Result<WalkForwardResult> {
    let path = dir.join("result.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    import_json(&json)
}

// ─── Markdown reports ───────────────────────────────────────────────

fn f4(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.4}")
    } else {
        "n/a".to_string()
    }
}

pub fn walk_forward_report(result: &WalkForwardResult) -> String {
    let agg = &result.aggregate;
    let mut md = String::with_capacity(2048);

    md.push_str("# Walk-Forward Report\n\n");
    md.push_str("| Field | Value |\n| --- | --- |\n");
    md.push_str(&format!("| Alpha | {} |\n", result.alpha));
    md.push_str(&format!("| Snapshot | {} |\n", result.snapshot_id.short()));
    md.push_str(&format!(
        "| Schedule | train {}m / test {}m / step {}m |\n",
        result.config.train_months, result.config.test_months, result.config.step_months
    ));
    md.push_str(&format!(
        "| Windows | {} evaluated, {} skipped |\n",
        result.windows.len(),
        result.skipped.len()
    ));
    md.push('\n');

    md.push_str("## Out-of-Sample\n\n");
    md.push_str("| Metric | Value |\n| --- | --- |\n");
    md.push_str(&format!("| Aggregated test IC | {} |\n", f4(agg.aggregated_test_ic)));
    md.push_str(&format!("| Aggregated test ICIR | {} |\n", f4(agg.aggregated_test_icir)));
    md.push_str(&format!("| Mean train IC | {} |\n", f4(agg.mean_train_ic)));
    md.push_str(&format!("| Overfitting ratio | {} |\n", f4(agg.overfitting_ratio)));
    md.push_str(&format!(
        "| Overfit (> {}) | {} |\n",
        result.config.overfitting_threshold,
        if agg.is_overfit { "**YES**" } else { "no" }
    ));
    md.push('\n');

    md.push_str("## Windows\n\n");
    md.push_str("| # | Test period | Params | Train IC | Test IC |\n");
    md.push_str("| --- | --- | --- | --- | --- |\n");
    for w in &result.windows {
        md.push_str(&format!(
            "| {} | {} to {} | {} | {} | {} |\n",
            w.window.index,
            w.window.test_start,
            w.window.test_end,
            factorlab_core::alpha::format_params(&w.selected_params),
            f4(w.train_ic),
            f4(w.test_ic)
        ));
    }
    md.push('\n');

    let stab = &result.stability;
    md.push_str("## Parameter Stability\n\n");
    md.push_str(&format!(
        "{} distinct selections, switch rate {}\n\n",
        stab.distinct_selections,
        f4(stab.switch_rate)
    ));
    for (name, s) in &stab.per_param {
        md.push_str(&format!(
            "- `{name}`: mean {}, std {}, range [{}, {}]\n",
            f4(s.mean),
            f4(s.std),
            f4(s.min),
            f4(s.max)
        ));
    }

    if !result.advisories.is_empty() {
        md.push_str("\n## Advisories\n\n");
        for a in &result.advisories {
            md.push_str(&format!("- {a}\n"));
        }
    }
    md
}

pub fn monte_carlo_report(result: &MonteCarloResult) -> String {
    let mut md = String::with_capacity(1024);
    md.push_str("# Monte Carlo Report\n\n");
    md.push_str(&format!(
        "{} {} simulations over {} observations (seed {}).\n\n",
        result.n_simulations,
        result.method.name(),
        result.n_observations,
        result.seed
    ));
    md.push_str(match result.p_value_meaning {
        PValueMeaning::ResamplingVariance => {
            "p-values measure metric variance under resampling; they are not a test of skill.\n\n"
        }
        PValueMeaning::OrderDependence => {
            "p-values test order dependence: a small value means the realized ordering carries time structure.\n\n"
        }
    });
    md.push_str("| Metric | Observed | p5 | p50 | p95 | p-value |\n");
    md.push_str("| --- | --- | --- | --- | --- | --- |\n");
    for m in &result.metrics {
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            m.metric.name(),
            f4(m.observed),
            f4(m.interval.lower_5),
            f4(m.interval.median),
            f4(m.interval.upper_95),
            f4(m.p_value)
        ));
    }
    md
}

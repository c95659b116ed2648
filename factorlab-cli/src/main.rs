//! FactorLab CLI — window planning, synthetic data, and research runs.
//!
//! Commands:
//! - `windows` — print the walk-forward window plan for a config
//! - `synth` — write a synthetic universe as a CSV directory
//! - `backtest` — run one point-in-time backtest
//! - `walk-forward` — run the walk-forward optimizer and save the artifact bundle
//! - `monte-carlo` — resample a backtest's returns or ICs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use factorlab_core::alpha::{format_params, AlphaFactory, BuiltinAlphaFactory, ParamSet};
use factorlab_core::data::{write_csv_dir, SyntheticUniverse, VersionCheckedProvider};
use factorlab_runner::backtest::{BacktestResult, PitBacktester};
use factorlab_runner::config::{OpenedData, RunConfig};
use factorlab_runner::export::{
    export_daily_csv, export_json, export_monte_carlo_csv, monte_carlo_report,
    save_walk_forward_artifacts,
};
use factorlab_runner::monte_carlo::{MonteCarloSimulator, ResampleMethod, SeriesKind};
use factorlab_runner::walk_forward::{generate_windows, WalkForwardOptimizer, WalkForwardResult};

#[derive(Parser)]
#[command(
    name = "factorlab",
    about = "FactorLab CLI — point-in-time alpha research: backtests, walk-forward, Monte Carlo"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Series {
    Returns,
    Ic,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the walk-forward window plan.
    Windows {
        /// Path to a TOML run config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the period start (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Override the period end (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,
    },
    /// Write a synthetic universe as a CSV directory.
    Synth {
        /// Output directory for prices.csv, fundamentals.csv and securities.csv.
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 30)]
        n_securities: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// First date (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Last date (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,
    },
    /// Run one point-in-time backtest over the configured period.
    Backtest {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Parameters as `name=value` pairs, comma separated (e.g. lookback=60,skip=5).
        /// Defaults to the alpha's built-in defaults.
        #[arg(long)]
        params: Option<String>,

        /// Output directory for result JSON and daily CSV.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Run the walk-forward optimizer and save the artifact bundle.
    WalkForward {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Restarts under a fresh snapshot when the data changes mid-run.
        #[arg(long, default_value_t = 1)]
        max_restarts: u32,

        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Backtest the configured alpha and resample its series.
    MonteCarlo {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        params: Option<String>,

        /// Series to resample.
        #[arg(long, value_enum, default_value_t = Series::Returns)]
        series: Series,

        /// Overrides the config's resampling method (bootstrap | shuffle).
        #[arg(long)]
        method: Option<String>,

        /// Overrides the config's seed.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "factorlab=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Windows { config, start, end } => run_windows(config, start, end),
        Commands::Synth {
            out,
            n_securities,
            seed,
            start,
            end,
        } => run_synth(&out, n_securities, seed, start, end),
        Commands::Backtest {
            config,
            params,
            output_dir,
        } => run_backtest_cmd(config, params, &output_dir),
        Commands::WalkForward {
            config,
            max_restarts,
            output_dir,
        } => run_walk_forward_cmd(config, max_restarts, &output_dir),
        Commands::MonteCarlo {
            config,
            params,
            series,
            method,
            seed,
            output_dir,
        } => run_monte_carlo_cmd(config, params, series, method, seed, &output_dir),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

/// Parse `lookback=60,skip=5` into a parameter set.
fn parse_params(pairs: &str) -> Result<ParamSet> {
    let mut params = ParamSet::new();
    for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("parameter '{pair}' is not of the form name=value");
        };
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("parameter '{name}' has a non-numeric value"))?;
        params.insert(name.trim().to_string(), value);
    }
    Ok(params)
}

fn run_windows(config: Option<PathBuf>, start: Option<String>, end: Option<String>) -> Result<()> {
    let config = load_config(config)?;
    let start = start.as_deref().map(parse_date).transpose()?.unwrap_or(config.period.start);
    let end = end.as_deref().map(parse_date).transpose()?.unwrap_or(config.period.end);
    let plan = generate_windows(start, end, &config.walk_forward)?;

    println!(
        "{:<4} {:<23} {:<23} {}",
        "#", "Train", "Test", "Status"
    );
    println!("{}", "-".repeat(64));
    let mut rows: Vec<(usize, String)> = plan
        .windows
        .iter()
        .map(|w| {
            (
                w.index,
                format!(
                    "{:<4} {} to {} {} to {} evaluate",
                    w.index, w.train_start, w.train_end, w.test_start, w.test_end
                ),
            )
        })
        .collect();
    rows.extend(plan.skipped.iter().map(|s| {
        let w = &s.window;
        (
            w.index,
            format!(
                "{:<4} {} to {} {} to {} skip ({:?})",
                w.index, w.train_start, w.train_end, w.test_start, w.test_end, s.reason
            ),
        )
    }));
    rows.sort_by_key(|(index, _)| *index);
    for (_, row) in rows {
        println!("{row}");
    }
    for advisory in &plan.advisories {
        println!("NOTE: {advisory}");
    }
    Ok(())
}

fn run_synth(
    out: &Path,
    n_securities: usize,
    seed: u64,
    start: Option<String>,
    end: Option<String>,
) -> Result<()> {
    let defaults = SyntheticUniverse::default();
    let universe = SyntheticUniverse {
        n_securities,
        seed,
        start: start.as_deref().map(parse_date).transpose()?.unwrap_or(defaults.start),
        end: end.as_deref().map(parse_date).transpose()?.unwrap_or(defaults.end),
        ..defaults
    };
    let dump = universe.generate_dump()?;
    write_csv_dir(out, &dump)?;
    println!(
        "Wrote {} securities, {} prices, {} fundamentals to {}",
        dump.securities.len(),
        dump.prices.len(),
        dump.fundamentals.len(),
        out.display()
    );
    Ok(())
}

/// Backtest `params` over the configured period under a fresh snapshot.
fn backtest_once(config: &RunConfig, data: &OpenedData, params: &ParamSet) -> Result<BacktestResult> {
    let factory = BuiltinAlphaFactory::from_name(&config.alpha.name)?;
    let scorer = factory.build(params)?;
    let range = config.period.range()?;

    let snapshot = data.snapshots.lock()?;
    let guarded = VersionCheckedProvider::new(data.provider.clone(), data.snapshots.clone());
    let result = PitBacktester::new(&guarded, &config.backtest).run(scorer.as_ref(), params, range, &snapshot);
    data.snapshots.release(&snapshot);
    Ok(result?)
}

fn run_backtest_cmd(config: Option<PathBuf>, params: Option<String>, output_dir: &Path) -> Result<()> {
    let config = load_config(config)?;
    let params = params.as_deref().map(parse_params).transpose()?.unwrap_or_default();
    let data = config.data.open()?;
    let result = backtest_once(&config, &data, &params)?;

    print_backtest_summary(&result);

    std::fs::create_dir_all(output_dir)?;
    let stem = format!("{}_bt_{}", result.alpha, &result.params_hash);
    let json_path = output_dir.join(format!("{stem}.json"));
    std::fs::write(&json_path, export_json(&result)?)?;
    std::fs::write(output_dir.join(format!("{stem}_daily.csv")), export_daily_csv(&result.daily)?)?;
    println!("Result saved to: {}", json_path.display());
    Ok(())
}

fn run_walk_forward_cmd(config: Option<PathBuf>, max_restarts: u32, output_dir: &Path) -> Result<()> {
    let config = load_config(config)?;
    let factory = BuiltinAlphaFactory::from_name(&config.alpha.name)?;
    let mut attempt = 0;
    let result = loop {
        // Reload on every attempt so a restart reads the data its snapshot locks.
        let data = config.data.open()?;
        let optimizer = WalkForwardOptimizer::new(
            data.provider.clone(),
            Arc::clone(&data.snapshots),
            config.walk_forward.clone(),
            config.backtest.clone(),
        );
        match optimizer.run(&factory, &config.alpha.grid, config.period.start, config.period.end) {
            Ok(result) => break result,
            Err(e) if e.manifest_changed() && attempt < max_restarts => {
                attempt += 1;
                warn!(attempt, error = %e, "data changed during run; restarting under a fresh snapshot");
            }
            Err(e) => return Err(e.into()),
        }
    };

    print_walk_forward_summary(&result);
    let run_dir = save_walk_forward_artifacts(&result, output_dir)?;
    println!("Artifacts saved to: {}", run_dir.display());
    Ok(())
}

fn run_monte_carlo_cmd(
    config: Option<PathBuf>,
    params: Option<String>,
    series: Series,
    method: Option<String>,
    seed: Option<u64>,
    output_dir: &Path,
) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(method) = method {
        config.monte_carlo.method = method.parse::<ResampleMethod>()?;
    }
    if seed.is_some() {
        config.monte_carlo.random_seed = seed;
    }
    let params = params.as_deref().map(parse_params).transpose()?.unwrap_or_default();
    let data = config.data.open()?;
    let backtest = backtest_once(&config, &data, &params)?;

    let kind = match series {
        Series::Returns => SeriesKind::Returns,
        Series::Ic => SeriesKind::Ic,
    };
    let simulator = MonteCarloSimulator::new(config.monte_carlo.clone())?;
    let result = simulator.simulate_backtest(&backtest, kind)?;
    info!(seed = result.seed, "monte carlo seed recorded");

    let report = monte_carlo_report(&result);
    println!("{report}");

    std::fs::create_dir_all(output_dir)?;
    let stem = format!(
        "{}_mc_{}_{}",
        backtest.alpha,
        result.method.name(),
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    std::fs::write(output_dir.join(format!("{stem}.json")), export_json(&result)?)?;
    std::fs::write(output_dir.join(format!("{stem}.csv")), export_monte_carlo_csv(&result)?)?;
    std::fs::write(output_dir.join(format!("{stem}.md")), report)?;
    println!("Results saved to: {}", output_dir.join(stem).display());
    Ok(())
}

fn fmt4(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.4}")
    } else {
        "n/a".into()
    }
}

fn print_backtest_summary(result: &BacktestResult) {
    let s = &result.summary;
    println!();
    println!("=== Backtest Result ===");
    println!("Alpha:          {} ({})", result.alpha, format_params(&result.params));
    println!("Period:         {} to {}", result.range.start, result.range.end);
    println!("Snapshot:       {}", result.snapshot_id.short());
    println!("Days:           {} ({} with IC)", s.n_days, s.n_valid_ic);
    println!();
    println!("--- Signal ---");
    println!("Mean IC:        {}", fmt4(s.mean_ic));
    println!("IC Std:         {}", fmt4(s.ic_std));
    println!("ICIR:           {}", fmt4(s.icir));
    println!("IC Coverage:    {:.1}%", s.ic_coverage * 100.0);
    println!();
    println!("--- Long/Short ---");
    println!("Total Return:   {:.2}%", s.total_return * 100.0);
    println!("Sharpe:         {}", fmt4(s.sharpe));
    println!("Max Drawdown:   {:.2}%", s.max_drawdown * 100.0);
    println!();
}

fn print_walk_forward_summary(result: &WalkForwardResult) {
    let agg = &result.aggregate;
    println!();
    println!("=== Walk-Forward Result ===");
    println!("Alpha:          {}", result.alpha);
    println!("Snapshot:       {}", result.snapshot_id.short());
    println!(
        "Windows:        {} evaluated, {} skipped",
        result.windows.len(),
        result.skipped.len()
    );
    println!("Test IC:        {}", fmt4(agg.aggregated_test_ic));
    println!("Test ICIR:      {}", fmt4(agg.aggregated_test_icir));
    println!("Train IC:       {}", fmt4(agg.mean_train_ic));
    println!("Overfit Ratio:  {}", fmt4(agg.overfitting_ratio));
    if agg.is_overfit {
        println!();
        println!(
            "WARNING: train IC exceeds test IC by more than {}x",
            result.config.overfitting_threshold
        );
    }
    for advisory in &result.advisories {
        println!("NOTE: {advisory}");
    }
    println!();
}

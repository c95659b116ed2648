//! TOML run configuration.
//!
//! ```toml
//! [data]
//! source = "synthetic"
//! n_securities = 40
//! seed = 7
//!
//! [alpha]
//! name = "momentum"
//! grid = { lookback = [20, 60, 120], skip = [0, 5] }
//!
//! [period]
//! start = "2019-01-01"
//! end = "2021-12-31"
//!
//! [walk_forward]
//! train_months = 12
//! test_months = 3
//! step_months = 3
//!
//! [monte_carlo]
//! n_simulations = 1000
//! method = "shuffle"
//! random_seed = 42
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use factorlab_core::alpha::{BuiltinAlpha, ParamGrid};
use factorlab_core::data::{open_csv_dir, DataError, DataProvider, SyntheticUniverse};
use factorlab_core::domain::DateRange;
use factorlab_core::snapshot::{ManifestSource, SnapshotManager};

use crate::backtest::BacktestSettings;
use crate::monte_carlo::MonteCarloConfig;
use crate::walk_forward::WalkForwardConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where a run reads its datasets from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DataSource {
    /// Directory holding `prices.csv`, `securities.csv` and optionally `fundamentals.csv`.
    Csv { dir: PathBuf },
    Synthetic(SyntheticUniverse),
}

impl Default for DataSource {
    fn default() -> Self {
        Self::Synthetic(SyntheticUniverse::default())
    }
}

/// A provider plus the snapshot manager watching its manifests.
pub struct OpenedData {
    pub provider: Arc<dyn DataProvider>,
    pub snapshots: Arc<SnapshotManager>,
}

impl DataSource {
    /// Load the datasets and attach a snapshot manager.
    ///
    /// CSV data is read into memory once. Snapshots lock the hashes of the bytes
    /// that were read and verify against the files, so a rewrite at any point
    /// after loading fails the run; open again to pick up the new version.
    pub fn open(&self) -> Result<OpenedData, DataError> {
        match self {
            Self::Csv { dir } => {
                let (store, manifests) = open_csv_dir(dir)?;
                let provider = Arc::new(store);
                let manifests: Arc<dyn ManifestSource> = Arc::new(manifests);
                Ok(OpenedData {
                    provider,
                    snapshots: Arc::new(SnapshotManager::new(manifests)),
                })
            }
            Self::Synthetic(universe) => {
                let store = Arc::new(universe.generate()?);
                Ok(OpenedData {
                    provider: store.clone(),
                    snapshots: Arc::new(SnapshotManager::new(store)),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaSection {
    pub name: String,
    /// Parameter axes; an empty grid runs the alpha with its defaults.
    #[serde(default)]
    pub grid: ParamGrid,
}

impl Default for AlphaSection {
    fn default() -> Self {
        Self {
            name: BuiltinAlpha::Momentum.name().to_string(),
            grid: ParamGrid::new().with_axis("lookback", vec![20.0, 60.0]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodSection {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Default for PeriodSection {
    fn default() -> Self {
        let universe = SyntheticUniverse::default();
        Self {
            start: universe.start,
            end: universe.end,
        }
    }
}

impl PeriodSection {
    pub fn range(&self) -> Result<DateRange, ConfigError> {
        DateRange::new(self.start, self.end).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Everything needed to reproduce a research run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub data: DataSource,
    #[serde(default)]
    pub alpha: AlphaSection,
    #[serde(default)]
    pub period: PeriodSection,
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub walk_forward: WalkForwardConfig,
    #[serde(default)]
    pub monte_carlo: MonteCarloConfig,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |e: &dyn std::fmt::Display| ConfigError::Invalid(e.to_string());
        self.period.range()?;
        self.alpha.name.parse::<BuiltinAlpha>().map_err(|e| invalid(&e))?;
        self.backtest.validate().map_err(|e| invalid(&e))?;
        self.walk_forward.validate().map_err(|e| invalid(&e))?;
        self.monte_carlo.validate().map_err(|e| invalid(&e))?;
        match &self.data {
            DataSource::Csv { dir } if dir.as_os_str().is_empty() => {
                Err(ConfigError::Invalid("data.dir must not be empty".into()))
            }
            DataSource::Csv { .. } => Ok(()),
            DataSource::Synthetic(universe) => universe.validate().map_err(|e| invalid(&e)),
        }
    }

    /// Deterministic hash of the full configuration.
    pub fn config_hash(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_string(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

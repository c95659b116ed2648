//! CSV directory backend.
//!
//! Layout: `{dir}/prices.csv`, `{dir}/fundamentals.csv`, `{dir}/securities.csv`,
//! one header row each, columns named after the record fields. Files are read
//! into an [`InMemoryProvider`]; [`FileManifestSource`] hashes the files on
//! disk so a rewrite after lock is detected by the snapshot manager.
//!
//! [`open_csv_dir`] hashes the exact bytes it parsed and pins them in the
//! returned manifest source. A snapshot locked later records the version the
//! provider actually serves, so a rewrite between load and lock fails the
//! first verification instead of being locked as current.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::memory::{DatasetDump, InMemoryProvider};
use super::provider::DataError;
use crate::domain::{dataset, ManifestHash};
use crate::snapshot::ManifestSource;

/// Path of a dataset file inside a data directory.
pub fn dataset_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.csv"))
}

/// Load all three datasets from `dir`. `fundamentals.csv` is optional.
pub fn load_csv_dir(dir: &Path) -> Result<InMemoryProvider, DataError> {
    open_csv_dir(dir).map(|(provider, _)| provider)
}

/// Load `dir` and return the provider with a manifest source pinned to the
/// loaded bytes.
pub fn open_csv_dir(dir: &Path) -> Result<(InMemoryProvider, FileManifestSource), DataError> {
    let mut loaded = BTreeMap::new();
    let (securities, hash) = read_dataset(&dataset_path(dir, dataset::SECURITIES))?;
    loaded.insert(dataset::SECURITIES.to_string(), hash);
    let (prices, hash) = read_dataset(&dataset_path(dir, dataset::PRICES))?;
    loaded.insert(dataset::PRICES.to_string(), hash);
    let fundamentals = match read_dataset(&dataset_path(dir, dataset::FUNDAMENTALS)) {
        Ok((records, hash)) => {
            loaded.insert(dataset::FUNDAMENTALS.to_string(), hash);
            records
        }
        Err(DataError::DatasetMissing(_)) => {
            loaded.insert(dataset::FUNDAMENTALS.to_string(), ManifestHash::missing());
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    info!(
        dir = %dir.display(),
        securities = securities.len(),
        prices = prices.len(),
        fundamentals = fundamentals.len(),
        "loaded CSV dataset"
    );

    let provider = InMemoryProvider::from_dump(
        format!("csv:{}", dir.display()),
        DatasetDump {
            prices,
            fundamentals,
            securities,
        },
    )?;
    Ok((provider, FileManifestSource::pinned(dir, loaded)))
}

/// Write a store's contents as a CSV directory.
pub fn write_csv_dir(dir: &Path, dump: &DatasetDump) -> Result<(), DataError> {
    fs::create_dir_all(dir).map_err(|e| DataError::Io(format!("create {}: {e}", dir.display())))?;
    write_records(&dataset_path(dir, dataset::SECURITIES), &dump.securities)?;
    write_records(&dataset_path(dir, dataset::PRICES), &dump.prices)?;
    write_records(&dataset_path(dir, dataset::FUNDAMENTALS), &dump.fundamentals)?;
    Ok(())
}

/// Parse a dataset file and hash the bytes that were parsed.
fn read_dataset<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, ManifestHash), DataError> {
    let file = path.display().to_string();
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DataError::DatasetMissing(file.clone()),
        _ => DataError::Io(format!("open {file}: {e}")),
    })?;
    let records = csv::Reader::from_reader(bytes.as_slice())
        .deserialize()
        .map(|row| {
            row.map_err(|e| DataError::Parse {
                file: file.clone(),
                message: e.to_string(),
            })
        })
        .collect::<Result<Vec<T>, DataError>>()?;
    Ok((records, ManifestHash::from_bytes(&bytes)))
}

fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<(), DataError> {
    let file = path.display().to_string();
    let tmp_path = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp_path)
        .map_err(|e| DataError::Io(format!("create {file}: {e}")))?;
    for rec in records {
        writer
            .serialize(rec)
            .map_err(|e| DataError::Io(format!("write {file}: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| DataError::Io(format!("flush {file}: {e}")))?;
    drop(writer);

    // Atomic rename
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::Io(format!("atomic rename failed for {file}: {e}"))
    })
}

/// Manifest source that hashes dataset files on disk.
///
/// A pinned source also remembers the hashes of the bytes a provider was
/// loaded from; locks record those, verification compares against the disk.
#[derive(Debug, Clone)]
pub struct FileManifestSource {
    dir: PathBuf,
    loaded: Option<BTreeMap<String, ManifestHash>>,
}

impl FileManifestSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: None,
        }
    }

    pub fn pinned(dir: impl Into<PathBuf>, loaded: BTreeMap<String, ManifestHash>) -> Self {
        Self {
            dir: dir.into(),
            loaded: Some(loaded),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ManifestSource for FileManifestSource {
    fn datasets(&self) -> Vec<String> {
        if let Some(loaded) = &self.loaded {
            return loaded.keys().cloned().collect();
        }
        dataset::ALL
            .iter()
            .filter(|name| dataset_path(&self.dir, name).exists())
            .map(|name| name.to_string())
            .collect()
    }

    fn served_manifest(&self, name: &str) -> Result<ManifestHash, DataError> {
        match self.loaded.as_ref().and_then(|loaded| loaded.get(name)) {
            Some(hash) => Ok(hash.clone()),
            None => self.manifest(name),
        }
    }

    fn manifest(&self, name: &str) -> Result<ManifestHash, DataError> {
        let path = dataset_path(&self.dir, name);
        match fs::read(&path) {
            Ok(bytes) => Ok(ManifestHash::from_bytes(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DataError::DatasetMissing(name.to_string()))
            }
            Err(e) => Err(DataError::Io(format!("read {}: {e}", path.display()))),
        }
    }
}

//! Snapshot Manager — lock an immutable view of all datasets for one run.
//!
//! `lock()` captures the manifest hash of every dataset the source exposes and
//! hands back a `SnapshotId`. Every data access of the run carries that id;
//! `verify()` re-reads the manifests and fails with
//! `DataError::ManifestVersionChanged` if any hash moved. Once a snapshot has
//! failed verification it stays invalidated: later calls fail with the same
//! error even if the data is restored, so a run can never mix versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::DataError;
use crate::domain::{ManifestHash, SnapshotId};

/// Source of dataset manifests (in-memory store, files on disk, ...).
pub trait ManifestSource: Send + Sync {
    /// Names of every dataset this source can describe.
    fn datasets(&self) -> Vec<String>;

    /// Current manifest hash of `dataset`. `DataError::DatasetMissing` if it is gone.
    fn manifest(&self, dataset: &str) -> Result<ManifestHash, DataError>;

    /// Manifest of the version readers are served. Locks record this one.
    ///
    /// Sources that read the live data on every query serve the current version.
    fn served_manifest(&self, dataset: &str) -> Result<ManifestHash, DataError> {
        self.manifest(dataset)
    }
}

/// A locked, immutable view of the datasets touched by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub locked_at: NaiveDateTime,
    pub manifests: BTreeMap<String, ManifestHash>,
}

/// First manifest change observed for an invalidated snapshot.
#[derive(Debug, Clone, PartialEq)]
struct ManifestChange {
    dataset: String,
    locked: ManifestHash,
    current: ManifestHash,
}

#[derive(Debug, Default)]
struct Registry {
    locked: HashMap<SnapshotId, Snapshot>,
    invalidated: HashMap<SnapshotId, ManifestChange>,
    sequence: u64,
}

/// Registry of locked snapshots over a single manifest source.
pub struct SnapshotManager {
    source: Arc<dyn ManifestSource>,
    registry: RwLock<Registry>,
}

impl SnapshotManager {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self {
            source,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Lock every dataset the source lists.
    pub fn lock(&self) -> Result<SnapshotId, DataError> {
        let datasets = self.source.datasets();
        let names: Vec<&str> = datasets.iter().map(String::as_str).collect();
        self.lock_datasets(&names)
    }

    /// Lock a subset of datasets.
    pub fn lock_datasets(&self, datasets: &[&str]) -> Result<SnapshotId, DataError> {
        let mut manifests = BTreeMap::new();
        for &name in datasets {
            manifests.insert(name.to_string(), self.source.served_manifest(name)?);
        }

        let locked_at = chrono::Utc::now().naive_utc();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.sequence += 1;

        // Hash the manifests together with the lock sequence so two locks over
        // identical data still get distinct ids.
        let mut hasher = blake3::Hasher::new();
        for (name, hash) in &manifests {
            hasher.update(name.as_bytes());
            hasher.update(hash.0.as_bytes());
        }
        hasher.update(&registry.sequence.to_le_bytes());
        hasher.update(locked_at.to_string().as_bytes());
        let id = SnapshotId(hasher.finalize().to_hex().to_string());

        debug!(snapshot = id.short(), datasets = manifests.len(), "snapshot locked");
        registry.locked.insert(
            id.clone(),
            Snapshot {
                id: id.clone(),
                locked_at,
                manifests,
            },
        );
        Ok(id)
    }

    /// The locked record for `id`.
    pub fn snapshot(&self, id: &SnapshotId) -> Result<Snapshot, DataError> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .locked
            .get(id)
            .cloned()
            .ok_or_else(|| DataError::UnknownSnapshot(id.clone()))
    }

    /// Re-read every locked manifest and fail if any changed.
    pub fn verify(&self, id: &SnapshotId) -> Result<(), DataError> {
        let manifests = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(change) = registry.invalidated.get(id) {
                return Err(change_error(id, change));
            }
            match registry.locked.get(id) {
                Some(snapshot) => snapshot.manifests.clone(),
                None => return Err(DataError::UnknownSnapshot(id.clone())),
            }
        };

        for (dataset, locked) in &manifests {
            let current = match self.source.manifest(dataset) {
                Ok(hash) => hash,
                Err(DataError::DatasetMissing(_)) => ManifestHash::missing(),
                Err(e) => return Err(e),
            };
            if &current != locked {
                let change = ManifestChange {
                    dataset: dataset.clone(),
                    locked: locked.clone(),
                    current,
                };
                return Err(self.invalidate(id, change));
            }
        }
        Ok(())
    }

    /// True once `verify` has observed a manifest change for `id`.
    pub fn is_invalidated(&self, id: &SnapshotId) -> bool {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.invalidated.contains_key(id)
    }

    /// Drop a snapshot from the registry. Later verifies report it as unknown.
    pub fn release(&self, id: &SnapshotId) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.locked.remove(id);
        registry.invalidated.remove(id);
    }

    fn invalidate(&self, id: &SnapshotId, change: ManifestChange) -> DataError {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have recorded a change first; keep the first one.
        let first = registry
            .invalidated
            .entry(id.clone())
            .or_insert_with(|| {
                warn!(
                    snapshot = id.short(),
                    dataset = %change.dataset,
                    "manifest changed after lock; snapshot invalidated"
                );
                change
            })
            .clone();
        change_error(id, &first)
    }
}

fn change_error(id: &SnapshotId, change: &ManifestChange) -> DataError {
    DataError::ManifestVersionChanged {
        snapshot_id: id.clone(),
        dataset: change.dataset.clone(),
        locked: change.locked.clone(),
        current: change.current.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Manifest source backed by a mutable map.
    struct MapSource {
        hashes: Mutex<BTreeMap<String, String>>,
    }

    impl MapSource {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                hashes: Mutex::new(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            })
        }

        fn set(&self, dataset: &str, content: &str) {
            self.hashes
                .lock()
                .unwrap()
                .insert(dataset.to_string(), content.to_string());
        }

        fn remove(&self, dataset: &str) {
            self.hashes.lock().unwrap().remove(dataset);
        }
    }

    impl ManifestSource for MapSource {
        fn datasets(&self) -> Vec<String> {
            self.hashes.lock().unwrap().keys().cloned().collect()
        }

        fn manifest(&self, dataset: &str) -> Result<ManifestHash, DataError> {
            self.hashes
                .lock()
                .unwrap()
                .get(dataset)
                .map(|c| ManifestHash::from_bytes(c.as_bytes()))
                .ok_or_else(|| DataError::DatasetMissing(dataset.to_string()))
        }
    }

    #[test]
    fn lock_captures_all_datasets() {
        let source = MapSource::new(&[("prices", "v1"), ("securities", "v1")]);
        let manager = SnapshotManager::new(source);
        let id = manager.lock().unwrap();
        let snap = manager.snapshot(&id).unwrap();
        assert_eq!(snap.manifests.len(), 2);
        assert!(snap.manifests.contains_key("prices"));
    }

    #[test]
    fn verify_passes_without_mutation() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source);
        let id = manager.lock().unwrap();
        assert!(manager.verify(&id).is_ok());
        assert!(manager.verify(&id).is_ok());
    }

    #[test]
    fn verify_detects_mutation() {
        let source = MapSource::new(&[("prices", "v1"), ("securities", "v1")]);
        let manager = SnapshotManager::new(source.clone());
        let id = manager.lock().unwrap();
        source.set("securities", "v2");
        match manager.verify(&id) {
            Err(DataError::ManifestVersionChanged { dataset, .. }) => {
                assert_eq!(dataset, "securities")
            }
            other => panic!("expected manifest change, got {other:?}"),
        }
        assert!(manager.is_invalidated(&id));
    }

    #[test]
    fn invalidation_is_sticky_after_revert() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source.clone());
        let id = manager.lock().unwrap();
        source.set("prices", "v2");
        assert!(manager.verify(&id).is_err());
        source.set("prices", "v1");
        let err = manager.verify(&id).unwrap_err();
        assert!(err.is_manifest_changed());
    }

    #[test]
    fn removed_dataset_counts_as_change() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source.clone());
        let id = manager.lock().unwrap();
        source.remove("prices");
        match manager.verify(&id).unwrap_err() {
            DataError::ManifestVersionChanged { current, .. } => {
                assert_eq!(current, ManifestHash::missing())
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn fresh_lock_after_change_is_valid() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source.clone());
        let old = manager.lock().unwrap();
        source.set("prices", "v2");
        assert!(manager.verify(&old).is_err());

        let fresh = manager.lock().unwrap();
        assert_ne!(old, fresh);
        assert!(manager.verify(&fresh).is_ok());
    }

    #[test]
    fn locks_over_identical_data_get_distinct_ids() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source);
        let a = manager.lock().unwrap();
        let b = manager.lock().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn released_snapshot_is_unknown() {
        let source = MapSource::new(&[("prices", "v1")]);
        let manager = SnapshotManager::new(source);
        let id = manager.lock().unwrap();
        manager.release(&id);
        assert!(matches!(
            manager.verify(&id),
            Err(DataError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn lock_datasets_captures_subset_only() {
        let source = MapSource::new(&[("prices", "v1"), ("fundamentals", "v1")]);
        let manager = SnapshotManager::new(source.clone());
        let id = manager.lock_datasets(&["prices"]).unwrap();
        // Fundamentals were not locked, so mutating them does not invalidate.
        source.set("fundamentals", "v2");
        assert!(manager.verify(&id).is_ok());
    }
}

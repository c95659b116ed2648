//! Point-in-time data access: provider contract, backends, snapshot checking.

pub mod csv_dir;
pub mod guarded;
pub mod memory;
pub mod provider;
pub mod synthetic;

pub use csv_dir::{load_csv_dir, open_csv_dir, write_csv_dir, FileManifestSource};
pub use guarded::VersionCheckedProvider;
pub use memory::{DatasetDump, InMemoryProvider};
pub use provider::{DataError, DataProvider};
pub use synthetic::SyntheticUniverse;

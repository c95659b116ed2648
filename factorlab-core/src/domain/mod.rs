//! Domain types: point-in-time records and content-addressed ids.

pub mod ids;
pub mod records;

pub use ids::{dataset, ManifestHash, SnapshotId};
pub use records::{DateRange, DateRangeError, FundamentalRecord, PriceRecord, Security};

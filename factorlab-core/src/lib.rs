//! FactorLab Core — point-in-time data, snapshots, and the alpha contract.
//!
//! This crate contains the pieces every research run depends on:
//! - Domain records (prices, fundamentals, security master) with availability dates
//! - Snapshot Manager locking dataset manifests for the lifetime of a run
//! - Data providers (in-memory, CSV directory, synthetic) and a snapshot-checked wrapper
//! - Alpha factories and scorers that only ever see a point-in-time view
//! - Deterministic RNG hierarchy

pub mod alpha;
pub mod data;
pub mod domain;
pub mod rng;
pub mod snapshot;

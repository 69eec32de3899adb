//! # regtriage - registry hive triage
//!
//! Snapshots the live SAM, SYSTEM, SOFTWARE, SECURITY and DEFAULT hives (or
//! takes hive files supplied by the caller), decodes every key, and writes one
//! normalized CSV per hive: `Timestamp`, `Path`, then one column per value name,
//! newest keys first.
//!
//! ## Pipeline
//!
//! - [`privilege`]: elevation check and elevated relaunch
//! - [`snapshot`]: live hive copies through `reg save`
//! - [`registry`]: offline regf decoder behind the [`registry::HiveDecoder`] trait
//! - [`normalize`]: record flattening, column cleanup and timestamp formatting
//! - [`output`]: CSV and JSON summary writers
//! - [`app`]: bounded worker pool with per-hive failure isolation

pub mod app;
pub mod cli;
pub mod datetime;
pub mod error;
pub mod normalize;
pub mod output;
pub mod privilege;
pub mod registry;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod test_support;

pub use app::App;
pub use error::{Error, Result};
pub use normalize::{normalize, NormalizedTable};
pub use registry::{HiveDecoder, RegfDecoder};
pub use snapshot::{RegSave, Snapshotter};
pub use types::{HiveKind, HiveOutcome, HiveRequest, KeyRecord, RunReport};

//! Chart acquisition core for chart-cache.
//!
//! This crate provides the building blocks required to resolve the newest
//! published chart release, download chart archives together with their
//! checksum sidecars, verify their integrity, maintain an on-disk cache of
//! verified archives, and unpack them for consumers.

pub mod charts;
pub mod config;
pub mod error;

pub use charts::{ArtifactDescriptor, ChartAcquirer, ChartCache, PruneReport, ReleaseInfo};
pub use config::ChartConfig;
pub use error::{ChartError, ChartErrorKind};

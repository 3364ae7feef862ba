//! # Data Ingestors Module
//!
//! Upstream clients that produce resource snapshots for the engine. Each
//! ingestor implements [`MetricsFetcher`](crate::core::fetcher::MetricsFetcher)
//! and knows nothing about scheduling, caching or subscribers.
//!
//! ## Contained Modules:
//! - **`pve_resources`**: Polls a hypervisor host's cluster resources
//!   endpoint with an API token and normalizes the result.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The cluster resources fetcher.
pub mod pve_resources;

// --- Public API Re-exports ---
pub use pve_resources::PveResourceFetcher;

//! # lib_common
//!
//! Shared building blocks of the node metrics dashboard backend, gated per
//! folder by cargo features:
//!
//! - `core`: host directory, snapshot cache, subscription registry,
//!   dispatcher, polling scheduler and connection sessions.
//! - `retrieve`: the HTTP API client.
//! - `ingestors`: the hypervisor cluster-resources fetcher.
//! - `loggers`: console plus rotated-file logging.
//! - `testing`: a scripted in-memory fetcher for tests.

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "retrieve")]
pub mod retrieve;

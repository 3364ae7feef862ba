//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the upstream ingestors.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A `reqwest`-based `ApiClient` with base URL joining,
//!   token authentication, a hard per-request timeout and optional acceptance
//!   of self-signed certificates.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic single-attempt HTTP API client.
pub mod ky_http;

pub use ky_http::{pve_token_authorization, ApiClient, ApiResponse, ClientOptions, HttpError};

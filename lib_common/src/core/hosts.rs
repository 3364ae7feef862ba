//! # Host Directory
//!
//! The set of hypervisor hosts the engine knows about. The directory itself is
//! a plain map; the scheduler owns it and pairs every entry with exactly one
//! polling task.
//!
//! Host identifiers are restricted to `[A-Za-z0-9_.-]` so they can travel in
//! URL paths and log lines unescaped. Base URLs must be absolute `http` or
//! `https` URLs.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::core::model::{HostConfig, HostSummary};

/// Rejected host directory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// A host with this id is already registered.
    #[error("host '{0}' is already registered")]
    DuplicateHost(String),
    /// No host with this id is registered.
    #[error("host '{0}' is not registered")]
    UnknownHost(String),
    /// The id is empty or contains characters outside `[A-Za-z0-9_.-]`.
    #[error("invalid host id '{0}': use letters, digits, '_', '.' or '-'")]
    InvalidHostId(String),
    /// The base URL is not an absolute http(s) URL.
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// Offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Invalid engine or server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The poll interval leaves no room for a full fetch timeout.
    #[error("poll interval {interval:?} must be at least twice the fetch timeout {timeout:?}")]
    IntervalTooShort {
        /// Configured poll interval.
        interval: Duration,
        /// Configured fetch timeout.
        timeout: Duration,
    },
    /// A value is out of range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// A configured host failed validation.
    #[error("invalid host entry: {0}")]
    Host(#[from] HostError),
    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid JSON.
    #[error("failed to parse configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Checks a host id against `[A-Za-z0-9_.-]+`.
pub fn validate_host_id(host_id: &str) -> Result<(), HostError> {
    let valid = !host_id.is_empty()
        && host_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(HostError::InvalidHostId(host_id.to_string()))
    }
}

/// Checks that a base URL is absolute and uses http or https.
pub fn validate_base_url(base_url: &str) -> Result<Url, HostError> {
    let invalid = |reason: &str| HostError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(base_url).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

/// Validates every field of a host configuration.
pub fn validate_host(host: &HostConfig) -> Result<(), HostError> {
    validate_host_id(&host.host_id)?;
    validate_base_url(&host.base_url)?;
    Ok(())
}

/// # Host Directory
///
/// Registered hosts keyed by id, listed in id order.
#[derive(Debug, Default)]
pub struct HostDirectory {
    hosts: BTreeMap<String, HostConfig>,
}

impl HostDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a validated host. Fails on duplicate ids.
    pub fn insert(&mut self, host: HostConfig) -> Result<(), HostError> {
        validate_host(&host)?;
        if self.hosts.contains_key(&host.host_id) {
            return Err(HostError::DuplicateHost(host.host_id));
        }
        self.hosts.insert(host.host_id.clone(), host);
        Ok(())
    }

    /// Changes a host's display name.
    pub fn rename(&mut self, host_id: &str, display_name: &str) -> Result<(), HostError> {
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| HostError::UnknownHost(host_id.to_string()))?;
        host.display_name = display_name.to_string();
        Ok(())
    }

    /// Removes a host, returning its configuration.
    pub fn remove(&mut self, host_id: &str) -> Result<HostConfig, HostError> {
        self.hosts
            .remove(host_id)
            .ok_or_else(|| HostError::UnknownHost(host_id.to_string()))
    }

    /// Looks up a host.
    pub fn get(&self, host_id: &str) -> Option<&HostConfig> {
        self.hosts.get(host_id)
    }

    /// `true` when the host is registered.
    pub fn contains(&self, host_id: &str) -> bool {
        self.hosts.contains_key(host_id)
    }

    /// Client-safe summaries of every host.
    pub fn summaries(&self) -> Vec<HostSummary> {
        self.hosts.values().map(HostConfig::summary).collect()
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// `true` when no host is registered.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[derive(Deserialize)]
struct HostsFile {
    #[serde(default)]
    hosts: Vec<HostConfig>,
}

/// # Load Hosts
///
/// Reads the `hosts` array from a JSON configuration file. Other top-level
/// keys are ignored so the same file can carry server settings. Every entry is
/// validated and duplicate ids are rejected.
pub fn load_hosts_file(path: &Path) -> Result<Vec<HostConfig>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let file: HostsFile = serde_json::from_str(&content)?;
    let mut seen = HostDirectory::new();
    for host in &file.hosts {
        seen.insert(host.clone())?;
    }
    log::info!("Loaded {} host(s) from {}", file.hosts.len(), path.display());
    Ok(file.hosts)
}

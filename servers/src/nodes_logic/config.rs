use anyhow::{Context, Result};
use clap::Parser;
use lib_common::core::hosts::load_hosts_file;
use lib_common::core::{HostConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "nodes.conf.json";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Hypervisor node metrics WebSocket server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "NODES_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "NODES_CONFIG_PATH", help = "Path to the JSON configuration file (settings and hosts).")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "NODES_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "NODES_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "NODES_POLL_INTERVAL_MS", help = "Milliseconds between fetches of a watched host.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "NODES_FETCH_TIMEOUT_MS", help = "Upper bound in milliseconds on one upstream fetch.")]
    pub fetch_timeout_ms: Option<u64>,

    #[clap(long, env = "NODES_CACHE_TTL_MS", help = "Milliseconds a cached snapshot spares an activation fetch.")]
    pub cache_ttl_ms: Option<u64>,

    #[clap(long, env = "NODES_MAX_FAILURES_BEFORE_BACKOFF", help = "Consecutive failures before polling backs off.")]
    pub max_failures_before_backoff: Option<u32>,

    #[clap(long, env = "NODES_BACKOFF_MULTIPLIER", help = "Poll interval multiplier while backing off.")]
    pub backoff_multiplier: Option<u32>,

    #[clap(long, env = "NODES_MAX_BACKOFF_INTERVAL_MS", help = "Ceiling in milliseconds on the backoff interval.")]
    pub max_backoff_interval_ms: Option<u64>,

    #[clap(long, env = "NODES_OUTBOUND_QUEUE_CAPACITY", help = "Messages buffered per client before drops.")]
    pub outbound_queue_capacity: Option<usize>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            fetch_timeout_ms: other.fetch_timeout_ms.or(self.fetch_timeout_ms),
            cache_ttl_ms: other.cache_ttl_ms.or(self.cache_ttl_ms),
            max_failures_before_backoff: other.max_failures_before_backoff.or(self.max_failures_before_backoff),
            backoff_multiplier: other.backoff_multiplier.or(self.backoff_multiplier),
            max_backoff_interval_ms: other.max_backoff_interval_ms.or(self.max_backoff_interval_ms),
            outbound_queue_capacity: other.outbound_queue_capacity.or(self.outbound_queue_capacity),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        let engine = SchedulerConfig::default();
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            poll_interval_ms: Some(millis(engine.poll_interval)),
            fetch_timeout_ms: Some(millis(engine.fetch_timeout)),
            cache_ttl_ms: Some(millis(engine.cache_ttl)),
            max_failures_before_backoff: Some(engine.max_consecutive_failures_before_backoff),
            backoff_multiplier: Some(engine.backoff_multiplier),
            max_backoff_interval_ms: Some(millis(engine.max_backoff_interval)),
            outbound_queue_capacity: Some(engine.outbound_queue_capacity),
            ..Default::default()
        }
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
    pub hosts: Vec<HostConfig>,
    pub tls: Option<(PathBuf, PathBuf)>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Resolves settings from defaults, the JSON configuration file and the
/// command line (which already includes environment variables), in that
/// order of precedence.
pub fn load_config(cli: Config) -> Result<Settings> {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Load from the config file if present. The CLI may point elsewhere.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut hosts = Vec::new();
    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("failed to read {}", config_file_path.display()))?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .with_context(|| format!("failed to parse {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
        hosts = load_hosts_file(&config_file_path)?;
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Override with environment variables and CLI arguments
    current_config = current_config.merge(cli);

    let scheduler = SchedulerConfig {
        poll_interval: Duration::from_millis(current_config.poll_interval_ms.unwrap_or_default()),
        fetch_timeout: Duration::from_millis(current_config.fetch_timeout_ms.unwrap_or_default()),
        cache_ttl: Duration::from_millis(current_config.cache_ttl_ms.unwrap_or_default()),
        max_consecutive_failures_before_backoff: current_config.max_failures_before_backoff.unwrap_or_default(),
        backoff_multiplier: current_config.backoff_multiplier.unwrap_or_default(),
        max_backoff_interval: Duration::from_millis(current_config.max_backoff_interval_ms.unwrap_or_default()),
        outbound_queue_capacity: current_config.outbound_queue_capacity.unwrap_or_default(),
    };
    scheduler.validate()?;

    let tls = match (current_config.tls_cert_path, current_config.tls_key_path) {
        (Some(cert), Some(key)) => Some((cert, key)),
        (None, None) => None,
        _ => anyhow::bail!("TLS needs both a certificate and a key path"),
    };

    Ok(Settings {
        port: current_config.port.unwrap_or(9003),
        config_path: config_file_path,
        log_dir: current_config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: current_config.log_level.unwrap_or_else(|| "info".to_string()),
        scheduler,
        hosts,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Config {
        let mut argv = vec!["server_nodes"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = load_config(cli(&["--config-path", "/nonexistent/nodes.conf.json"])).unwrap();
        assert_eq!(settings.port, 9003);
        assert_eq!(settings.scheduler, SchedulerConfig::default());
        assert!(settings.hosts.is_empty());
        assert!(settings.tls.is_none());
    }

    #[test]
    fn test_file_overrides_defaults_and_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "port": 9100,
                "pollIntervalMs": 30000,
                "logLevel": "debug",
                "hosts": [{{"hostId":"pve-01","displayName":"One","baseUrl":"https://10.0.0.1:8006",
                            "authTokenId":"root@pam!d","authTokenSecret":"x"}}]
            }}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let settings = load_config(cli(&["--config-path", &path, "--port", "9200"])).unwrap();
        assert_eq!(settings.port, 9200);
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.scheduler.poll_interval, Duration::from_millis(30_000));
        assert_eq!(settings.hosts.len(), 1);
        assert_eq!(settings.hosts[0].host_id, "pve-01");
    }

    #[test]
    fn test_invalid_timing_is_rejected() {
        let err = load_config(cli(&[
            "--config-path",
            "/nonexistent/nodes.conf.json",
            "--poll-interval-ms",
            "10000",
            "--fetch-timeout-ms",
            "8000",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("at least twice"));
    }

    #[test]
    fn test_half_configured_tls_is_rejected() {
        let result = load_config(cli(&[
            "--config-path",
            "/nonexistent/nodes.conf.json",
            "--tls-cert-path",
            "/tmp/cert.pem",
        ]));
        assert!(result.is_err());
    }
}

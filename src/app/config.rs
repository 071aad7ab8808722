//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Default cap on buffered response size before switching to streaming capture.
pub const DEFAULT_STREAM_THRESHOLD: usize = 2 * 1024 * 1024;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Outbound request settings (bulk requests, replays)
    pub requests: RequestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Overrides the platform data directory (CA stores, request log)
    pub data_dir: Option<PathBuf>,

    /// Maximum requests kept in the in-memory history
    pub max_history_items: usize,

    /// Append every recorded request as JSON lines to this file
    pub record_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Proxy port
    pub port: u16,

    /// Enable HTTPS interception (blind CONNECT tunnels otherwise)
    pub https_intercept: bool,

    /// Request size limit in bytes
    pub max_request_size: usize,

    /// Responses at or above this size are streamed rather than buffered
    pub stream_threshold: usize,

    /// Upstream proxy (for chaining), e.g. `http://127.0.0.1:3128`
    pub upstream_proxy: Option<String>,

    /// Check upstream server certificates against the Mozilla root set.
    /// Off by default so self-signed and internal targets stay reachable.
    pub verify_upstream_tls: bool,

    /// Domains never captured or intercepted
    pub exclude_domains: Vec<String>,

    /// Regular expressions matched against the full URL; matches bypass capture
    pub passthrough_patterns: Vec<String>,

    /// Initial interactive interception toggles
    pub intercept: InterceptSettings,
}

/// Which directions of traffic are held for the operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSettings {
    pub browser_to_server: bool,
    pub server_to_browser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Worker count for bulk requests and the per-host connection budget
    pub max_connections_per_host: usize,

    /// Idle connections kept per host by the shared pool
    pub max_idle_per_host: usize,

    /// Connect timeout in seconds
    pub connect_timeout: u64,

    /// PEM client certificate presented to upstream servers
    pub client_cert_path: Option<PathBuf>,

    /// PEM private key for `client_cert_path`
    pub client_key_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_history_items: 10_000,
            record_file: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8080,
            https_intercept: true,
            max_request_size: 10 * 1024 * 1024, // 10MB
            stream_threshold: DEFAULT_STREAM_THRESHOLD,
            upstream_proxy: None,
            verify_upstream_tls: false,
            exclude_domains: vec![],
            passthrough_patterns: vec![],
            intercept: InterceptSettings::default(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 2,
            max_idle_per_host: 100,
            connect_timeout: 30,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).map_err(|source| ConfigError::ReadError {
                    path: config_path.display().to_string(),
                    source,
                })?;

            let config: Config = toml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else if path.is_some() {
            Err(ConfigError::NotFound(config_path.display().to_string()).into())
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;

        tracing::info!("Saved configuration to {:?}", config_path);
        Ok(())
    }

    /// Check values the proxy cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.port == 0 {
            return Err(invalid("proxy.port", "cannot be 0"));
        }
        if self.proxy.stream_threshold == 0 {
            return Err(invalid("proxy.stream_threshold", "must be greater than 0"));
        }
        if self.requests.max_connections_per_host == 0 {
            return Err(invalid("requests.max_connections_per_host", "must be greater than 0"));
        }
        if self.requests.client_cert_path.is_some() != self.requests.client_key_path.is_some() {
            return Err(invalid(
                "requests.client_cert_path",
                "client certificate and key must be configured together",
            ));
        }
        for pattern in &self.proxy.passthrough_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(invalid("proxy.passthrough_patterns", &e.to_string()));
            }
        }
        if let Some(upstream) = &self.proxy.upstream_proxy {
            if url::Url::parse(upstream).is_err() {
                return Err(invalid("proxy.upstream_proxy", "must be a URL such as http://host:port"));
            }
        }
        Ok(())
    }

    /// Data directory, honouring the `general.data_dir` override
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.general.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::data_dir(),
        }
    }

    /// Get default configuration file path
    fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "waylay", "waylay")
            .context("Failed to determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "waylay", "waylay")
            .context("Failed to determine data directory")?;

        Ok(dirs.data_dir().to_path_buf())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.requests.max_connections_per_host, 2);
        assert_eq!(config.proxy.stream_threshold, 2 * 1024 * 1024);
        assert!(!config.proxy.intercept.browser_to_server);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            port = 9090

            [proxy.intercept]
            server_to_browser = true
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert!(config.proxy.intercept.server_to_browser);
        assert!(!config.proxy.intercept.browser_to_server);
        assert!(!config.proxy.verify_upstream_tls);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.requests.max_connections_per_host = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_pattern() {
        let mut config = Config::default();
        config.proxy.passthrough_patterns = vec!["(".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path_str = path.to_str().unwrap();

        let mut config = Config::default();
        config.proxy.upstream_proxy = Some("http://127.0.0.1:3128".to_string());
        config.save(Some(path_str)).unwrap();

        let loaded = Config::load(Some(path_str)).unwrap();
        assert_eq!(loaded.proxy.upstream_proxy.as_deref(), Some("http://127.0.0.1:3128"));
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(path.to_str()).is_err());
    }
}

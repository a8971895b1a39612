//! Top-level application configuration: a TOML file composed of per-subsystem
//! sub-configs, each with serde defaults, loaded the same way regardless of
//! whether the file exists.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{ReconcilerError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub hosts: HostsFileConfig,
    #[serde(default)]
    pub static_routes: StaticRoutesFileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| ReconcilerError::config(format!("failed to parse {}: {e}", path.display())))?;
            config.server.validate()?;
            Ok(config)
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            reconcile: ReconcileConfig::default(),
            hosts: HostsFileConfig::default(),
            static_routes: StaticRoutesFileConfig::default(),
            logging: LoggingConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

/// Read/Query Surface bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl ServerConfig {
    /// Validate that `bind` is `HOST:PORT` with exactly one colon and a
    /// parseable 1..=65535 port, per spec.md §6.
    fn validate(&self) -> Result<()> {
        let parts: Vec<&str> = self.bind.split(':').collect();
        if parts.len() != 2 {
            return Err(ReconcilerError::config(format!(
                "server.bind must be in HOST:PORT format, got: {}",
                self.bind
            )));
        }
        match parts[1].parse::<u16>() {
            Ok(0) | Err(_) => Err(ReconcilerError::config(format!(
                "server.bind port must be between 1 and 65535, got: {}",
                parts[1]
            ))),
            Ok(_) => Ok(()),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// The external proxy's admin API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_api_url")]
    pub api_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_url: default_proxy_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_proxy_api_url() -> String {
    "http://caddy:2019".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostsFileConfig {
    #[serde(default = "default_hosts_file")]
    pub path: PathBuf,
}

impl Default for HostsFileConfig {
    fn default() -> Self {
        Self { path: default_hosts_file() }
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("config/hosts.yml")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticRoutesFileConfig {
    #[serde(default = "default_static_routes_file")]
    pub path: PathBuf,
}

impl Default for StaticRoutesFileConfig {
    fn default() -> Self {
        Self { path: default_static_routes_file() }
    }
}

fn default_static_routes_file() -> PathBuf {
    PathBuf::from("config/static-routes.yml")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_log_backup_count")]
    pub backup_count: u32,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_size_mb: default_log_max_size_mb(),
            backup_count: default_log_backup_count(),
            file_path: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_size_mb() -> u64 {
    10
}

fn default_log_backup_count() -> u32 {
    5
}

/// Generated SSH client configuration used to reach managed hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_ssh_key_path")]
    pub default_key_path: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            config_path: default_ssh_config_path(),
            default_key_path: default_ssh_key_path(),
        }
    }
}

fn default_ssh_config_path() -> PathBuf {
    dirs_home_ssh_config()
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("/root/.ssh/id_revp")
}

fn dirs_home_ssh_config() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".ssh").join("config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.proxy.api_url, "http://caddy:2019");
        assert_eq!(cfg.reconcile.interval_secs, 300);
    }

    #[test]
    fn load_falls_back_to_defaults_when_missing() {
        let cfg = Config::load(Path::new("/nonexistent/path/revp.toml")).unwrap();
        assert_eq!(cfg.server.bind, default_bind());
    }

    #[test]
    fn bind_validation_rejects_missing_colon() {
        let server = ServerConfig { bind: "0.0.0.0".to_string() };
        assert!(server.validate().is_err());
    }

    #[test]
    fn bind_validation_rejects_bad_port() {
        let server = ServerConfig { bind: "0.0.0.0:999999".to_string() };
        assert!(server.validate().is_err());
    }

    #[test]
    fn bind_validation_accepts_good_value() {
        let server = ServerConfig { bind: "127.0.0.1:9000".to_string() };
        assert!(server.validate().is_ok());
    }
}

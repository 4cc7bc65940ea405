//! Process configuration (§6 "environment-like inputs", §A.3): listener
//! ports, TLS material, timeouts, and the read-only flag, loaded from a
//! TOML file and overridden by CLI flags, CLI wins.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The configuration store the core reads `Config` from once at startup
/// (§1, §A.3) — its persistence format and live-reload fan-out are an
/// external collaborator and out of scope here. The only thing the core
/// itself needs of it is an orderly close on shutdown (§4.8 step 3).
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn close(&self) {}
}

/// A `ConfigProvider` that reads a TOML file once and has nothing to close.
pub struct StaticConfigProvider;

#[async_trait]
impl ConfigProvider for StaticConfigProvider {}

fn default_load_port() -> u16 {
    9090
}

fn default_monitor_port() -> u16 {
    9091
}

fn default_stat_port() -> u16 {
    9092
}

fn default_manager_port() -> u16 {
    9093
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_response_wait_timeout_secs() -> u64 {
    30
}

fn default_registry_lock_timeout_secs() -> u64 {
    5
}

/// TLS material for one listener's server socket (§6 "TLS"). Mutual
/// authentication is optional at the TLS layer; the hello-message
/// credential check in §4.3 is the authoritative application-level gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub keystore_path: PathBuf,
    pub keystore_password: String,
    pub truststore_path: Option<PathBuf>,
    pub truststore_password: Option<String>,
}

/// The snapshot of process configuration the core reads at startup. The
/// configuration *store* — its persistence format and live-reload
/// fan-out — stays an external collaborator (§1); this struct is what
/// that store hands the core once, not a handle back into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_load_port")]
    pub load_client_port: u16,
    #[serde(default = "default_monitor_port")]
    pub resource_monitor_port: u16,
    #[serde(default = "default_stat_port")]
    pub stat_port: u16,
    #[serde(default = "default_manager_port")]
    pub client_manager_port: u16,

    /// Bind address shared by all four listeners.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// `None` disables the load-client connection cap (§4.4).
    #[serde(default)]
    pub max_load_clients: Option<u32>,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_response_wait_timeout_secs")]
    pub response_wait_timeout_secs: u64,
    #[serde(default = "default_registry_lock_timeout_secs")]
    pub registry_lock_timeout_secs: u64,

    /// Authentication scheme the hello message must offer for the
    /// validator to even be consulted (§4.3 "if the scheme is not the one
    /// supported scheme -> fatal protocol-error").
    #[serde(default)]
    pub auth_scheme: Option<String>,
    #[serde(default)]
    pub require_auth: bool,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// "the process only serves admin queries" (§4.8).
    #[serde(default)]
    pub read_only: bool,

    /// Forces the logging subscriber's filter regardless of `RUST_LOG`
    /// (§6, §A.1).
    #[serde(default)]
    pub forced_log_level: Option<String>,

    /// Used only for notification content (§6); never dereferenced by the
    /// core itself.
    #[serde(default)]
    pub admin_ui_base_url: Option<String>,

    #[serde(default)]
    pub config_db_path: Option<PathBuf>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

impl Default for Config {
    fn default() -> Self {
        Config {
            load_client_port: default_load_port(),
            resource_monitor_port: default_monitor_port(),
            stat_port: default_stat_port(),
            client_manager_port: default_manager_port(),
            bind_address: default_bind_address(),
            max_load_clients: None,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            response_wait_timeout_secs: default_response_wait_timeout_secs(),
            registry_lock_timeout_secs: default_registry_lock_timeout_secs(),
            auth_scheme: None,
            require_auth: false,
            tls: None,
            read_only: false,
            forced_log_level: None,
            admin_ui_base_url: None,
            config_db_path: None,
        }
    }
}

impl Config {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn response_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.response_wait_timeout_secs)
    }

    pub fn registry_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_lock_timeout_secs)
    }

    /// Loads a `Config` from a TOML file, failing per §6 "exit codes:
    /// non-zero on failure to open config".
    pub fn load(path: &std::path::Path) -> CoreResult<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Protocol(format!("failed to read config {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| CoreError::Protocol(format!("failed to parse config {}: {e}", path.display())))
    }
}

/// CLI flags that resolve the config file path and override a handful of
/// fields the operator commonly needs to flip without editing the file
/// (§A.3: "a thin clap CLI layer... CLI wins").
#[derive(Debug, Parser)]
#[command(name = "loadgen-coordinator", about = "Distributed load-generation coordinator")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "LOADGEN_CONFIG", default_value = "loadgen.toml")]
    pub config: PathBuf,

    /// Serves admin queries only; no listeners, no scheduler (§4.8).
    #[arg(long)]
    pub read_only: bool,

    /// Overrides the logging subscriber's filter regardless of the config
    /// file or `RUST_LOG`.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Loads the config file named by `--config`, then applies CLI
    /// overrides on top — CLI always wins over the file.
    pub fn resolve(&self) -> CoreResult<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };
        if self.read_only {
            config.read_only = true;
        }
        if let Some(level) = &self.log_level {
            config.forced_log_level = Some(level.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.load_client_port, 9090);
        assert!(!config.read_only);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
    }

    #[test]
    fn toml_round_trips_through_defaults() {
        let text = r#"
            load_client_port = 5000
            resource_monitor_port = 5001
            stat_port = 5002
            client_manager_port = 5003
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.load_client_port, 5000);
        assert_eq!(config.max_load_clients, None);
        assert!(!config.require_auth);
    }
}

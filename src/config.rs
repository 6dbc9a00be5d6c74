//! Layered broker configuration: built-in defaults, overridden by an
//! optional TOML file, overridden by CLI flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BrokerError;

fn default_listen_addr() -> SocketAddr {
  "0.0.0.0:8080".parse().unwrap()
}

fn default_store_path() -> PathBuf {
  PathBuf::from("./chronopub-data")
}

fn default_log_file() -> PathBuf {
  PathBuf::from("./chronopub-broker.log")
}

fn default_ack_timeout() -> Duration {
  Duration::from_secs(2)
}

fn default_retry_budget() -> u32 {
  10
}

/// The subset of `BrokerConfig` that may appear in a TOML config file. All
/// fields are optional so a file can override just one setting.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
  pub listen_addr: Option<String>,
  pub store_path: Option<PathBuf>,
  pub log_file: Option<PathBuf>,
  pub ack_timeout_ms: Option<u64>,
  pub retry_budget: Option<u32>,
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
  pub listen_addr: SocketAddr,
  pub store_path: PathBuf,
  pub log_file: PathBuf,
  /// How long the consumer delivery loop waits for an `ACK\n` per attempt.
  pub ack_timeout: Duration,
  /// How many delivery attempts a pending message gets before the consumer
  /// is dropped.
  pub retry_budget: u32,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      listen_addr: default_listen_addr(),
      store_path: default_store_path(),
      log_file: default_log_file(),
      ack_timeout: default_ack_timeout(),
      retry_budget: default_retry_budget(),
    }
  }
}

impl BrokerConfig {
  /// Load a `ConfigFile` from `path`, if given, and apply CLI overrides on
  /// top of it. Precedence: CLI flag > config file value > built-in
  /// default.
  ///
  /// `cli_port` overrides only the port of `listen_addr`, matching the
  /// broker binary's `--port` flag; the host portion comes from the config
  /// file or the built-in default.
  pub fn resolve(
    config_path: Option<&PathBuf>,
    cli_port: Option<u16>,
    cli_store_path: Option<PathBuf>,
    cli_log_file: Option<PathBuf>,
    cli_ack_timeout_ms: Option<u64>,
    cli_retry_budget: Option<u32>,
  ) -> Result<Self, BrokerError> {
    let mut config = BrokerConfig::default();

    if let Some(path) = config_path {
      let file = read_config_file(path)?;
      if let Some(addr) = file.listen_addr {
        config.listen_addr = addr.parse().unwrap_or(config.listen_addr);
      }
      if let Some(store_path) = file.store_path {
        config.store_path = store_path;
      }
      if let Some(log_file) = file.log_file {
        config.log_file = log_file;
      }
      if let Some(ack_timeout_ms) = file.ack_timeout_ms {
        config.ack_timeout = Duration::from_millis(ack_timeout_ms);
      }
      if let Some(retry_budget) = file.retry_budget {
        config.retry_budget = retry_budget;
      }
    }

    if let Some(port) = cli_port {
      config.listen_addr.set_port(port);
    }
    if let Some(store_path) = cli_store_path {
      config.store_path = store_path;
    }
    if let Some(log_file) = cli_log_file {
      config.log_file = log_file;
    }
    if let Some(ack_timeout_ms) = cli_ack_timeout_ms {
      config.ack_timeout = Duration::from_millis(ack_timeout_ms);
    }
    if let Some(retry_budget) = cli_retry_budget {
      config.retry_budget = retry_budget;
    }

    Ok(config)
  }
}

fn read_config_file(path: &PathBuf) -> Result<ConfigFile, BrokerError> {
  let path_str = path.display().to_string();
  let contents = std::fs::read_to_string(path).map_err(|source| BrokerError::ConfigRead {
    path: path_str.clone(),
    source,
  })?;
  toml::from_str(&contents).map_err(|source| BrokerError::ConfigParse { path: path_str, source })
}

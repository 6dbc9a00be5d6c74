//! Startup-time error taxonomy.
//!
//! Per-connection transport failures never surface here - they are logged
//! and absorbed locally by `connection`. `BrokerError` is reserved for the
//! one place typed errors are allowed to cross a component boundary:
//! construction, in `main`.

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
  #[error("failed to bind listener on {addr}: {source}")]
  Bind { addr: SocketAddr, source: io::Error },

  #[error("failed to open durable store at {path}: {source}")]
  StoreOpen { path: String, source: sled::Error },

  #[error("failed to read config file {path}: {source}")]
  ConfigRead { path: String, source: io::Error },

  #[error("failed to parse config file {path}: {source}")]
  ConfigParse { path: String, source: toml::de::Error },
}

//! `chronopub-broker`: the broker process entry point.
//!
//! Wires together CLI parsing, layered configuration, logging, a
//! SIGINT/SIGTERM shutdown handler, and [`chronopub::run`].

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use chronopub::config::BrokerConfig;

/// Single-node publish/subscribe message broker with HLC-ordered delivery.
#[derive(Debug, Parser)]
#[command(name = "chronopub-broker", version, about)]
struct Cli {
  /// Path to a TOML config file. Values given here are overridden by any
  /// of the flags below.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Port to listen on; the host is always 0.0.0.0 unless set via the
  /// config file's `listen_addr`.
  #[arg(long)]
  port: Option<u16>,

  /// Directory for the durable per-topic message log.
  #[arg(long)]
  store_path: Option<PathBuf>,

  /// Path to the broker's log file.
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Milliseconds the delivery loop waits for an ACK per attempt.
  #[arg(long)]
  ack_timeout_ms: Option<u64>,

  /// Maximum delivery attempts for a pending message before its consumer
  /// is dropped.
  #[arg(long)]
  retry_budget: Option<u32>,
}

fn main() {
  let cli = Cli::parse();

  let config = match BrokerConfig::resolve(
    cli.config.as_ref(),
    cli.port,
    cli.store_path,
    cli.log_file,
    cli.ack_timeout_ms,
    cli.retry_budget,
  ) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("chronopub-broker: {e}");
      std::process::exit(1);
    }
  };

  chronopub::logging::init(&config.log_file);

  let shutdown = Arc::new(AtomicBool::new(false));
  install_shutdown_handler(Arc::clone(&shutdown), config.listen_addr);

  if let Err(e) = chronopub::run(&config, shutdown) {
    log::error!("chronopub-broker exiting: {e}");
    std::process::exit(1);
  }
}

/// Install a Ctrl-C / SIGTERM handler that flips `shutdown` and wakes the
/// blocking accept loop with a single throwaway connection to its own
/// listener address (see [`chronopub::run`]).
fn install_shutdown_handler(shutdown: Arc<AtomicBool>, listen_addr: SocketAddr) {
  let result = ctrlc::set_handler(move || {
    log::info!("shutdown signal received, stopping broker");
    shutdown.store(true, Ordering::SeqCst);
    // Best-effort wakeup: if this fails the listener may already be gone,
    // or a real connection will notice the flag on its own.
    let _ = TcpStream::connect(listen_addr);
  });

  if let Err(e) = result {
    log::warn!("failed to install signal handler: {e}, Ctrl-C will not shut down gracefully");
  }
}

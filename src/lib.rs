//! `chronopub`: a single-node publish/subscribe message broker with
//! per-topic ordering by hybrid logical clock, durable message logs, and
//! consumer replay.
//!
//! The core of this crate is, leaf modules first:
//! [`hlc`] the clock, [`message`] the wire/domain types, [`queue`] the
//! ordered log / pending queue, [`codec`] the TCP framing, [`store`] the
//! durable key-value adapter, [`topic`] the topic registry, and
//! [`connection`] the per-connection state machine that ties all of the
//! above together. [`config`], [`logging`], and [`error`] are the ambient
//! concerns every component above relies on.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod hlc;
pub mod logging;
pub mod message;
pub mod queue;
pub mod store;
pub mod topic;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use config::BrokerConfig;
use connection::DeliveryPolicy;
use error::BrokerError;
use store::DurableStore;
use topic::TopicManager;

/// Run the broker: open the store, rehydrate topic pools, bind the
/// listener, and accept connections until `shutdown` is flipped to `true`.
///
/// Every accepted connection is handled on its own thread, blocking freely
/// on its own I/O without affecting any other connection.
pub fn run(config: &BrokerConfig, shutdown: Arc<AtomicBool>) -> Result<(), BrokerError> {
  let store = Arc::new(DurableStore::open(&config.store_path)?);
  let topics = Arc::new(TopicManager::new());
  topics.load_pools(&store);
  let policy = DeliveryPolicy::from(config);

  let listener = TcpListener::bind(config.listen_addr).map_err(|source| BrokerError::Bind {
    addr: config.listen_addr,
    source,
  })?;
  log::info!("chronopub broker listening on {}", config.listen_addr);

  // `TcpListener::accept` has no timeout in std, so a blocking accept()
  // cannot observe `shutdown` on its own. The SIGINT/SIGTERM handler
  // (wired in the broker binary) connects a single throwaway socket to
  // this listener after flipping `shutdown`, which wakes the accept()
  // below exactly once; we then notice the flag and exit instead of
  // spawning a handler for that wakeup connection.
  loop {
    let (stream, addr) = match listener.accept() {
      Ok(accepted) => accepted,
      Err(e) => {
        log::error!("accept() failed: {e}");
        continue;
      }
    };

    if shutdown.load(Ordering::SeqCst) {
      break;
    }

    log::info!("accepted connection from {addr}");
    let topics = Arc::clone(&topics);
    let store = Arc::clone(&store);
    thread::spawn(move || connection::handle_connection(stream, topics, store, policy));
  }

  log::info!("shutdown requested, broker exiting");
  Ok(())
}

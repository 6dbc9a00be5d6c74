//! Durable store adapter over `sled`, an embedded ordered key-value store.
//!
//! One key exists per topic; the value is the `speedy`-encoded `{heap,
//! clock}` snapshot of that topic's log at the time of the last publish.

use speedy::{Readable, Writable};

use crate::error::BrokerError;
use crate::message::HlcMessage;

/// On-disk representation of a topic's log: its ordered messages plus the
/// topic log's HLC state at persistence time.
#[derive(Debug, Clone, Readable, Writable)]
pub struct PersistedLog {
  pub messages: Vec<HlcMessage>,
  pub clock_physical: i64,
  pub clock_logical: i64,
}

/// Wraps a `sled::Db` with topic-log-shaped encode/decode helpers.
pub struct DurableStore {
  db: sled::Db,
}

impl DurableStore {
  pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, BrokerError> {
    let path_str = path.as_ref().display().to_string();
    let db = sled::open(path.as_ref()).map_err(|source| BrokerError::StoreOpen {
      path: path_str,
      source,
    })?;
    Ok(Self { db })
  }

  /// Write the encoded log for `topic` in a single atomic update.
  pub fn save(&self, topic: &str, log: &PersistedLog) -> Result<(), sled::Error> {
    let encoded = log
      .write_to_vec()
      .expect("PersistedLog encoding is infallible for in-memory buffers");
    self.db.insert(topic.as_bytes(), encoded)?;
    self.db.flush()?;
    Ok(())
  }

  /// Iterate every `(topic, log)` pair currently in the store. Entries that
  /// fail to decode are logged and skipped; a single bad key never aborts
  /// startup.
  pub fn load_all(&self) -> Vec<(String, PersistedLog)> {
    let mut out = Vec::new();
    for item in self.db.iter() {
      let (key, value) = match item {
        Ok(kv) => kv,
        Err(e) => {
          log::error!("store iteration error, skipping remaining entries: {e}");
          break;
        }
      };
      let topic = match std::str::from_utf8(&key) {
        Ok(t) => t.to_string(),
        Err(e) => {
          log::error!("store key is not valid UTF-8, skipping: {e}");
          continue;
        }
      };
      match PersistedLog::read_from_buffer(&value) {
        Ok(log) => out.push((topic, log)),
        Err(e) => {
          log::error!("failed to decode persisted log for topic {topic:?}, skipping: {e}");
        }
      }
    }
    out
  }
}

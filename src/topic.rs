//! Topic registry: maps topic name to the per-topic pool of the ordered
//! log and live consumer subscriptions.
//!
//! Lock ordering (must not cycle): manager rwlock -> pool rwlock ->
//! (pool.log mutex | pending mutex) -> HLC mutex. Durable-store
//! transactions are taken outside any pool lock.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, RwLock};
use std::thread;

use uuid::Uuid;

use crate::message::HlcMessage;
use crate::queue::MessageQueue;
use crate::store::{DurableStore, PersistedLog};

/// A live consumer subscription: its own pending queue, fed by fan-out and
/// by replay, plus a writer handle to the underlying connection.
pub struct ConsumerConnection {
  pub id: Uuid,
  pub stream: TcpStream,
  pub pending: Arc<MessageQueue>,
}

/// The canonical log and live subscriber set for one topic.
pub struct TopicPool {
  pub topic: String,
  pub connections: RwLock<HashMap<Uuid, ConsumerConnection>>,
  pub log: MessageQueue,
}

impl TopicPool {
  fn new(topic: String) -> Self {
    Self {
      topic,
      connections: RwLock::new(HashMap::new()),
      log: MessageQueue::new(),
    }
  }

  fn from_persisted(topic: String, persisted: PersistedLog) -> Self {
    let log = MessageQueue::from_messages(persisted.messages);
    log.update_clock(persisted.clock_physical, persisted.clock_logical);
    Self {
      topic,
      connections: RwLock::new(HashMap::new()),
      log,
    }
  }
}

/// Registry of all topic pools, keyed by topic name.
pub struct TopicManager {
  pools: RwLock<HashMap<String, Arc<TopicPool>>>,
}

impl TopicManager {
  pub fn new() -> Self {
    Self {
      pools: RwLock::new(HashMap::new()),
    }
  }

  /// Return the existing pool for `topic`, or atomically install a new
  /// empty one.
  pub fn get_or_create_pool(&self, topic: &str) -> Arc<TopicPool> {
    if let Some(pool) = self.pools.read().unwrap().get(topic) {
      return Arc::clone(pool);
    }
    let mut pools = self.pools.write().unwrap();
    Arc::clone(
      pools
        .entry(topic.to_string())
        .or_insert_with(|| Arc::new(TopicPool::new(topic.to_string()))),
    )
  }

  /// Return the existing pool for `topic` without creating one.
  pub fn get_pool(&self, topic: &str) -> Option<Arc<TopicPool>> {
    self.pools.read().unwrap().get(topic).cloned()
  }

  /// Rehydrate every topic pool from the durable store. Errors decoding a
  /// single key are logged by `DurableStore::load_all` and skipped;
  /// startup never aborts because of them.
  pub fn load_pools(&self, store: &DurableStore) {
    let loaded = store.load_all();
    let mut pools = self.pools.write().unwrap();
    for (topic, persisted) in loaded {
      pools.insert(topic.clone(), Arc::new(TopicPool::from_persisted(topic, persisted)));
    }
    log::info!("loaded {} topic pool(s) from the durable store", pools.len());
  }

  /// Serialize `pools[topic].log` and persist it under key `topic`.
  /// Persistence errors are logged; the caller proceeds regardless.
  pub fn save_pool(&self, store: &DurableStore, topic: &str) {
    let pool = self.get_or_create_pool(topic);
    let messages = pool.log.snapshot_ordered();
    let clock = pool.log.clock_snapshot();
    let persisted = PersistedLog {
      messages,
      clock_physical: clock.physical,
      clock_logical: clock.logical,
    };
    if let Err(e) = store.save(topic, &persisted) {
      log::error!("failed to persist topic {topic:?}: {e}");
    }
  }

  /// Register a fresh consumer subscription with an empty pending queue.
  pub fn subscribe_consumer(&self, topic: &str, consumer_id: Uuid, stream: TcpStream) {
    let pool = self.get_or_create_pool(topic);
    let mut connections = pool.connections.write().unwrap();
    connections.insert(
      consumer_id,
      ConsumerConnection {
        id: consumer_id,
        stream,
        pending: Arc::new(MessageQueue::new()),
      },
    );
  }

  /// Remove a consumer subscription if present. Does not close the
  /// underlying connection; the caller owns that.
  pub fn unsubscribe_consumer(&self, topic: &str, consumer_id: Uuid) {
    let Some(pool) = self.get_pool(topic) else {
      return;
    };
    pool.connections.write().unwrap().remove(&consumer_id);
  }

  /// Ingest `msg` into `topic`'s log, persist it, then fan it out (a copy
  /// per subscriber, each on its own thread) to every currently subscribed
  /// consumer's pending queue. Returns once dispatch is scheduled; does
  /// not wait for delivery.
  pub fn publish_message(&self, store: &DurableStore, topic: &str, msg: HlcMessage) {
    let pool = self.get_or_create_pool(topic);
    self.save_pool(store, topic);

    let connections = pool.connections.read().unwrap();
    if connections.is_empty() {
      log::info!("no subscribers for topic {topic:?}");
      return;
    }
    for conn in connections.values() {
      let pending = Arc::clone(&conn.pending);
      let msg = msg.clone();
      thread::spawn(move || {
        pending.add(msg);
      });
    }
  }

  /// Replace `consumer_id`'s pending queue with a deep-copy snapshot of
  /// `topic`'s log at this instant.
  pub fn replay_message_log(&self, topic: &str, consumer_id: Uuid) {
    let Some(pool) = self.get_pool(topic) else {
      return;
    };
    let mut connections = pool.connections.write().unwrap();
    if let Some(conn) = connections.get_mut(&consumer_id) {
      conn.pending = Arc::new(pool.log.deep_copy());
    }
  }
}

impl Default for TopicManager {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hlc::HlcTimestamp;
  use std::net::{TcpListener, TcpStream};

  fn dummy_stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
  }

  #[test]
  fn get_or_create_pool_is_idempotent() {
    let manager = TopicManager::new();
    let a = manager.get_or_create_pool("t");
    let b = manager.get_or_create_pool("t");
    assert!(Arc::ptr_eq(&a, &b));
  }

  #[test]
  fn publish_without_subscribers_does_not_panic() {
    let dir = std::env::temp_dir().join(format!("chronopub-topic-test-{}", Uuid::new_v4()));
    let store = DurableStore::open(&dir).unwrap();
    let manager = TopicManager::new();
    let msg = HlcMessage::new(Uuid::new_v4(), b"hello".to_vec(), HlcTimestamp::new(1, 0));
    manager.publish_message(&store, "t", msg);
    std::fs::remove_dir_all(dir).ok();
  }

  #[test]
  fn subscribe_then_publish_then_replay_snapshot_is_isolated() {
    let dir = std::env::temp_dir().join(format!("chronopub-topic-test-{}", Uuid::new_v4()));
    let store = DurableStore::open(&dir).unwrap();
    let manager = TopicManager::new();

    let (client, server) = dummy_stream_pair();
    let consumer_id = Uuid::new_v4();
    manager.subscribe_consumer("t", consumer_id, server);

    let a = HlcMessage::new(Uuid::new_v4(), b"a".to_vec(), HlcTimestamp::new(1, 0));
    let b = HlcMessage::new(Uuid::new_v4(), b"b".to_vec(), HlcTimestamp::new(2, 0));
    manager.get_or_create_pool("t").log.add(a.clone());
    manager.get_or_create_pool("t").log.add(b.clone());

    manager.replay_message_log("t", consumer_id);

    let pool = manager.get_pool("t").unwrap();
    let pending = {
      let connections = pool.connections.read().unwrap();
      Arc::clone(&connections.get(&consumer_id).unwrap().pending)
    };

    // Publish after replay must not mutate the snapshot already taken.
    let c = HlcMessage::new(Uuid::new_v4(), b"c".to_vec(), HlcTimestamp::new(3, 0));
    manager.publish_message(&store, "t", c.clone());
    std::thread::sleep(std::time::Duration::from_millis(100));

    assert_eq!(pending.try_pop().unwrap().order_key(), (1, 0));
    assert_eq!(pending.try_pop().unwrap().order_key(), (2, 0));
    assert_eq!(pending.try_pop().unwrap().order_key(), (3, 0));
    assert!(pending.try_pop().is_none());

    drop(client);
    std::fs::remove_dir_all(dir).ok();
  }
}

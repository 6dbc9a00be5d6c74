//! End-to-end coverage over real TCP loopback sockets: handshake dispatch,
//! publish/subscribe ordering, replay snapshot isolation, ack-driven
//! delivery, and restart recovery via the durable store.

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use chronopub::codec::{read_frame, write_frame};
use chronopub::connection::{handle_connection, write_ack, DeliveryPolicy};
use chronopub::hlc::Hlc;
use chronopub::message::{ClientMessage, HlcMessage};
use chronopub::store::DurableStore;
use chronopub::topic::TopicManager;

/// Bind an ephemeral listener and spawn one thread per accepted connection
/// running `handle_connection`, mirroring `chronopub::run`'s accept loop
/// without its shutdown bookkeeping (tests don't need a clean stop; the
/// listener and its threads are dropped when the test binary exits).
fn spawn_broker(topics: Arc<TopicManager>, store: Arc<DurableStore>) -> std::net::SocketAddr {
  spawn_broker_with_policy(topics, store, DeliveryPolicy::default())
}

fn spawn_broker_with_policy(
  topics: Arc<TopicManager>,
  store: Arc<DurableStore>,
  policy: DeliveryPolicy,
) -> std::net::SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  thread::spawn(move || loop {
    match listener.accept() {
      Ok((stream, _)) => {
        let topics = Arc::clone(&topics);
        let store = Arc::clone(&store);
        thread::spawn(move || handle_connection(stream, topics, store, policy));
      }
      Err(_) => return,
    }
  });
  addr
}

/// Number of consumers currently subscribed to `topic`, or `0` if the topic
/// pool does not exist. Used to assert a consumer was actually dropped
/// after its delivery loop gives up.
fn subscriber_count(topics: &TopicManager, topic: &str) -> usize {
  topics
    .get_pool(topic)
    .map(|pool| pool.connections.read().unwrap().len())
    .unwrap_or(0)
}

fn temp_store() -> (Arc<DurableStore>, std::path::PathBuf) {
  let dir = std::env::temp_dir().join(format!("chronopub-it-{}", Uuid::new_v4()));
  let store = Arc::new(DurableStore::open(&dir).unwrap());
  (store, dir)
}

fn publish(addr: std::net::SocketAddr, topic: &str, content: &[u8], clock: &Hlc) {
  let ts = clock.now();
  let msg = HlcMessage::new(Uuid::nil(), content.to_vec(), ts);
  let handshake = ClientMessage::producer_handshake(topic, "", msg);
  let mut stream = TcpStream::connect(addr).unwrap();
  write_frame(&mut stream, &handshake).unwrap();
}

#[test]
fn subscribe_then_publish_delivers_the_message() {
  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));

  // A topic pool must exist before a consumer can subscribe to it.
  topics.get_or_create_pool("orders");

  let mut consumer = TcpStream::connect(addr).unwrap();
  let handshake = ClientMessage::consumer_handshake("orders", "", false);
  write_frame(&mut consumer, &handshake).unwrap();
  let mut reader = BufReader::new(consumer.try_clone().unwrap());

  thread::sleep(Duration::from_millis(100));
  let clock = Hlc::new();
  publish(addr, "orders", b"hello", &clock);

  let delivery = read_frame(&mut reader).unwrap();
  assert_eq!(delivery.payload.unwrap().content, b"hello");
  write_ack(&mut consumer).unwrap();

  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn publish_before_subscribe_is_not_delivered_without_replay() {
  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));

  let clock = Hlc::new();
  publish(addr, "orders", b"early", &clock);
  thread::sleep(Duration::from_millis(100));

  let mut consumer = TcpStream::connect(addr).unwrap();
  let handshake = ClientMessage::consumer_handshake("orders", "", false);
  write_frame(&mut consumer, &handshake).unwrap();
  consumer.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

  let mut reader = BufReader::new(consumer);
  let result = read_frame(&mut reader);
  assert!(result.is_err(), "no replay requested, nothing should arrive");

  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn replay_delivers_existing_log_in_hlc_order() {
  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));

  let clock = Hlc::new();
  publish(addr, "orders", b"a", &clock);
  publish(addr, "orders", b"b", &clock);
  thread::sleep(Duration::from_millis(100));

  let mut consumer = TcpStream::connect(addr).unwrap();
  let handshake = ClientMessage::consumer_handshake("orders", "", true);
  write_frame(&mut consumer, &handshake).unwrap();
  let mut reader = BufReader::new(consumer.try_clone().unwrap());

  let first = read_frame(&mut reader).unwrap();
  write_ack(&mut consumer).unwrap();
  let second = read_frame(&mut reader).unwrap();
  write_ack(&mut consumer).unwrap();

  assert_eq!(first.payload.unwrap().content, b"a");
  assert_eq!(second.payload.unwrap().content, b"b");

  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn delivery_stops_when_consumer_closes_without_acking() {
  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));

  topics.get_or_create_pool("orders");

  let consumer = TcpStream::connect(addr).unwrap();
  let mut handshake_writer = consumer.try_clone().unwrap();
  write_frame(&mut handshake_writer, &ClientMessage::consumer_handshake("orders", "", false)).unwrap();
  drop(handshake_writer);

  let mut reader = BufReader::new(consumer.try_clone().unwrap());
  thread::sleep(Duration::from_millis(100));
  assert_eq!(subscriber_count(&topics, "orders"), 1);

  let clock = Hlc::new();
  publish(addr, "orders", b"x", &clock);

  // Receive the delivery, then drop every handle to close the connection
  // instead of acking.
  let _ = read_frame(&mut reader).unwrap();
  drop(reader);
  drop(consumer);

  // The broker's delivery loop should notice the peer closed and give up
  // promptly rather than exhausting all ten retries, unsubscribing this
  // consumer from the topic pool.
  thread::sleep(Duration::from_millis(300));
  assert_eq!(subscriber_count(&topics, "orders"), 0);

  // The producer side staying responsive afterward is an additional
  // externally observable signal that the broker didn't get stuck.
  publish(addr, "orders", b"y", &clock);

  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn retry_budget_exhausted_drops_a_silent_consumer() {
  // A short ack timeout and small retry budget keep this test fast while
  // still exercising the real "N failed-ack attempts then drop" path
  // (rather than the peer-closed short-circuit covered above).
  let policy = DeliveryPolicy {
    ack_timeout: Duration::from_millis(50),
    max_attempts: 3,
  };

  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker_with_policy(Arc::clone(&topics), Arc::clone(&store), policy);

  topics.get_or_create_pool("orders");

  let mut consumer = TcpStream::connect(addr).unwrap();
  write_frame(&mut consumer, &ClientMessage::consumer_handshake("orders", "", false)).unwrap();
  let mut reader = BufReader::new(consumer.try_clone().unwrap());

  thread::sleep(Duration::from_millis(100));
  assert_eq!(subscriber_count(&topics, "orders"), 1);

  let clock = Hlc::new();
  publish(addr, "orders", b"never-acked", &clock);

  // Read (and discard) every retransmitted copy of the same message
  // without ever sending an ACK back, so the broker genuinely exhausts
  // its retry budget instead of seeing a closed socket.
  for _ in 0..policy.max_attempts {
    let _ = read_frame(&mut reader);
  }

  thread::sleep(Duration::from_millis(300));
  assert_eq!(
    subscriber_count(&topics, "orders"),
    0,
    "consumer should be dropped once its retry budget is exhausted"
  );

  drop(reader);
  drop(consumer);
  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn unknown_handshake_frame_closes_without_creating_a_pool() {
  let (store, dir) = temp_store();
  let topics = Arc::new(TopicManager::new());
  let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));

  let mut stream = TcpStream::connect(addr).unwrap();
  stream.write_all(b"not a valid frame at all").unwrap();
  drop(stream);

  thread::sleep(Duration::from_millis(100));
  assert!(topics.get_pool("orders").is_none());

  std::fs::remove_dir_all(dir).ok();
}

#[test]
fn restart_recovers_persisted_log_from_the_store() {
  let dir = std::env::temp_dir().join(format!("chronopub-it-{}", Uuid::new_v4()));

  {
    let store = Arc::new(DurableStore::open(&dir).unwrap());
    let topics = Arc::new(TopicManager::new());
    let addr = spawn_broker(Arc::clone(&topics), Arc::clone(&store));
    let clock = Hlc::new();
    publish(addr, "orders", b"persisted", &clock);
    thread::sleep(Duration::from_millis(150));
  }

  // A fresh manager and store opened on the same path should rehydrate the
  // topic pool with the previously published message intact.
  let store = DurableStore::open(&dir).unwrap();
  let topics = TopicManager::new();
  topics.load_pools(&store);

  let pool = topics.get_pool("orders").expect("topic pool should survive a restart");
  let messages = pool.log.snapshot_ordered();
  assert_eq!(messages.len(), 1);
  assert_eq!(messages[0].content, b"persisted");

  std::fs::remove_dir_all(dir).ok();
}

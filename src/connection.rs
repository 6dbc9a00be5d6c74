//! Per-connection state machine: handshake dispatch, the single-shot
//! producer ingestion path, and the long-lived consumer delivery loop with
//! ack/retry.
//!
//! ```text
//! ACCEPTED --handshake ok, role=producer--> PRODUCING
//! ACCEPTED --handshake ok, role=consumer--> DELIVERING
//! ACCEPTED --role unknown or decode fail--> CLOSED (terminal)
//! PRODUCING --after single message processed--> CLOSED
//! DELIVERING --unsubscribe / fatal send--> CLOSED
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::{read_frame, write_frame};
use crate::message::{ClientMessage, Role, ACK_LINE};
use crate::store::DurableStore;
use crate::topic::TopicManager;

/// Default maximum delivery attempts for a single pending message before
/// the consumer is dropped, used when `BrokerConfig` supplies none.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;
/// Default time the delivery loop waits for an `ACK\n` per attempt, used
/// when `BrokerConfig` supplies none.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// How long `pop_blocking` waits for a new pending message before looping
/// back to check for shutdown / re-poll.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The retry parameters governing a consumer's delivery loop: how long to
/// wait for an ack and how many attempts a message gets before the
/// consumer is dropped. Sourced from `BrokerConfig` so operators can tune
/// retry behavior without a rebuild.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
  pub ack_timeout: Duration,
  pub max_attempts: u32,
}

impl Default for DeliveryPolicy {
  fn default() -> Self {
    Self {
      ack_timeout: DEFAULT_ACK_TIMEOUT,
      max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
    }
  }
}

impl From<&crate::config::BrokerConfig> for DeliveryPolicy {
  fn from(config: &crate::config::BrokerConfig) -> Self {
    Self {
      ack_timeout: config.ack_timeout,
      max_attempts: config.retry_budget,
    }
  }
}

/// Classification of a transport failure: a peer-closed connection is an
/// ordinary, expected event; anything else is a genuine I/O problem.
#[derive(Debug, PartialEq, Eq)]
pub enum IoClass {
  PeerClosed,
  Other,
}

/// Classify an `io::Error` observed on a connection. Connection reset,
/// broken pipe, and unexpected EOF are "peer closed" - log at info and
/// terminate the affected loop quietly. Everything else is logged at error
/// and counted as a failed delivery attempt.
pub fn classify_io_error(err: &io::Error) -> IoClass {
  match err.kind() {
    io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
      IoClass::PeerClosed
    }
    _ => IoClass::Other,
  }
}

/// Handle one accepted connection until it reaches a terminal state.
pub fn handle_connection(
  stream: TcpStream,
  topics: Arc<TopicManager>,
  store: Arc<DurableStore>,
  policy: DeliveryPolicy,
) {
  let peer = stream
    .peer_addr()
    .map(|a| a.to_string())
    .unwrap_or_else(|_| "<unknown>".to_string());

  let mut reader = BufReader::new(match stream.try_clone() {
    Ok(s) => s,
    Err(e) => {
      log::error!("[{peer}] failed to clone stream for reading: {e}");
      return;
    }
  });

  let handshake = match read_frame(&mut reader) {
    Ok(msg) => msg,
    Err(e) => {
      // The handshake read is shared by producer and consumer connections
      // alike, so this is where the network-error classifier applies to
      // the producer path: a peer that connects and disconnects before
      // sending anything is an ordinary event, not an error worth logging
      // loudly.
      match frame_error_io(&e).map(classify_io_error) {
        Some(IoClass::PeerClosed) => log::info!("[{peer}] peer closed before handshake completed"),
        _ => log::warn!("[{peer}] handshake decode failed, closing: {e}"),
      }
      return;
    }
  };

  match handshake.metadata.role {
    Role::Producer => handle_producer(&peer, handshake, topics, store),
    Role::Consumer => handle_consumer(&peer, stream, reader, handshake, topics, policy),
  }
}

/// Extract the underlying `io::Error` from a `FrameError`, if it is one.
fn frame_error_io(err: &crate::codec::FrameError) -> Option<&io::Error> {
  match err {
    crate::codec::FrameError::Io(io_err) => Some(io_err),
    _ => None,
  }
}

/// Single-shot producer ingestion: assign a fresh id, merge the HLC
/// reading, append to the topic log, persist, and fan out. The connection
/// closes after this one message; no ingestion ack is sent.
fn handle_producer(peer: &str, handshake: ClientMessage, topics: Arc<TopicManager>, store: Arc<DurableStore>) {
  let Some(payload) = handshake.payload else {
    log::warn!("[{peer}] producer handshake carried no payload, closing");
    return;
  };

  let topic_name = handshake.metadata.topic;
  let id = Uuid::new_v4();
  let mut msg = payload;
  msg.id = *id.as_bytes();

  let pool = topics.get_or_create_pool(&topic_name);
  pool.log.update_clock(msg.physical, msg.logical);
  pool.log.add(msg.clone());

  topics.publish_message(&store, &topic_name, msg);
  log::info!("[{peer}] ingested message {id} on topic {topic_name:?}");
}

/// Long-lived consumer delivery loop: subscribe, optionally replay, then
/// drain the pending queue forever, retrying each message's delivery up to
/// `policy.max_attempts` times before giving up on this consumer.
fn handle_consumer(
  peer: &str,
  write_stream: TcpStream,
  mut reader: BufReader<TcpStream>,
  handshake: ClientMessage,
  topics: Arc<TopicManager>,
  policy: DeliveryPolicy,
) {
  let topic_name = handshake.metadata.topic;

  // The topic pool must already exist - there is no implicit create on
  // subscribe.
  if topics.get_pool(&topic_name).is_none() {
    log::info!("[{peer}] subscribe to unknown topic {topic_name:?}, closing");
    return;
  }

  let consumer_id = Uuid::new_v4();
  let Ok(writer_stream) = write_stream.try_clone() else {
    log::error!("[{peer}] failed to clone stream for writing, closing");
    return;
  };
  topics.subscribe_consumer(&topic_name, consumer_id, write_stream);

  if handshake.metadata.replay {
    topics.replay_message_log(&topic_name, consumer_id);
  }

  log::info!("[{peer}] consumer {consumer_id} subscribed to topic {topic_name:?}");

  deliver_until_dropped(peer, consumer_id, &topic_name, writer_stream, &mut reader, &topics, policy);

  topics.unsubscribe_consumer(&topic_name, consumer_id);
  log::info!("[{peer}] consumer {consumer_id} unsubscribed from topic {topic_name:?}");
}

fn deliver_until_dropped(
  peer: &str,
  consumer_id: Uuid,
  topic_name: &str,
  mut writer: TcpStream,
  reader: &mut BufReader<TcpStream>,
  topics: &Arc<TopicManager>,
  policy: DeliveryPolicy,
) {
  loop {
    let Some(pool) = topics.get_pool(topic_name) else {
      return;
    };
    let pending = {
      let connections = pool.connections.read().unwrap();
      match connections.get(&consumer_id) {
        Some(conn) => Arc::clone(&conn.pending),
        None => return, // unsubscribed from elsewhere
      }
    };

    let Some(msg) = pending.pop_blocking(PENDING_POLL_INTERVAL) else {
      continue;
    };

    let frame = ClientMessage::delivery(topic_name, msg.clone());
    let delivered = try_deliver_with_retries(peer, &mut writer, reader, &frame, policy);
    if !delivered {
      log::warn!(
        "[{peer}] consumer {consumer_id} exhausted {} delivery attempts, dropping",
        policy.max_attempts
      );
      return;
    }
  }
}

/// Attempt to deliver `frame`, retrying up to `policy.max_attempts` times.
/// Returns `true` once an `ACK\n` is received, `false` if the retry budget
/// is exhausted. A peer-closed write error terminates delivery immediately
/// (returns `false` without exhausting the budget).
fn try_deliver_with_retries(
  peer: &str,
  writer: &mut TcpStream,
  reader: &mut BufReader<TcpStream>,
  frame: &ClientMessage,
  policy: DeliveryPolicy,
) -> bool {
  for attempt in 1..=policy.max_attempts {
    if let Err(e) = write_frame(writer, frame) {
      if let Some(io_err) = frame_error_io(&e) {
        if classify_io_error(io_err) == IoClass::PeerClosed {
          log::info!("[{peer}] peer closed during delivery write, dropping consumer");
          return false;
        }
      }
      log::error!("[{peer}] delivery write failed on attempt {attempt}/{}: {e}", policy.max_attempts);
      continue;
    }

    match await_ack(reader, policy.ack_timeout) {
      Ok(true) => return true,
      Ok(false) => {
        log::warn!("[{peer}] unexpected ack content on attempt {attempt}/{}", policy.max_attempts);
      }
      Err(e) => {
        if classify_io_error(&e) == IoClass::PeerClosed {
          log::info!("[{peer}] peer closed while awaiting ack, dropping consumer");
          return false;
        }
        log::warn!("[{peer}] ack wait failed on attempt {attempt}/{}: {e}", policy.max_attempts);
      }
    }
  }
  false
}

/// Wait for a line from the consumer within `ack_timeout`. `Ok(true)` means
/// it was exactly `ACK\n`; `Ok(false)` means some other line arrived.
fn await_ack(reader: &mut BufReader<TcpStream>, ack_timeout: Duration) -> io::Result<bool> {
  reader.get_ref().set_read_timeout(Some(ack_timeout))?;
  let mut line = String::new();
  let n = reader.read_line(&mut line)?;
  if n == 0 {
    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
  }
  Ok(line == ACK_LINE)
}

/// Write the literal `ACK\n` acknowledgement line. Used by consumer client
/// implementations (see `demos/consumer_demo`), kept here so the constant
/// and its framing stay next to the rest of the protocol.
pub fn write_ack<W: Write>(writer: &mut W) -> io::Result<()> {
  writer.write_all(ACK_LINE.as_bytes())?;
  writer.flush()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_connection_reset_as_peer_closed() {
    let err = io::Error::from(io::ErrorKind::ConnectionReset);
    assert_eq!(classify_io_error(&err), IoClass::PeerClosed);
  }

  #[test]
  fn classifies_broken_pipe_as_peer_closed() {
    let err = io::Error::from(io::ErrorKind::BrokenPipe);
    assert_eq!(classify_io_error(&err), IoClass::PeerClosed);
  }

  #[test]
  fn classifies_other_errors_as_other() {
    let err = io::Error::from(io::ErrorKind::PermissionDenied);
    assert_eq!(classify_io_error(&err), IoClass::Other);
  }
}

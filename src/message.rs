//! Wire and domain types: the HLC-tagged message record, the handshake
//! envelope, and the sealed producer/consumer role.

use speedy::{Readable, Writable};
use uuid::Uuid;

use crate::hlc::HlcTimestamp;

/// A message tagged with the HLC reading it was published under.
///
/// `id` is assigned by the broker on ingestion (never by the producer);
/// `(physical, logical)` is the producer's clock reading at send time.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct HlcMessage {
  pub id: [u8; 16],
  pub content: Vec<u8>,
  pub physical: i64,
  pub logical: i64,
}

impl HlcMessage {
  pub fn new(id: Uuid, content: Vec<u8>, ts: HlcTimestamp) -> Self {
    Self {
      id: *id.as_bytes(),
      content,
      physical: ts.physical,
      logical: ts.logical,
    }
  }

  pub fn id(&self) -> Uuid {
    Uuid::from_bytes(self.id)
  }

  pub fn timestamp(&self) -> HlcTimestamp {
    HlcTimestamp::new(self.physical, self.logical)
  }

  /// Ordering key used by the heap: `(physical, logical)` ascending.
  pub fn order_key(&self) -> (i64, i64) {
    (self.physical, self.logical)
  }
}

/// Sealed handshake role. A typed enum instead of a stringly-typed field,
/// so that an unrecognized role is a decode error rather than a string the
/// dispatcher has to default on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub enum Role {
  Producer,
  Consumer,
}

/// Handshake / envelope metadata carried by every `ClientMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct Metadata {
  pub role: Role,
  pub token: String,
  pub topic: String,
  pub replay: bool,
}

/// The wire envelope exchanged between clients and the broker.
///
/// `payload` is `Some` exactly when `metadata.role == Role::Producer`, and
/// `None` for a consumer handshake. Messages delivered to a consumer reuse
/// this same envelope with `payload: Some(..)` and a `metadata` carrying
/// just the topic name.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ClientMessage {
  pub payload: Option<HlcMessage>,
  pub metadata: Metadata,
}

impl ClientMessage {
  pub fn producer_handshake(topic: impl Into<String>, token: impl Into<String>, payload: HlcMessage) -> Self {
    Self {
      payload: Some(payload),
      metadata: Metadata {
        role: Role::Producer,
        token: token.into(),
        topic: topic.into(),
        replay: false,
      },
    }
  }

  pub fn consumer_handshake(topic: impl Into<String>, token: impl Into<String>, replay: bool) -> Self {
    Self {
      payload: None,
      metadata: Metadata {
        role: Role::Consumer,
        token: token.into(),
        topic: topic.into(),
        replay,
      },
    }
  }

  pub fn delivery(topic: impl Into<String>, payload: HlcMessage) -> Self {
    Self {
      payload: Some(payload),
      metadata: Metadata {
        role: Role::Consumer,
        token: String::new(),
        topic: topic.into(),
        replay: false,
      },
    }
  }
}

/// The literal acknowledgement line a consumer sends back after a
/// successful delivery.
pub const ACK_LINE: &str = "ACK\n";

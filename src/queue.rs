//! The per-topic ordered log and per-consumer pending queue.
//!
//! Both are the same structure: a min-heap of `HlcMessage` ordered by
//! `(physical, logical)`, an embedded `Hlc`, guarded by a mutex. A
//! `Condvar` lets the delivery loop block on "queue became non-empty"
//! instead of busy-spinning on a poll interval.
//!
//! Lock ordering: queue mutex before HLC mutex, never the reverse.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::hlc::Hlc;
use crate::message::HlcMessage;

/// Wraps `HlcMessage` so `BinaryHeap` (a max-heap) can be driven as a
/// min-heap ordered by `(physical, logical)`.
#[derive(Debug, Clone)]
struct HeapEntry(HlcMessage);

impl PartialEq for HeapEntry {
  fn eq(&self, other: &Self) -> bool {
    self.0.order_key() == other.0.order_key()
  }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for HeapEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.order_key().cmp(&other.0.order_key())
  }
}

struct Inner {
  heap: BinaryHeap<Reverse<HeapEntry>>,
}

/// A mutex+condvar guarded min-heap of `HlcMessage`, with an embedded HLC
/// used to order/merge incoming timestamps before insertion.
pub struct MessageQueue {
  inner: Mutex<Inner>,
  not_empty: Condvar,
  clock: Hlc,
}

impl MessageQueue {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        heap: BinaryHeap::new(),
      }),
      not_empty: Condvar::new(),
      clock: Hlc::new(),
    }
  }

  /// Insert a message. No duplicate-id check, matching the original.
  pub fn add(&self, msg: HlcMessage) {
    let mut inner = self.inner.lock().unwrap();
    inner.heap.push(Reverse(HeapEntry(msg)));
    self.not_empty.notify_one();
  }

  /// Return the minimum element without removing it.
  pub fn peek(&self) -> Option<HlcMessage> {
    let inner = self.inner.lock().unwrap();
    inner.heap.peek().map(|Reverse(e)| e.0.clone())
  }

  /// Remove and return the minimum element if one is available now.
  pub fn try_pop(&self) -> Option<HlcMessage> {
    let mut inner = self.inner.lock().unwrap();
    inner.heap.pop().map(|Reverse(e)| e.0)
  }

  /// Remove and return the minimum element, blocking up to `timeout` for
  /// one to arrive. Returns `None` on timeout with the queue still empty.
  pub fn pop_blocking(&self, timeout: Duration) -> Option<HlcMessage> {
    let deadline = Instant::now() + timeout;
    let mut inner = self.inner.lock().unwrap();
    loop {
      if let Some(Reverse(entry)) = inner.heap.pop() {
        return Some(entry.0);
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      let (guard, result) = self.not_empty.wait_timeout(inner, deadline - now).unwrap();
      inner = guard;
      if result.timed_out() && inner.heap.is_empty() {
        return None;
      }
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().heap.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Merge a received HLC reading into the embedded clock.
  pub fn update_clock(&self, physical: i64, logical: i64) {
    self.clock.update(physical, logical);
  }

  /// The embedded clock's current reading, for persistence.
  pub fn clock_snapshot(&self) -> crate::hlc::HlcTimestamp {
    self.clock.snapshot()
  }

  /// Drain into a plain `Vec`, ordered ascending by `(physical, logical)`.
  /// Used to encode the log for durable storage.
  pub fn snapshot_ordered(&self) -> Vec<HlcMessage> {
    let inner = self.inner.lock().unwrap();
    let mut items: Vec<HlcMessage> = inner.heap.iter().map(|Reverse(e)| e.0.clone()).collect();
    items.sort_by_key(|m| m.order_key());
    items
  }

  /// Build a fresh, independent queue containing a deep copy of every
  /// element currently in this queue. Used by replay so a consumer's
  /// pending queue is decoupled from the canonical log.
  pub fn deep_copy(&self) -> MessageQueue {
    let copy = MessageQueue::new();
    let inner = self.inner.lock().unwrap();
    let mut new_inner = copy.inner.lock().unwrap();
    for Reverse(entry) in inner.heap.iter() {
      new_inner.heap.push(Reverse(entry.clone()));
    }
    drop(new_inner);
    copy
  }

  /// Rebuild a queue from a previously persisted, already-ordered message
  /// list (used when loading from the durable store).
  pub fn from_messages(messages: Vec<HlcMessage>) -> Self {
    let q = MessageQueue::new();
    {
      let mut inner = q.inner.lock().unwrap();
      for msg in messages {
        inner.heap.push(Reverse(HeapEntry(msg)));
      }
    }
    q
  }
}

impl Default for MessageQueue {
  fn default() -> Self {
    Self::new()
  }
}

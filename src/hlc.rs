//! Hybrid Logical Clock: monotonic (physical, logical) timestamps that also
//! absorb a received remote timestamp without losing causality.

use std::sync::Mutex;

use chrono::Utc;

/// A single HLC reading. Ordered lexicographically by `(physical, logical)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp {
  pub physical: i64,
  pub logical: i64,
}

impl HlcTimestamp {
  pub fn new(physical: i64, logical: i64) -> Self {
    Self { physical, logical }
  }
}

struct HlcState {
  physical: i64,
  logical: i64,
}

/// Hybrid logical clock. All operations are serialized under a single
/// mutex and never block on I/O.
pub struct Hlc {
  state: Mutex<HlcState>,
}

fn wall_clock_nanos() -> i64 {
  Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl Hlc {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(HlcState {
        physical: wall_clock_nanos(),
        logical: 0,
      }),
    }
  }

  /// Generate a timestamp for a local event. Strictly greater than every
  /// previous `now()`/`update()` result on this clock.
  pub fn now(&self) -> HlcTimestamp {
    let mut s = self.state.lock().unwrap();
    let t = wall_clock_nanos();

    if t > s.physical {
      s.physical = t;
      s.logical = 0;
    } else {
      s.logical += 1;
    }

    HlcTimestamp::new(s.physical, s.logical)
  }

  /// Merge a received `(physical, logical)` reading into this clock.
  /// The resulting clock state dominates both the local state and the
  /// received timestamp.
  pub fn update(&self, recv_physical: i64, recv_logical: i64) -> HlcTimestamp {
    let mut s = self.state.lock().unwrap();
    let local_physical = wall_clock_nanos();
    let prev_physical = s.physical;

    let new_physical = local_physical.max(s.physical).max(recv_physical);

    if new_physical == local_physical && local_physical > prev_physical && local_physical > recv_physical {
      s.logical = 0;
    } else if new_physical == prev_physical && new_physical == recv_physical {
      s.logical = s.logical.max(recv_logical) + 1;
    } else if new_physical == prev_physical {
      s.logical += 1;
    } else if new_physical == recv_physical {
      s.logical = recv_logical + 1;
    }
    s.physical = new_physical;

    HlcTimestamp::new(s.physical, s.logical)
  }

  /// The clock's current reading, without advancing it.
  pub fn snapshot(&self) -> HlcTimestamp {
    let s = self.state.lock().unwrap();
    HlcTimestamp::new(s.physical, s.logical)
  }
}

impl Default for Hlc {
  fn default() -> Self {
    Self::new()
  }
}

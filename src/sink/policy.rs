//! Sync and rotation policies.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Decides when buffered records must be flushed to durable storage.
pub trait SyncPolicy: Send + Sync + Debug {
  /// Notes one appended record of `bytes` bytes. Returns true if a flush is due.
  fn mark(&mut self, bytes: usize) -> bool;

  /// Called after every successful flush.
  fn reset(&mut self);
}

/// Flushes after every `count` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountSyncPolicy {
  count: usize,
  executed: usize,
}

impl CountSyncPolicy {
  /// Creates a policy flushing after `count` records (at least one).
  pub fn new(count: usize) -> Self {
    Self {
      count: count.max(1),
      executed: 0,
    }
  }

  /// Records marked since the last reset.
  pub fn executed(&self) -> usize {
    self.executed
  }
}

impl SyncPolicy for CountSyncPolicy {
  fn mark(&mut self, _bytes: usize) -> bool {
    self.executed += 1;
    self.executed >= self.count
  }

  fn reset(&mut self) {
    self.executed = 0;
  }
}

/// Decides when the active segment is closed and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPolicy {
  /// Rotate when this much wall-clock time has passed since the segment
  /// was opened.
  Timed(#[serde(with = "crate::backoff::millis")] Duration),
  /// Rotate once the segment holds at least this many bytes.
  FileSize(u64),
  /// Never rotate.
  Never,
}

impl Default for RotationPolicy {
  fn default() -> Self {
    RotationPolicy::Timed(Duration::from_secs(60))
  }
}

impl RotationPolicy {
  /// True if a segment of `bytes` bytes must be rotated.
  pub fn size_due(&self, bytes: u64) -> bool {
    matches!(self, RotationPolicy::FileSize(limit) if bytes >= *limit)
  }

  /// When a segment armed at `anchor` becomes due for timed rotation.
  pub fn deadline(&self, anchor: Instant) -> Option<Instant> {
    match self {
      RotationPolicy::Timed(interval) => Some(anchor + *interval),
      _ => None,
    }
  }

  /// True if a segment armed at `anchor` is due for timed rotation at `now`.
  pub fn time_due(&self, anchor: Instant, now: Instant) -> bool {
    self.deadline(anchor).is_some_and(|deadline| now >= deadline)
  }
}

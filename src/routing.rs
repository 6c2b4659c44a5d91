//! # Routing
//!
//! Decides which downstream task instance receives a record, and which
//! reader task owns which partition.
//!
//! Two groupings are supported between stages:
//!
//! - [`Grouping::Shuffle`]: round-robin, used from the source reader to the
//!   transform stage where any instance will do.
//! - [`Grouping::Fields`]: key-stable, used from the transform stage to the
//!   sink so that records with the same [`RoutingKey`] always land on the
//!   same sink instance.
//!
//! Key-stable routing hashes with SHA-256 rather than `DefaultHasher`, whose
//! output is allowed to change between Rust releases and processes.

use crate::record::PartitionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Value used to deterministically assign a record to a downstream instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RoutingKey(pub String);

impl RoutingKey {
  /// Creates a routing key.
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// Returns the key as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Stable 64-bit hash of the key.
  pub fn stable_hash(&self) -> u64 {
    let digest = Sha256::digest(self.0.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
  }
}

impl From<String> for RoutingKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&str> for RoutingKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl fmt::Display for RoutingKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Maps a routing key to an instance index in `0..instance_count`.
///
/// Returns 0 when `instance_count` is 0.
pub fn route(key: &RoutingKey, instance_count: usize) -> usize {
  if instance_count == 0 {
    return 0;
  }
  (key.stable_hash() % instance_count as u64) as usize
}

/// How records are distributed across the instances of the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Grouping {
  /// Round-robin across instances.
  #[default]
  Shuffle,
  /// Stable hash of the routing key.
  Fields,
}

/// Applies a grouping for a fixed number of downstream instances.
#[derive(Debug, Clone)]
pub struct Router {
  grouping: Grouping,
  instances: usize,
  next: usize,
}

impl Router {
  /// Creates a router. `instances` is clamped to at least one.
  pub fn new(grouping: Grouping, instances: usize) -> Self {
    Self {
      grouping,
      instances: instances.max(1),
      next: 0,
    }
  }

  /// Picks the instance for the next record.
  ///
  /// `key` is only consulted for [`Grouping::Fields`]; shuffle routing
  /// ignores it.
  pub fn select(&mut self, key: Option<&RoutingKey>) -> usize {
    match (self.grouping, key) {
      (Grouping::Fields, Some(key)) => route(key, self.instances),
      _ => {
        let index = self.next % self.instances;
        self.next = self.next.wrapping_add(1);
        index
      }
    }
  }

  /// Number of downstream instances.
  pub fn instances(&self) -> usize {
    self.instances
  }

  /// Grouping applied by this router.
  pub fn grouping(&self) -> Grouping {
    self.grouping
  }
}

/// Returns the partitions owned by reader task `task_index` out of `task_count`.
///
/// Partition `p` is owned by task `p % task_count`, so every partition has
/// exactly one owner. Tasks beyond the partition count own nothing.
pub fn partitions_for_task(
  partitions: &[PartitionId],
  task_count: usize,
  task_index: usize,
) -> Vec<PartitionId> {
  if task_count == 0 {
    return Vec::new();
  }
  partitions
    .iter()
    .copied()
    .filter(|p| owner_of(*p, task_count) == task_index)
    .collect()
}

/// Returns the reader task index owning a partition.
pub fn owner_of(partition: PartitionId, task_count: usize) -> usize {
  if task_count == 0 {
    return 0;
  }
  partition.get() as usize % task_count
}

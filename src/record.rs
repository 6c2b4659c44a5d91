//! # Records
//!
//! Identity and payload types that flow through the relay.
//!
//! A [`Record`] is created by the source reader and keeps its identity
//! ([`RecordRef`]: partition + offset) through every stage, even after the
//! transform stage has replaced its payload. Acknowledgments and failures are
//! always addressed by `RecordRef`, which is how they find their way back to
//! the reader that owns the partition.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifies one partition of a named stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
  /// Creates a partition id.
  pub const fn new(id: u32) -> Self {
    Self(id)
  }

  /// Returns the raw partition number.
  pub const fn get(self) -> u32 {
    self.0
  }
}

impl Display for PartitionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "p{}", self.0)
  }
}

impl From<u32> for PartitionId {
  fn from(id: u32) -> Self {
    Self(id)
  }
}

/// Reference to a record: its partition and its offset within that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
  /// Partition the record was read from.
  pub partition: PartitionId,
  /// Offset of the record within the partition.
  pub offset: u64,
}

impl RecordRef {
  /// Creates a record reference.
  pub const fn new(partition: PartitionId, offset: u64) -> Self {
    Self { partition, offset }
  }
}

impl Display for RecordRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.partition, self.offset)
  }
}

/// An immutable record read from a partitioned log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  /// Partition the record belongs to.
  pub partition: PartitionId,
  /// Offset within the partition.
  pub offset: u64,
  /// Raw payload bytes as stored in the log.
  pub payload: Vec<u8>,
}

impl Record {
  /// Creates a record.
  pub fn new(partition: PartitionId, offset: u64, payload: impl Into<Vec<u8>>) -> Self {
    Self {
      partition,
      offset,
      payload: payload.into(),
    }
  }

  /// Returns the identity of this record.
  pub fn reference(&self) -> RecordRef {
    RecordRef::new(self.partition, self.offset)
  }
}

/// Output of the transform stage: the normalized line and its length.
///
/// The origin reference is carried along so the sink can acknowledge the
/// source record once the line is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
  /// Identity of the source record this line was derived from.
  pub origin: RecordRef,
  /// Normalized line.
  pub line: String,
  /// Length of the line in characters.
  pub len: usize,
}

impl LineRecord {
  /// Returns the record's fields in declaration order (`line`, `len`).
  pub fn fields(&self) -> [String; 2] {
    [self.line.clone(), self.len.to_string()]
  }
}

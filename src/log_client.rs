//! # Log Client
//!
//! The boundary between the source reader and a partitioned,
//! offset-addressable log (Kafka in production clusters).
//!
//! [`LogClient`] is the only thing the reader knows about the log. Offsets
//! follow the usual high-watermark convention: [`LogClient::latest_offset`]
//! is the offset the *next* appended record will receive, so an empty
//! partition has `earliest == latest`.
//!
//! [`MemoryLog`] is an in-process implementation used for local runs and
//! tests. It supports fault injection: temporary unavailability, corrupt
//! records and retention truncation.

use crate::error::{Classify, FailureClass};
use crate::record::{PartitionId, Record};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors reported by a log client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
  /// The log (or the partition leader) cannot be reached right now.
  #[error("log unavailable: {0}")]
  Unavailable(String),
  /// The record at `offset` cannot be decoded.
  #[error("corrupt record at {partition}@{offset}: {reason}")]
  Corrupt {
    /// Partition containing the record.
    partition: PartitionId,
    /// Offset of the corrupt record.
    offset: u64,
    /// Decoder message.
    reason: String,
  },
  /// The requested offset is no longer (or not yet) retained.
  #[error("offset {requested} out of range for {partition} (earliest {earliest})")]
  OffsetOutOfRange {
    /// Partition read.
    partition: PartitionId,
    /// Offset requested.
    requested: u64,
    /// Earliest retained offset.
    earliest: u64,
  },
  /// The stream does not exist.
  #[error("unknown stream: {0}")]
  UnknownStream(String),
  /// The partition does not exist in the stream.
  #[error("unknown partition {partition} in stream {stream}")]
  UnknownPartition {
    /// Stream name.
    stream: String,
    /// Missing partition.
    partition: PartitionId,
  },
}

impl Classify for LogError {
  fn class(&self) -> FailureClass {
    match self {
      LogError::Unavailable(_) | LogError::OffsetOutOfRange { .. } => FailureClass::Transient,
      LogError::Corrupt { .. } => FailureClass::PermanentRecord,
      LogError::UnknownStream(_) | LogError::UnknownPartition { .. } => FailureClass::FatalTask,
    }
  }
}

/// Result type for log client operations.
pub type LogResult<T> = Result<T, LogError>;

/// Client for a partitioned, offset-addressable log.
#[async_trait]
pub trait LogClient: Send + Sync + Debug {
  /// Lists the partitions of a stream.
  async fn partitions(&self, stream: &str) -> LogResult<Vec<PartitionId>>;

  /// Subscribes to a set of partitions of a stream.
  async fn subscribe(&self, stream: &str, partitions: &[PartitionId]) -> LogResult<()>;

  /// Reads up to `max` records starting at `from`, in offset order.
  async fn read(
    &self,
    stream: &str,
    partition: PartitionId,
    from: u64,
    max: usize,
  ) -> LogResult<Vec<Record>>;

  /// Informs the log of the committed offset for a partition.
  async fn commit_offset(&self, stream: &str, partition: PartitionId, offset: u64)
  -> LogResult<()>;

  /// Earliest offset still retained in a partition.
  async fn earliest_offset(&self, stream: &str, partition: PartitionId) -> LogResult<u64>;

  /// Offset the next appended record will receive.
  async fn latest_offset(&self, stream: &str, partition: PartitionId) -> LogResult<u64>;
}

#[derive(Debug, Default)]
struct MemoryPartition {
  base: u64,
  records: Vec<Vec<u8>>,
}

impl MemoryPartition {
  fn next_offset(&self) -> u64 {
    self.base + self.records.len() as u64
  }
}

#[derive(Debug, Default)]
struct MemoryLogState {
  streams: HashMap<String, Vec<MemoryPartition>>,
  unavailable_reads: HashMap<PartitionId, u32>,
  corrupt: HashMap<(PartitionId, u64), Option<u32>>,
  subscriptions: HashMap<String, HashSet<PartitionId>>,
  committed: HashMap<(String, PartitionId), u64>,
  reads: u64,
}

/// In-process partitioned log.
///
/// Clones share the same log, so a test can append records while a reader
/// task consumes them.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
  state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLog {
  /// Creates an empty log.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a stream with `partitions` empty partitions (no-op if it exists).
  pub fn create_stream(&self, stream: &str, partitions: u32) -> &Self {
    if let Ok(mut state) = self.state.lock() {
      state
        .streams
        .entry(stream.to_string())
        .or_insert_with(|| (0..partitions).map(|_| MemoryPartition::default()).collect());
    }
    self
  }

  /// Appends a payload to a partition and returns its offset.
  ///
  /// Missing streams and partitions are created on demand.
  pub fn append(&self, stream: &str, partition: PartitionId, payload: impl Into<Vec<u8>>) -> u64 {
    let Ok(mut state) = self.state.lock() else {
      return 0;
    };
    let partitions = state.streams.entry(stream.to_string()).or_default();
    let index = partition.get() as usize;
    while partitions.len() <= index {
      partitions.push(MemoryPartition::default());
    }
    let target = &mut partitions[index];
    let offset = target.next_offset();
    target.records.push(payload.into());
    offset
  }

  /// Makes the next `reads` reads of a partition fail with `Unavailable`.
  pub fn fail_reads(&self, partition: PartitionId, reads: u32) {
    if let Ok(mut state) = self.state.lock() {
      state.unavailable_reads.insert(partition, reads);
    }
  }

  /// Marks a record as corrupt. `times = None` keeps it corrupt forever.
  pub fn corrupt(&self, partition: PartitionId, offset: u64, times: Option<u32>) {
    if let Ok(mut state) = self.state.lock() {
      state.corrupt.insert((partition, offset), times);
    }
  }

  /// Drops every record below `offset`, as retention would.
  pub fn truncate_before(&self, stream: &str, partition: PartitionId, offset: u64) {
    if let Ok(mut state) = self.state.lock()
      && let Some(target) = state
        .streams
        .get_mut(stream)
        .and_then(|p| p.get_mut(partition.get() as usize))
    {
      let drop = offset.saturating_sub(target.base).min(target.records.len() as u64);
      target.records.drain(..drop as usize);
      target.base += drop;
    }
  }

  /// Offset last committed through [`LogClient::commit_offset`].
  pub fn committed_offset(&self, stream: &str, partition: PartitionId) -> Option<u64> {
    self
      .state
      .lock()
      .ok()
      .and_then(|s| s.committed.get(&(stream.to_string(), partition)).copied())
  }

  /// Partitions currently subscribed for a stream.
  pub fn subscriptions(&self, stream: &str) -> HashSet<PartitionId> {
    self
      .state
      .lock()
      .ok()
      .and_then(|s| s.subscriptions.get(stream).cloned())
      .unwrap_or_default()
  }

  /// Number of successful or failed read calls served.
  pub fn read_calls(&self) -> u64 {
    self.state.lock().map(|s| s.reads).unwrap_or(0)
  }

  fn with_partition<T>(
    &self,
    stream: &str,
    partition: PartitionId,
    f: impl FnOnce(&mut MemoryLogState) -> LogResult<T>,
  ) -> LogResult<T> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| LogError::Unavailable(e.to_string()))?;
    let exists = state
      .streams
      .get(stream)
      .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?
      .len()
      > partition.get() as usize;
    if !exists {
      return Err(LogError::UnknownPartition {
        stream: stream.to_string(),
        partition,
      });
    }
    f(&mut state)
  }
}

#[async_trait]
impl LogClient for MemoryLog {
  async fn partitions(&self, stream: &str) -> LogResult<Vec<PartitionId>> {
    let state = self
      .state
      .lock()
      .map_err(|e| LogError::Unavailable(e.to_string()))?;
    let partitions = state
      .streams
      .get(stream)
      .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?;
    Ok((0..partitions.len() as u32).map(PartitionId).collect())
  }

  async fn subscribe(&self, stream: &str, partitions: &[PartitionId]) -> LogResult<()> {
    for &partition in partitions {
      self.with_partition(stream, partition, |_| Ok(()))?;
    }
    let mut state = self
      .state
      .lock()
      .map_err(|e| LogError::Unavailable(e.to_string()))?;
    state
      .subscriptions
      .entry(stream.to_string())
      .or_default()
      .extend(partitions.iter().copied());
    Ok(())
  }

  async fn read(
    &self,
    stream: &str,
    partition: PartitionId,
    from: u64,
    max: usize,
  ) -> LogResult<Vec<Record>> {
    self.with_partition(stream, partition, |state| {
      state.reads += 1;
      if let Some(remaining) = state.unavailable_reads.get_mut(&partition)
        && *remaining > 0
      {
        *remaining -= 1;
        return Err(LogError::Unavailable(format!(
          "leader for {partition} not reachable"
        )));
      }

      let (base, next) = {
        let target = &state.streams[stream][partition.get() as usize];
        (target.base, target.next_offset())
      };
      if from < base || from > next {
        return Err(LogError::OffsetOutOfRange {
          partition,
          requested: from,
          earliest: base,
        });
      }

      let mut records = Vec::new();
      let mut offset = from;
      while offset < next && records.len() < max {
        if let Some(times) = state.corrupt.get_mut(&(partition, offset)) {
          let still_corrupt = match times {
            None => true,
            Some(0) => false,
            Some(n) => {
              *n -= 1;
              true
            }
          };
          if still_corrupt {
            if records.is_empty() {
              return Err(LogError::Corrupt {
                partition,
                offset,
                reason: "checksum mismatch".to_string(),
              });
            }
            break;
          }
        }
        let payload = state.streams[stream][partition.get() as usize].records
          [(offset - base) as usize]
          .clone();
        records.push(Record::new(partition, offset, payload));
        offset += 1;
      }
      Ok(records)
    })
  }

  async fn commit_offset(
    &self,
    stream: &str,
    partition: PartitionId,
    offset: u64,
  ) -> LogResult<()> {
    self.with_partition(stream, partition, |state| {
      let entry = state
        .committed
        .entry((stream.to_string(), partition))
        .or_insert(offset);
      *entry = (*entry).max(offset);
      Ok(())
    })
  }

  async fn earliest_offset(&self, stream: &str, partition: PartitionId) -> LogResult<u64> {
    self.with_partition(stream, partition, |state| {
      Ok(state.streams[stream][partition.get() as usize].base)
    })
  }

  async fn latest_offset(&self, stream: &str, partition: PartitionId) -> LogResult<u64> {
    self.with_partition(stream, partition, |state| {
      Ok(state.streams[stream][partition.get() as usize].next_offset())
    })
  }
}

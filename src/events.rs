//! # Operational Events
//!
//! Structured event reporting for operators: skipped records, data-quality
//! drops, partition outages, commits and lag, segment lifecycle, and task
//! restarts.
//!
//! Components receive an [`EventReporter`] at construction time instead of
//! reaching for a process-wide logger. [`TracingReporter`] forwards events to
//! `tracing`; [`MemoryReporter`] keeps them for inspection in tests.

use crate::error::ComponentInfo;
use crate::record::{PartitionId, RecordRef};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An operational event emitted by a pipeline component.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
  /// A record exhausted its retry budget and was skipped.
  RecordSkipped {
    /// The skipped record.
    record: RecordRef,
    /// Failed attempts before giving up.
    attempts: u32,
    /// Last failure reason.
    reason: String,
  },
  /// A record was dropped by the transform stage.
  DataQuality {
    /// The dropped record.
    record: RecordRef,
    /// Why the payload was rejected.
    reason: String,
  },
  /// A partition could not be read and will be retried.
  PartitionUnavailable {
    /// Affected partition.
    partition: PartitionId,
    /// Delay before the next read attempt.
    retry_in: Duration,
    /// Error reported by the log client.
    reason: String,
  },
  /// A previously unavailable partition is readable again.
  PartitionRecovered {
    /// Recovered partition.
    partition: PartitionId,
  },
  /// A committed offset was persisted.
  OffsetCommitted {
    /// Partition the offset belongs to.
    partition: PartitionId,
    /// New committed offset.
    offset: u64,
  },
  /// Consumer lag for a partition.
  Lag {
    /// Partition measured.
    partition: PartitionId,
    /// Latest offset available in the log.
    latest: u64,
    /// Committed offset, if any.
    committed: Option<u64>,
    /// Records between the committed and latest offsets.
    lag: u64,
  },
  /// A sink task opened a new output segment.
  SegmentOpened {
    /// Owning sink task.
    component: ComponentInfo,
    /// Segment path.
    path: PathBuf,
  },
  /// A sink task closed a segment.
  SegmentRotated {
    /// Owning sink task.
    component: ComponentInfo,
    /// Closed segment path.
    path: PathBuf,
    /// Records written to the segment.
    records: u64,
    /// Bytes written to the segment.
    bytes: u64,
  },
  /// A storage operation failed and will be retried.
  StorageRetry {
    /// Sink task performing the operation.
    component: ComponentInfo,
    /// Retry attempt number (1-based).
    attempt: u32,
    /// Error reported by storage.
    reason: String,
  },
  /// A task instance failed and was restarted.
  TaskRestarted {
    /// Restarted task.
    component: ComponentInfo,
    /// Restarts so far, including this one.
    restarts: u32,
    /// Failure that caused the restart.
    reason: String,
  },
}

/// Receives operational events.
pub trait EventReporter: Send + Sync + Debug {
  /// Reports a single event.
  fn report(&self, event: PipelineEvent);
}

/// Shared handle to an event reporter.
pub type SharedReporter = Arc<dyn EventReporter>;

/// Reporter that turns events into `tracing` log lines.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl TracingReporter {
  /// Creates a tracing reporter.
  pub fn new() -> Self {
    Self
  }

  /// Returns this reporter as a shared handle.
  pub fn shared() -> SharedReporter {
    Arc::new(Self)
  }
}

impl EventReporter for TracingReporter {
  fn report(&self, event: PipelineEvent) {
    match event {
      PipelineEvent::RecordSkipped {
        record,
        attempts,
        reason,
      } => warn!(
        record = %record,
        attempts,
        reason = %reason,
        "Record skipped after exhausting retries"
      ),
      PipelineEvent::DataQuality { record, reason } => {
        warn!(record = %record, reason = %reason, "Dropped malformed record")
      }
      PipelineEvent::PartitionUnavailable {
        partition,
        retry_in,
        reason,
      } => warn!(
        partition = %partition,
        retry_in_ms = retry_in.as_millis() as u64,
        reason = %reason,
        "Partition unavailable"
      ),
      PipelineEvent::PartitionRecovered { partition } => {
        info!(partition = %partition, "Partition recovered")
      }
      PipelineEvent::OffsetCommitted { partition, offset } => {
        debug!(partition = %partition, offset, "Committed offset")
      }
      PipelineEvent::Lag {
        partition,
        latest,
        committed,
        lag,
      } => debug!(
        partition = %partition,
        latest,
        committed = ?committed,
        lag,
        "Consumer lag"
      ),
      PipelineEvent::SegmentOpened { component, path } => {
        info!(component = %component, path = %path.display(), "Opened segment")
      }
      PipelineEvent::SegmentRotated {
        component,
        path,
        records,
        bytes,
      } => info!(
        component = %component,
        path = %path.display(),
        records,
        bytes,
        "Rotated segment"
      ),
      PipelineEvent::StorageRetry {
        component,
        attempt,
        reason,
      } => warn!(
        component = %component,
        attempt,
        reason = %reason,
        "Storage operation failed, retrying"
      ),
      PipelineEvent::TaskRestarted {
        component,
        restarts,
        reason,
      } => warn!(
        component = %component,
        restarts,
        reason = %reason,
        "Restarted failed task"
      ),
    }
  }
}

/// Reporter that records events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
  events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemoryReporter {
  /// Creates an empty memory reporter.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a copy of all events reported so far.
  pub fn events(&self) -> Vec<PipelineEvent> {
    self
      .events
      .lock()
      .map(|events| events.clone())
      .unwrap_or_default()
  }

  /// Counts the events matching a predicate.
  pub fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
    self.events().iter().filter(|e| predicate(e)).count()
  }
}

impl EventReporter for MemoryReporter {
  fn report(&self, event: PipelineEvent) {
    if let Ok(mut events) = self.events.lock() {
      events.push(event);
    }
  }
}

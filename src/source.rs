//! # Source Reader
//!
//! Reads the partitions assigned to one reader task, tracks every record it
//! hands out until the record is acknowledged, and replays what fails.
//!
//! ## In-flight window
//!
//! Every emitted record stays in the reader's window until it is acked, or
//! skipped after exhausting its retries. Records waiting for a replay still
//! occupy the window. `poll` only reads as many fresh records as the window
//! has room for, which is what bounds memory and provides backpressure.
//!
//! ## Commits
//!
//! Acks may arrive in any order. Each partition's [`CommitTracker`] only
//! advances the committed offset past contiguous completed offsets, and the
//! [`OffsetTracker`] persists it according to its [`CommitStrategy`].
//!
//! [`CommitStrategy`]: crate::offset::CommitStrategy
//!
//! ## Failures
//!
//! - `fail` (or a message timeout) schedules a replay after exponential
//!   backoff, following the [`ReplayPolicy`].
//! - A record failing more than `max_retries` times is reported with
//!   [`PipelineEvent::RecordSkipped`] and treated as complete. Timeouts are
//!   replayed but never count toward `max_retries`: an unacked record may
//!   still be buffered by a sink awaiting its flush.
//! - An unreachable partition is retried with backoff indefinitely.
//! - A corrupt record counts as a failure of its offset.

use crate::backoff::Backoff;
use crate::error::{Classify, ComponentInfo, FailureClass};
use crate::events::{PipelineEvent, SharedReporter};
use crate::log_client::{LogClient, LogError};
use crate::offset::{CommitTracker, OffsetError, OffsetKey, OffsetResetPolicy, OffsetTracker};
use crate::record::{PartitionId, Record, RecordRef};
use crate::routing::partitions_for_task;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What is re-emitted after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
  /// Only the failed record.
  #[default]
  Record,
  /// The failed record and every later in-flight record of its partition.
  FromOffset,
}

/// Errors that stop a source reader.
#[derive(Error, Debug)]
pub enum SourceError {
  /// The log rejected an operation in a way retries cannot fix.
  #[error("log error: {0}")]
  Log(#[from] LogError),
  /// Committed offsets could not be read or written.
  #[error("offset error: {0}")]
  Offset(#[from] OffsetError),
}

impl Classify for SourceError {
  fn class(&self) -> FailureClass {
    match self {
      SourceError::Log(e) => e.class(),
      SourceError::Offset(e) => e.class(),
    }
  }
}

/// Result type for source reader operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Tunables of a source reader.
#[derive(Debug, Clone)]
pub struct SourceSettings {
  /// Stream (topic) to read.
  pub stream: String,
  /// Root namespace of the offset keys.
  pub offset_root: String,
  /// Consumer group owning the committed offsets.
  pub group: String,
  /// Maximum records emitted and not yet completed.
  pub window_capacity: usize,
  /// Maximum records fetched per partition read.
  pub fetch_size: usize,
  /// Replays allowed per record before it is skipped.
  pub max_retries: u32,
  /// Delay before replaying a failed record.
  pub retry_backoff: Backoff,
  /// Delay before reading an unavailable partition again.
  pub unavailable_backoff: Backoff,
  /// What to replay after a failure.
  pub replay: ReplayPolicy,
  /// In-flight records older than this are failed automatically.
  pub message_timeout: Duration,
}

impl Default for SourceSettings {
  fn default() -> Self {
    Self {
      stream: "basis_common".to_string(),
      offset_root: "/storm".to_string(),
      group: "word".to_string(),
      window_capacity: 1000,
      fetch_size: 100,
      max_retries: 5,
      retry_backoff: Backoff::default(),
      unavailable_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
      replay: ReplayPolicy::default(),
      message_timeout: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
  Emitted(Instant),
  Waiting(Instant),
}

#[derive(Debug)]
struct Entry {
  /// `None` until a corrupt record has been read successfully.
  record: Option<Record>,
  status: Status,
  failures: u32,
  timeouts: u32,
}

/// Why a record is scheduled for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
  Failed,
  TimedOut,
}

#[derive(Debug)]
struct PartitionState {
  key: OffsetKey,
  tracker: CommitTracker,
  next_fetch: u64,
  entries: BTreeMap<u64, Entry>,
  unavailable: Option<(Instant, u32)>,
}

impl PartitionState {
  fn available(&self, now: Instant) -> bool {
    self.unavailable.is_none_or(|(until, _)| now >= until)
  }
}

/// Reads a subset of a stream's partitions with at-least-once tracking.
#[derive(Debug)]
pub struct SourceReader {
  component: ComponentInfo,
  log: Arc<dyn LogClient>,
  offsets: OffsetTracker,
  settings: SourceSettings,
  reporter: SharedReporter,
  partitions: BTreeMap<PartitionId, PartitionState>,
  cursor: usize,
  admitting: bool,
}

impl SourceReader {
  /// Resolves the assignment of reader `component.task` out of `task_count`,
  /// loads committed offsets and subscribes to the owned partitions.
  ///
  /// A partition with a committed offset `c` resumes at `c + 1`. Otherwise
  /// the tracker's reset policy picks the earliest or latest offset.
  pub async fn open(
    component: ComponentInfo,
    task_count: usize,
    log: Arc<dyn LogClient>,
    offsets: OffsetTracker,
    settings: SourceSettings,
    reporter: SharedReporter,
  ) -> SourceResult<Self> {
    let all = log.partitions(&settings.stream).await?;
    let owned = partitions_for_task(&all, task_count, component.task);
    log.subscribe(&settings.stream, &owned).await?;

    let mut partitions = BTreeMap::new();
    for partition in owned {
      let key = OffsetKey::new(
        settings.offset_root.clone(),
        settings.group.clone(),
        settings.stream.clone(),
        partition,
      );
      let committed = offsets.committed(&key)?;
      let next_fetch = match committed {
        Some(offset) => offset + 1,
        None if offsets.reset_policy() == OffsetResetPolicy::Latest => {
          log.latest_offset(&settings.stream, partition).await?
        }
        None => log.earliest_offset(&settings.stream, partition).await?,
      };
      info!(
        component = %component,
        partition = %partition,
        committed = ?committed,
        start = next_fetch,
        "Assigned partition"
      );
      partitions.insert(
        partition,
        PartitionState {
          key,
          tracker: CommitTracker::new(committed),
          next_fetch,
          entries: BTreeMap::new(),
          unavailable: None,
        },
      );
    }

    Ok(Self {
      component,
      log,
      offsets,
      settings,
      reporter,
      partitions,
      cursor: 0,
      admitting: true,
    })
  }

  /// Returns the next batch of records.
  ///
  /// Due replays come first, then fresh reads limited by the free space in
  /// the window. Returns an empty batch after [`shutdown`](Self::shutdown).
  pub async fn poll(&mut self) -> SourceResult<Vec<Record>> {
    if !self.admitting {
      return Ok(Vec::new());
    }
    let now = Instant::now();
    self.expire(now).await?;
    let mut batch = Vec::new();
    self.emit_due_replays(now, &mut batch).await?;
    self.read_fresh(now, &mut batch).await?;
    Ok(batch)
  }

  /// Marks a record as fully processed.
  ///
  /// Unknown references (already completed, or owned by another reader) are
  /// ignored.
  pub async fn ack(&mut self, record: RecordRef) -> SourceResult<()> {
    let known = self
      .partitions
      .get(&record.partition)
      .is_some_and(|s| s.entries.contains_key(&record.offset));
    if !known {
      debug!(component = %self.component, record = %record, "Ignoring ack for unknown record");
      return Ok(());
    }
    self.complete(record).await
  }

  /// Schedules a record for replay, or skips it once it has failed more
  /// than `max_retries` times.
  pub async fn fail(&mut self, record: RecordRef) -> SourceResult<()> {
    self
      .fail_with(record, Cause::Failed, "failed downstream")
      .await
  }

  /// Stops admitting new records. Acks and fails are still processed.
  pub fn shutdown(&mut self) {
    if self.admitting {
      info!(component = %self.component, in_flight = self.in_flight(), "Source reader shutting down");
    }
    self.admitting = false;
  }

  /// Persists every committed offset held back by the commit strategy.
  pub async fn commit_pending(&mut self) -> SourceResult<Vec<(OffsetKey, u64)>> {
    let committed = self.offsets.commit_pending()?;
    for (key, offset) in &committed {
      self.persisted(key.partition, *offset).await;
    }
    Ok(committed)
  }

  /// Reports and returns the lag of every owned partition.
  pub async fn report_lag(&self) -> Vec<(PartitionId, u64)> {
    let mut lags = Vec::with_capacity(self.partitions.len());
    for &partition in self.partitions.keys() {
      if let Some(lag) = self.partition_lag(partition).await {
        lags.push((partition, lag));
      }
    }
    lags
  }

  /// Partitions owned by this reader.
  pub fn assignment(&self) -> Vec<PartitionId> {
    self.partitions.keys().copied().collect()
  }

  /// Records emitted and awaiting an ack or fail.
  pub fn in_flight(&self) -> usize {
    self
      .partitions
      .values()
      .flat_map(|s| s.entries.values())
      .filter(|e| matches!(e.status, Status::Emitted(_)))
      .count()
  }

  /// Records occupying the window, including those waiting for replay.
  pub fn window_len(&self) -> usize {
    self.partitions.values().map(|s| s.entries.len()).sum()
  }

  /// Committed offset of an owned partition.
  pub fn committed(&self, partition: PartitionId) -> Option<u64> {
    self
      .partitions
      .get(&partition)
      .and_then(|s| s.tracker.committed())
  }

  /// Whether the reader still admits new records.
  pub fn is_admitting(&self) -> bool {
    self.admitting
  }

  /// The task this reader belongs to.
  pub fn component(&self) -> &ComponentInfo {
    &self.component
  }

  async fn expire(&mut self, now: Instant) -> SourceResult<()> {
    let timeout = self.settings.message_timeout;
    let expired: Vec<RecordRef> = self
      .partitions
      .iter()
      .flat_map(|(partition, state)| {
        state.entries.iter().filter_map(move |(offset, entry)| match entry.status {
          Status::Emitted(at) if now.duration_since(at) >= timeout => {
            Some(RecordRef::new(*partition, *offset))
          }
          _ => None,
        })
      })
      .collect();
    for record in expired {
      warn!(component = %self.component, record = %record, "Record timed out");
      self
        .fail_with(record, Cause::TimedOut, "message timed out")
        .await?;
    }
    Ok(())
  }

  async fn emit_due_replays(&mut self, now: Instant, batch: &mut Vec<Record>) -> SourceResult<()> {
    let ids: Vec<PartitionId> = self.partitions.keys().copied().collect();
    for partition in ids {
      let due: Vec<u64> = match self.partitions.get(&partition) {
        Some(state) if state.available(now) => state
          .entries
          .iter()
          .filter(|(_, e)| matches!(e.status, Status::Waiting(at) if at <= now))
          .map(|(offset, _)| *offset)
          .collect(),
        _ => continue,
      };

      for offset in due {
        let cached = self
          .partitions
          .get(&partition)
          .and_then(|s| s.entries.get(&offset))
          .and_then(|e| e.record.clone());
        let record = match cached {
          Some(record) => record,
          None => match self.refetch(partition, offset).await? {
            Refetch::Record(record) => record,
            Refetch::Retry => continue,
            Refetch::Unavailable => break,
          },
        };
        if let Some(entry) = self
          .partitions
          .get_mut(&partition)
          .and_then(|s| s.entries.get_mut(&offset))
        {
          entry.record = Some(record.clone());
          entry.status = Status::Emitted(now);
          debug!(
            component = %self.component,
            record = %record.reference(),
            attempt = entry.failures,
            "Replaying record"
          );
          batch.push(record);
        }
      }
    }
    Ok(())
  }

  async fn refetch(&mut self, partition: PartitionId, offset: u64) -> SourceResult<Refetch> {
    let result = self
      .log
      .read(&self.settings.stream, partition, offset, 1)
      .await;
    match result {
      Ok(records) => {
        self.mark_available(partition);
        match records.into_iter().next() {
          Some(record) if record.offset == offset => Ok(Refetch::Record(record)),
          _ => {
            warn!(component = %self.component, partition = %partition, offset, "Record no longer in log");
            self.complete(RecordRef::new(partition, offset)).await?;
            Ok(Refetch::Retry)
          }
        }
      }
      Err(LogError::Corrupt { reason, .. }) => {
        if let Some(entry) = self
          .partitions
          .get_mut(&partition)
          .and_then(|s| s.entries.get_mut(&offset))
        {
          entry.status = Status::Emitted(Instant::now());
        }
        self
          .fail_with(RecordRef::new(partition, offset), Cause::Failed, &reason)
          .await?;
        Ok(Refetch::Retry)
      }
      Err(LogError::OffsetOutOfRange { .. }) => {
        warn!(component = %self.component, partition = %partition, offset, "Record no longer retained");
        self.complete(RecordRef::new(partition, offset)).await?;
        Ok(Refetch::Retry)
      }
      Err(e) if e.class() == FailureClass::Transient => {
        self.mark_unavailable(partition, &e);
        Ok(Refetch::Unavailable)
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn read_fresh(&mut self, now: Instant, batch: &mut Vec<Record>) -> SourceResult<()> {
    let ids: Vec<PartitionId> = self.partitions.keys().copied().collect();
    if ids.is_empty() {
      return Ok(());
    }
    let start = self.cursor % ids.len();
    self.cursor = self.cursor.wrapping_add(1);

    for i in 0..ids.len() {
      let room = self
        .settings
        .window_capacity
        .saturating_sub(self.window_len());
      if room == 0 {
        break;
      }
      let partition = ids[(start + i) % ids.len()];
      let from = match self.partitions.get(&partition) {
        Some(state) if state.available(now) => state.next_fetch,
        _ => continue,
      };
      let max = room.min(self.settings.fetch_size.max(1));

      match self
        .log
        .read(&self.settings.stream, partition, from, max)
        .await
      {
        Ok(records) => {
          self.mark_available(partition);
          let Some(state) = self.partitions.get_mut(&partition) else {
            continue;
          };
          for record in records {
            state.tracker.emitted(record.offset);
            state.next_fetch = record.offset + 1;
            state.entries.insert(
              record.offset,
              Entry {
                record: Some(record.clone()),
                status: Status::Emitted(now),
                failures: 0,
                timeouts: 0,
              },
            );
            batch.push(record);
          }
        }
        Err(LogError::Corrupt { offset, reason, .. }) => {
          warn!(
            component = %self.component,
            partition = %partition,
            offset,
            reason = %reason,
            "Corrupt record"
          );
          if let Some(state) = self.partitions.get_mut(&partition) {
            state.tracker.emitted(offset);
            state.next_fetch = offset + 1;
            state.entries.insert(
              offset,
              Entry {
                record: None,
                status: Status::Emitted(now),
                failures: 0,
                timeouts: 0,
              },
            );
          }
          self
            .fail_with(RecordRef::new(partition, offset), Cause::Failed, &reason)
            .await?;
        }
        Err(LogError::OffsetOutOfRange {
          requested,
          earliest,
          ..
        }) => {
          if requested < earliest {
            warn!(
              component = %self.component,
              partition = %partition,
              requested,
              earliest,
              "Offset no longer retained, resuming at earliest"
            );
            if let Some(state) = self.partitions.get_mut(&partition) {
              state.next_fetch = earliest;
            }
          }
        }
        Err(e) if e.class() == FailureClass::Transient => self.mark_unavailable(partition, &e),
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }

  async fn fail_with(&mut self, record: RecordRef, cause: Cause, reason: &str) -> SourceResult<()> {
    let max_retries = self.settings.max_retries;
    let replay = self.settings.replay;
    let backoff = self.settings.retry_backoff;
    let Some(state) = self.partitions.get_mut(&record.partition) else {
      debug!(component = %self.component, record = %record, "Ignoring fail for unknown record");
      return Ok(());
    };
    let Some(entry) = state.entries.get_mut(&record.offset) else {
      debug!(component = %self.component, record = %record, "Ignoring fail for unknown record");
      return Ok(());
    };
    if matches!(entry.status, Status::Waiting(_)) {
      return Ok(());
    }

    let attempt = match cause {
      Cause::Failed => {
        entry.failures += 1;
        if entry.failures > max_retries {
          let attempts = entry.failures;
          self.reporter.report(PipelineEvent::RecordSkipped {
            record,
            attempts,
            reason: reason.to_string(),
          });
          return self.complete(record).await;
        }
        entry.failures - 1
      }
      Cause::TimedOut => {
        entry.timeouts += 1;
        entry.failures + entry.timeouts - 1
      }
    };
    let failures = entry.failures;

    let due = Instant::now() + backoff.delay(attempt);
    entry.status = Status::Waiting(due);
    if replay == ReplayPolicy::FromOffset {
      for (_, later) in state.entries.range_mut(record.offset + 1..) {
        if matches!(later.status, Status::Emitted(_)) {
          later.status = Status::Waiting(due);
        }
      }
    }
    debug!(
      component = %self.component,
      record = %record,
      failures,
      reason = %reason,
      "Scheduled replay"
    );
    Ok(())
  }

  async fn complete(&mut self, record: RecordRef) -> SourceResult<()> {
    let Some(state) = self.partitions.get_mut(&record.partition) else {
      return Ok(());
    };
    state.entries.remove(&record.offset);
    let Some(committed) = state.tracker.complete(record.offset) else {
      return Ok(());
    };
    let key = state.key.clone();
    if self.offsets.record(&key, committed)? {
      self.persisted(record.partition, committed).await;
    }
    Ok(())
  }

  async fn persisted(&self, partition: PartitionId, offset: u64) {
    self
      .reporter
      .report(PipelineEvent::OffsetCommitted { partition, offset });
    if let Err(e) = self
      .log
      .commit_offset(&self.settings.stream, partition, offset)
      .await
    {
      warn!(
        component = %self.component,
        partition = %partition,
        error = %e,
        "Failed to forward committed offset to the log"
      );
    }
    self.partition_lag(partition).await;
  }

  async fn partition_lag(&self, partition: PartitionId) -> Option<u64> {
    let committed = self.committed(partition);
    let latest = match self
      .log
      .latest_offset(&self.settings.stream, partition)
      .await
    {
      Ok(latest) => latest,
      Err(e) => {
        debug!(component = %self.component, partition = %partition, error = %e, "Lag unavailable");
        return None;
      }
    };
    let lag = latest.saturating_sub(committed.map_or(0, |c| c + 1));
    self.reporter.report(PipelineEvent::Lag {
      partition,
      latest,
      committed,
      lag,
    });
    Some(lag)
  }

  fn mark_unavailable(&mut self, partition: PartitionId, err: &LogError) {
    let Some(state) = self.partitions.get_mut(&partition) else {
      return;
    };
    let attempts = state.unavailable.map_or(0, |(_, n)| n);
    let retry_in = self.settings.unavailable_backoff.delay(attempts);
    state.unavailable = Some((Instant::now() + retry_in, attempts + 1));
    self.reporter.report(PipelineEvent::PartitionUnavailable {
      partition,
      retry_in,
      reason: err.to_string(),
    });
  }

  fn mark_available(&mut self, partition: PartitionId) {
    if let Some(state) = self.partitions.get_mut(&partition)
      && state.unavailable.take().is_some()
    {
      self
        .reporter
        .report(PipelineEvent::PartitionRecovered { partition });
    }
  }
}

enum Refetch {
  Record(Record),
  Retry,
  Unavailable,
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;

//! The rotating sink.

use super::format::{DefaultFileNameFormat, RecordFormat};
use super::policy::{RotationPolicy, SyncPolicy};
use crate::backoff::Backoff;
use crate::error::{Classify, ComponentInfo, FailureClass};
use crate::events::{PipelineEvent, SharedReporter};
use crate::record::{LineRecord, RecordRef};
use crate::storage::{DurableStorage, SegmentHandle, StorageError, StorageResult};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// How many name collisions are tolerated before opening a segment fails.
const MAX_NAME_COLLISIONS: u32 = 16;

/// Errors returned by a [`RotatingSink`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
  /// Storage stayed unavailable past the retry budget. The sink instance is
  /// unusable; `unacked` lists every record it accepted but never
  /// acknowledged, so the caller can fail them upstream.
  #[error("sink {component} failed during {operation}: {reason}")]
  Fatal {
    /// Failing sink task.
    component: ComponentInfo,
    /// Storage operation that exhausted its retries.
    operation: &'static str,
    /// Last storage error.
    reason: String,
    /// Records accepted but not durably flushed.
    unacked: Vec<RecordRef>,
  },
  /// The sink was used after a fatal error or after `finish`.
  #[error("sink {0} is closed")]
  Closed(ComponentInfo),
}

impl SinkError {
  /// Records that must be failed upstream because of this error.
  pub fn unacked(&self) -> &[RecordRef] {
    match self {
      SinkError::Fatal { unacked, .. } => unacked,
      SinkError::Closed(_) => &[],
    }
  }

  // A segment that fails to close may lose data flushed to it, so records
  // already flushed are failed along with the rest.
  fn with_unacked(mut self, flushed: Vec<RecordRef>) -> Self {
    if let SinkError::Fatal { unacked, .. } = &mut self {
      unacked.extend(flushed);
    }
    self
  }
}

impl Classify for SinkError {
  fn class(&self) -> FailureClass {
    FailureClass::FatalTask
  }
}

/// Tunables of a rotating sink.
#[derive(Debug, Clone)]
pub struct SinkSettings {
  /// Segment naming.
  pub file_names: DefaultFileNameFormat,
  /// Rotation trigger.
  pub rotation: RotationPolicy,
  /// Longest a record may wait for a flush once appended. `None` leaves
  /// flushing to the sync policy and rotation alone.
  pub sync_interval: Option<Duration>,
  /// Retries per storage operation before giving up.
  pub max_write_retries: u32,
  /// Delay between storage retries.
  pub retry_backoff: Backoff,
}

impl Default for SinkSettings {
  fn default() -> Self {
    Self {
      file_names: DefaultFileNameFormat::default(),
      rotation: RotationPolicy::default(),
      sync_interval: Some(Duration::from_secs(10)),
      max_write_retries: 5,
      retry_backoff: Backoff::default(),
    }
  }
}

/// Counters kept by a sink instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
  /// Records appended to storage.
  pub accepted: u64,
  /// Records acknowledged after a durable flush.
  pub acknowledged: u64,
  /// Successful flushes.
  pub flushes: u64,
  /// Segments closed by rotation.
  pub rotations: u64,
  /// Segments opened.
  pub segments_opened: u64,
}

#[derive(Debug)]
struct Segment {
  path: PathBuf,
  handle: SegmentHandle,
  bytes: u64,
  records: u64,
  unflushed: bool,
}

/// Writes delimited records to rotating segments of a durable store.
///
/// Records are appended as they arrive and acknowledged only once a flush
/// that covers them succeeds: `accept`, `tick` and `finish` return the
/// references that became durable during the call. Each reference is
/// returned exactly once.
///
/// A segment is flushed before it is closed. After rotation the next record
/// opens a fresh segment; closed segments are never written again.
#[derive(Debug)]
pub struct RotatingSink {
  component: ComponentInfo,
  storage: Arc<dyn DurableStorage>,
  format: Arc<dyn RecordFormat>,
  sync_policy: Box<dyn SyncPolicy>,
  settings: SinkSettings,
  reporter: SharedReporter,
  segment: Option<Segment>,
  rotation: u64,
  armed_at: Instant,
  pending: Vec<RecordRef>,
  oldest_pending: Option<Instant>,
  stats: SinkStats,
  closed: bool,
}

impl RotatingSink {
  /// Creates a sink. No segment is opened until the first record arrives.
  pub fn new(
    component: ComponentInfo,
    storage: Arc<dyn DurableStorage>,
    format: Arc<dyn RecordFormat>,
    sync_policy: Box<dyn SyncPolicy>,
    settings: SinkSettings,
    reporter: SharedReporter,
  ) -> Self {
    Self {
      component,
      storage,
      format,
      sync_policy,
      settings,
      reporter,
      segment: None,
      rotation: 0,
      armed_at: Instant::now(),
      pending: Vec::new(),
      oldest_pending: None,
      stats: SinkStats::default(),
      closed: false,
    }
  }

  /// Writes one record.
  ///
  /// Returns the records that became durable as a result, which may include
  /// records accepted by earlier calls.
  pub async fn accept(&mut self, record: LineRecord) -> Result<Vec<RecordRef>, SinkError> {
    self.ensure_open()?;
    let mut durable = Vec::new();

    if self.segment.is_some() && self.settings.rotation.time_due(self.armed_at, Instant::now()) {
      durable.extend(self.rotate_on_timer().await?);
    }
    let handle = match self.segment.as_ref() {
      Some(segment) => segment.handle,
      None => self.open_segment(Some(record.origin)).await?,
    };

    let bytes = self.format.format(&record);
    let storage = Arc::clone(&self.storage);
    if let Err(e) = self
      .with_retry("append", || storage.append(handle, &bytes))
      .await
    {
      return Err(self.fatal("append", &e, Some(record.origin)).await);
    }

    if let Some(segment) = self.segment.as_mut() {
      segment.bytes += bytes.len() as u64;
      segment.records += 1;
      segment.unflushed = true;
    }
    if self.pending.is_empty() {
      self.oldest_pending = Some(Instant::now());
    }
    self.pending.push(record.origin);
    self.stats.accepted += 1;

    if self.sync_policy.mark(bytes.len()) {
      durable.extend(self.sync().await?);
    }
    let size = self.segment.as_ref().map_or(0, |s| s.bytes);
    if self.settings.rotation.size_due(size) {
      durable.extend(self.rotate().await?);
    }
    Ok(durable)
  }

  /// Applies timed rotation and the sync interval. Call periodically, e.g.
  /// at [`next_deadline`](Self::next_deadline).
  pub async fn tick(&mut self) -> Result<Vec<RecordRef>, SinkError> {
    self.ensure_open()?;
    let now = Instant::now();
    if self.settings.rotation.time_due(self.armed_at, now) {
      return self.rotate_on_timer().await;
    }
    if self.sync_deadline().is_some_and(|deadline| now >= deadline) {
      return self.sync().await;
    }
    Ok(Vec::new())
  }

  /// Flushes and closes the active segment without opening a new one.
  ///
  /// The sink rejects further records afterwards.
  pub async fn finish(&mut self) -> Result<Vec<RecordRef>, SinkError> {
    self.ensure_open()?;
    let durable = self.sync().await?;
    if let Err(e) = self.close_segment().await {
      return Err(e.with_unacked(durable));
    }
    self.closed = true;
    info!(
      component = %self.component,
      acknowledged = self.stats.acknowledged,
      "Sink finished"
    );
    Ok(durable)
  }

  /// The next instant at which [`tick`](Self::tick) has work: a timed
  /// rotation, or the sync interval of the oldest pending record.
  pub fn next_deadline(&self) -> Option<Instant> {
    match (self.settings.rotation.deadline(self.armed_at), self.sync_deadline()) {
      (Some(rotation), Some(sync)) => Some(rotation.min(sync)),
      (rotation, sync) => rotation.or(sync),
    }
  }

  /// Path of the active segment.
  pub fn current_segment(&self) -> Option<&PathBuf> {
    self.segment.as_ref().map(|s| &s.path)
  }

  /// Records accepted but not yet durable.
  pub fn pending(&self) -> &[RecordRef] {
    &self.pending
  }

  /// Counters for this instance.
  pub fn stats(&self) -> SinkStats {
    self.stats
  }

  /// The task this sink belongs to.
  pub fn component(&self) -> &ComponentInfo {
    &self.component
  }

  fn sync_deadline(&self) -> Option<Instant> {
    Some(self.oldest_pending? + self.settings.sync_interval?)
  }

  fn ensure_open(&self) -> Result<(), SinkError> {
    if self.closed {
      return Err(SinkError::Closed(self.component.clone()));
    }
    Ok(())
  }

  async fn rotate_on_timer(&mut self) -> Result<Vec<RecordRef>, SinkError> {
    let empty = self.segment.as_ref().is_none_or(|s| s.records == 0);
    if empty {
      debug!(component = %self.component, "Timed rotation skipped for empty segment");
      self.armed_at = Instant::now();
      return Ok(Vec::new());
    }
    self.rotate().await
  }

  async fn sync(&mut self) -> Result<Vec<RecordRef>, SinkError> {
    let Some(segment) = self.segment.as_ref() else {
      self.sync_policy.reset();
      return Ok(Vec::new());
    };
    if !segment.unflushed {
      self.sync_policy.reset();
      return Ok(Vec::new());
    }
    let handle = segment.handle;
    let storage = Arc::clone(&self.storage);
    if let Err(e) = self.with_retry("flush", || storage.flush(handle)).await {
      return Err(self.fatal("flush", &e, None).await);
    }
    if let Some(segment) = self.segment.as_mut() {
      segment.unflushed = false;
    }
    self.sync_policy.reset();
    self.stats.flushes += 1;
    let durable = std::mem::take(&mut self.pending);
    self.oldest_pending = None;
    self.stats.acknowledged += durable.len() as u64;
    debug!(
      component = %self.component,
      records = durable.len(),
      "Flushed segment"
    );
    Ok(durable)
  }

  async fn rotate(&mut self) -> Result<Vec<RecordRef>, SinkError> {
    let durable = self.sync().await?;
    if let Err(e) = self.close_segment().await {
      return Err(e.with_unacked(durable));
    }
    self.stats.rotations += 1;
    self.rotation += 1;
    Ok(durable)
  }

  async fn close_segment(&mut self) -> Result<(), SinkError> {
    let Some(segment) = self.segment.as_ref() else {
      return Ok(());
    };
    let handle = segment.handle;
    let storage = Arc::clone(&self.storage);
    if let Err(e) = self.with_retry("close", || storage.close(handle)).await {
      return Err(self.fatal("close", &e, None).await);
    }
    if let Some(segment) = self.segment.take() {
      self.reporter.report(PipelineEvent::SegmentRotated {
        component: self.component.clone(),
        path: segment.path,
        records: segment.records,
        bytes: segment.bytes,
      });
    }
    Ok(())
  }

  async fn open_segment(
    &mut self,
    incoming: Option<RecordRef>,
  ) -> Result<SegmentHandle, SinkError> {
    let mut collisions = 0;
    let mut attempt = 0;
    loop {
      let path = self.settings.file_names.segment_path(
        &self.component.name,
        self.component.task,
        self.rotation,
        chrono::Utc::now().timestamp_millis(),
      );
      match self.storage.open(&path).await {
        Ok(handle) => {
          self.segment = Some(Segment {
            path: path.clone(),
            handle,
            bytes: 0,
            records: 0,
            unflushed: false,
          });
          self.armed_at = Instant::now();
          self.stats.segments_opened += 1;
          self.reporter.report(PipelineEvent::SegmentOpened {
            component: self.component.clone(),
            path,
          });
          return Ok(handle);
        }
        Err(StorageError::AlreadyExists(_)) if collisions < MAX_NAME_COLLISIONS => {
          collisions += 1;
          self.rotation += 1;
          debug!(component = %self.component, path = %path.display(), "Segment name taken");
        }
        Err(e) if e.class() == FailureClass::Transient && attempt < self.settings.max_write_retries => {
          attempt += 1;
          self.report_retry(attempt, &e);
          tokio::time::sleep(self.settings.retry_backoff.delay(attempt - 1)).await;
        }
        Err(e) => return Err(self.fatal("open", &e, incoming).await),
      }
    }
  }

  async fn with_retry<F, Fut>(&self, operation: &'static str, mut op: F) -> StorageResult<()>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<()>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(()) => return Ok(()),
        Err(e) if e.class() == FailureClass::Transient && attempt < self.settings.max_write_retries => {
          attempt += 1;
          debug!(component = %self.component, operation, attempt, "Retrying storage operation");
          self.report_retry(attempt, &e);
          tokio::time::sleep(self.settings.retry_backoff.delay(attempt - 1)).await;
        }
        Err(e) => return Err(e),
      }
    }
  }

  fn report_retry(&self, attempt: u32, err: &StorageError) {
    self.reporter.report(PipelineEvent::StorageRetry {
      component: self.component.clone(),
      attempt,
      reason: err.to_string(),
    });
  }

  async fn fatal(
    &mut self,
    operation: &'static str,
    err: &StorageError,
    incoming: Option<RecordRef>,
  ) -> SinkError {
    let mut unacked = std::mem::take(&mut self.pending);
    unacked.extend(incoming);
    self.oldest_pending = None;
    error!(
      component = %self.component,
      operation,
      error = %err,
      unacked = unacked.len(),
      "Storage retries exhausted"
    );
    if let Some(segment) = self.segment.take() {
      self.storage.abandon(segment.handle).await;
    }
    self.closed = true;
    SinkError::Fatal {
      component: self.component.clone(),
      operation,
      reason: err.to_string(),
      unacked,
    }
  }
}

//! # Runtime
//!
//! Runs a [`Pipeline`] in this process: one tokio task per task instance,
//! bounded channels between stages, and an unbounded control channel per
//! reader carrying acks and fails back to the owner of each partition.
//!
//! ```text
//!  reader[i] ──shuffle──▶ transform[j] ──fields(line)──▶ sink[k]
//!     ▲                        │                            │
//!     └──────── ack / fail ────┴────────────────────────────┘
//! ```
//!
//! Control messages never block: the number of unacknowledged records is
//! already bounded by each reader's window.
//!
//! ## Shutdown
//!
//! Cancelling the token passed to [`Pipeline::run`]:
//!
//! 1. readers stop polling and drop their record senders,
//! 2. transforms drain their input and exit, dropping theirs,
//! 3. sinks see their input close and call `finish` (final flush, no
//!    rotation), acknowledging what it made durable,
//! 4. readers apply the remaining acks until every sender is gone, then
//!    persist their committed offsets.
//!
//! A sink that exhausts its storage retries fails its unacknowledged records
//! upstream and is restarted according to the pipeline's
//! [`SupervisionPolicy`](crate::supervision::SupervisionPolicy). A task that
//! escalates stops the whole pipeline the same way, and
//! [`Pipeline::run`] then returns [`PipelineError::TaskFailed`].

use crate::error::{ComponentInfo, PipelineError, PipelineResult, PipelineStage};
use crate::events::{PipelineEvent, SharedReporter};
use crate::pipeline::{Pipeline, SinkStage, SourceStage, TransformStage};
use crate::record::{LineRecord, PartitionId, Record, RecordRef};
use crate::routing::{Grouping, Router, owner_of};
use crate::sink::RotatingSink;
use crate::source::{SourceReader, SourceResult};
use crate::supervision::{FailureReport, SupervisionDecision, SupervisionPolicy, Supervisor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
  /// Pipeline name.
  pub name: String,
  /// Records handed to the transform stage, replays included.
  pub records_emitted: u64,
  /// Records forwarded to a sink.
  pub records_transformed: u64,
  /// Records dropped as malformed.
  pub records_dropped: u64,
  /// Records appended by sinks.
  pub records_written: u64,
  /// Acks applied by readers.
  pub records_acked: u64,
  /// Fails applied by readers.
  pub records_failed: u64,
  /// Task restarts performed by supervision.
  pub task_restarts: u32,
  /// Final committed offset per partition.
  pub committed: BTreeMap<PartitionId, u64>,
}

#[derive(Debug, Default)]
struct Counters {
  emitted: AtomicU64,
  transformed: AtomicU64,
  dropped: AtomicU64,
  written: AtomicU64,
  acked: AtomicU64,
  failed: AtomicU64,
  restarts: AtomicU32,
}

impl Counters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn report(&self, name: String) -> PipelineReport {
    PipelineReport {
      name,
      records_emitted: self.emitted.load(Ordering::Relaxed),
      records_transformed: self.transformed.load(Ordering::Relaxed),
      records_dropped: self.dropped.load(Ordering::Relaxed),
      records_written: self.written.load(Ordering::Relaxed),
      records_acked: self.acked.load(Ordering::Relaxed),
      records_failed: self.failed.load(Ordering::Relaxed),
      task_restarts: self.restarts.load(Ordering::Relaxed),
      committed: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum Control {
  Ack(RecordRef),
  Fail(RecordRef),
}

/// Delivers acks and fails to the reader owning the record's partition.
#[derive(Debug, Clone)]
struct AckRouter {
  readers: Vec<mpsc::UnboundedSender<Control>>,
}

impl AckRouter {
  fn ack(&self, record: RecordRef) {
    self.send(record, Control::Ack(record));
  }

  fn fail(&self, record: RecordRef) {
    self.send(record, Control::Fail(record));
  }

  fn send(&self, record: RecordRef, control: Control) {
    let owner = owner_of(record.partition, self.readers.len());
    if let Some(reader) = self.readers.get(owner)
      && reader.send(control).is_err()
    {
      debug!(record = %record, "Reader gone, dropping control message");
    }
  }
}

enum TaskOutcome {
  Reader(Vec<(PartitionId, u64)>),
  Transform,
  Sink,
}

impl Pipeline {
  /// Runs the pipeline until `cancel` fires, then drains it.
  ///
  /// Returns an error if the definition is invalid, a reader cannot be
  /// opened, or a task fails beyond its supervision policy.
  pub async fn run(self, cancel: CancellationToken) -> PipelineResult<PipelineReport> {
    self.definition().validate()?;
    let readers = self.effective_tasks(PipelineStage::Source);
    let transforms = self.effective_tasks(PipelineStage::Transform);
    let sinks = self.effective_tasks(PipelineStage::Sink);
    info!(pipeline = %self.name, readers, transforms, sinks, "Starting pipeline");

    let shutdown = cancel.child_token();
    let counters = Arc::new(Counters::default());
    let capacity = self.channel_capacity.max(1);

    let (ack_txs, ack_rxs): (Vec<_>, Vec<_>) =
      (0..readers).map(|_| mpsc::unbounded_channel()).unzip();
    let acks = AckRouter { readers: ack_txs };
    let (record_txs, record_rxs): (Vec<_>, Vec<_>) =
      (0..transforms).map(|_| mpsc::channel::<Record>(capacity)).unzip();
    let (line_txs, line_rxs): (Vec<_>, Vec<_>) =
      (0..sinks).map(|_| mpsc::channel::<LineRecord>(capacity)).unzip();

    let mut opened = Vec::with_capacity(readers);
    for task in 0..readers {
      opened.push(open_reader(&self.source, task, readers, &self.reporter).await?);
    }

    let mut handles: Vec<JoinHandle<PipelineResult<TaskOutcome>>> = Vec::new();
    for (reader, control) in opened.into_iter().zip(ack_rxs) {
      let task = ReaderTask {
        stage: self.source.clone(),
        task_count: readers,
        control,
        outputs: record_txs.clone(),
        router: Router::new(Grouping::Shuffle, transforms),
        reporter: Arc::clone(&self.reporter),
        supervision: self.supervision.clone(),
        shutdown: shutdown.clone(),
        counters: Arc::clone(&counters),
      };
      handles.push(tokio::spawn(task.run(reader)));
    }
    drop(record_txs);

    for (index, input) in record_rxs.into_iter().enumerate() {
      let task = TransformTask {
        component: ComponentInfo::new(self.transform.id.clone(), PipelineStage::Transform, index),
        stage: self.transform.clone(),
        outputs: line_txs.clone(),
        router: Router::new(Grouping::Fields, sinks),
        acks: acks.clone(),
        reporter: Arc::clone(&self.reporter),
        counters: Arc::clone(&counters),
      };
      handles.push(tokio::spawn(task.run(input)));
    }
    drop(line_txs);

    for (index, input) in line_rxs.into_iter().enumerate() {
      let task = SinkTask {
        component: ComponentInfo::new(self.sink.id.clone(), PipelineStage::Sink, index),
        stage: self.sink.clone(),
        acks: acks.clone(),
        reporter: Arc::clone(&self.reporter),
        supervision: self.supervision.clone(),
        shutdown: shutdown.clone(),
        counters: Arc::clone(&counters),
      };
      handles.push(tokio::spawn(task.run(input)));
    }
    drop(acks);

    let results = futures::future::join_all(handles).await;
    let mut report = counters.report(self.name.clone());
    let mut failure = None;
    for result in results {
      match result {
        Ok(Ok(TaskOutcome::Reader(committed))) => report.committed.extend(committed),
        Ok(Ok(TaskOutcome::Transform | TaskOutcome::Sink)) => {}
        Ok(Err(e)) => {
          failure.get_or_insert(e);
        }
        Err(e) => {
          failure.get_or_insert(PipelineError::Join(e.to_string()));
        }
      }
    }
    if let Some(e) = failure {
      error!(pipeline = %self.name, error = %e, "Pipeline failed");
      return Err(e);
    }
    info!(
      pipeline = %self.name,
      emitted = report.records_emitted,
      acked = report.records_acked,
      restarts = report.task_restarts,
      "Pipeline drained"
    );
    Ok(report)
  }
}

async fn open_reader(
  stage: &SourceStage,
  task: usize,
  task_count: usize,
  reporter: &SharedReporter,
) -> SourceResult<SourceReader> {
  SourceReader::open(
    ComponentInfo::new(stage.id.clone(), PipelineStage::Source, task),
    task_count,
    Arc::clone(&stage.log),
    stage.offset_tracker(),
    stage.settings.clone(),
    Arc::clone(reporter),
  )
  .await
}

fn restart_event(reporter: &SharedReporter, counters: &Counters, failure: &FailureReport, restarts: u32) {
  counters.restarts.fetch_add(1, Ordering::Relaxed);
  reporter.report(PipelineEvent::TaskRestarted {
    component: failure.component.clone(),
    restarts,
    reason: failure.error.clone(),
  });
}

struct ReaderTask {
  stage: SourceStage,
  task_count: usize,
  control: mpsc::UnboundedReceiver<Control>,
  outputs: Vec<mpsc::Sender<Record>>,
  router: Router,
  reporter: SharedReporter,
  supervision: SupervisionPolicy,
  shutdown: CancellationToken,
  counters: Arc<Counters>,
}

impl ReaderTask {
  async fn run(mut self, mut reader: SourceReader) -> PipelineResult<TaskOutcome> {
    let mut supervisor = Supervisor::new(self.supervision.clone());
    loop {
      let Err(e) = self.drive(&mut reader).await else {
        break;
      };
      let failure = FailureReport {
        component: reader.component().clone(),
        error: e.to_string(),
      };
      warn!(component = %failure.component, error = %e, "Source reader failed");
      match supervisor.on_failure(&failure) {
        SupervisionDecision::Restart { after, restarts } => {
          restart_event(&self.reporter, &self.counters, &failure, restarts);
          tokio::time::sleep(after).await;
          let task = failure.component.task;
          match open_reader(&self.stage, task, self.task_count, &self.reporter).await {
            Ok(fresh) => reader = fresh,
            Err(e) => {
              self.shutdown.cancel();
              return Err(e.into());
            }
          }
        }
        SupervisionDecision::Escalate { restarts } => {
          self.shutdown.cancel();
          return Err(PipelineError::TaskFailed {
            component: failure.component,
            restarts,
            reason: failure.error,
          });
        }
      }
    }

    let committed = reader
      .assignment()
      .into_iter()
      .filter_map(|p| reader.committed(p).map(|offset| (p, offset)))
      .collect();
    Ok(TaskOutcome::Reader(committed))
  }

  async fn drive(&mut self, reader: &mut SourceReader) -> SourceResult<()> {
    loop {
      while let Ok(control) = self.control.try_recv() {
        self.apply(reader, control).await?;
      }
      if self.shutdown.is_cancelled() {
        break;
      }

      let batch = reader.poll().await?;
      if batch.is_empty() {
        tokio::select! {
          _ = self.shutdown.cancelled() => {}
          control = self.control.recv() => match control {
            Some(control) => self.apply(reader, control).await?,
            None => break,
          },
          _ = tokio::time::sleep(self.stage.poll_interval) => {}
        }
        continue;
      }

      for record in batch {
        let origin = record.reference();
        let target = self.router.select(None);
        Counters::bump(&self.counters.emitted);
        let sent = match self.outputs.get(target) {
          Some(output) => output.send(record).await.is_ok(),
          None => false,
        };
        if !sent {
          error!(component = %reader.component(), record = %origin, "Transform stage is gone");
          reader.fail(origin).await?;
          self.shutdown.cancel();
        }
      }
    }

    reader.shutdown();
    self.outputs.clear();
    while let Some(control) = self.control.recv().await {
      self.apply(reader, control).await?;
    }
    let persisted = reader.commit_pending().await?;
    debug!(component = %reader.component(), persisted = persisted.len(), "Source reader drained");
    Ok(())
  }

  async fn apply(&self, reader: &mut SourceReader, control: Control) -> SourceResult<()> {
    match control {
      Control::Ack(record) => {
        Counters::bump(&self.counters.acked);
        reader.ack(record).await
      }
      Control::Fail(record) => {
        Counters::bump(&self.counters.failed);
        reader.fail(record).await
      }
    }
  }
}

struct TransformTask {
  component: ComponentInfo,
  stage: TransformStage,
  outputs: Vec<mpsc::Sender<LineRecord>>,
  router: Router,
  acks: AckRouter,
  reporter: SharedReporter,
  counters: Arc<Counters>,
}

impl TransformTask {
  async fn run(mut self, mut input: mpsc::Receiver<Record>) -> PipelineResult<TaskOutcome> {
    let transform = Arc::clone(&self.stage.transform);
    while let Some(record) = input.recv().await {
      let origin = record.reference();
      match transform.transform(&record) {
        Ok(Some(line)) => {
          let key = transform.routing_key(&line);
          let target = self.router.select(Some(&key));
          let sent = match self.outputs.get(target) {
            Some(output) => output.send(line).await.is_ok(),
            None => false,
          };
          if sent {
            Counters::bump(&self.counters.transformed);
          } else {
            warn!(component = %self.component, record = %origin, "Sink is gone, failing record");
            self.acks.fail(origin);
          }
        }
        Ok(None) => self.acks.ack(origin),
        Err(e) => {
          Counters::bump(&self.counters.dropped);
          self.reporter.report(PipelineEvent::DataQuality {
            record: origin,
            reason: e.to_string(),
          });
          self.acks.ack(origin);
        }
      }
    }
    debug!(component = %self.component, "Transform drained");
    Ok(TaskOutcome::Transform)
  }
}

struct SinkTask {
  component: ComponentInfo,
  stage: SinkStage,
  acks: AckRouter,
  reporter: SharedReporter,
  supervision: SupervisionPolicy,
  shutdown: CancellationToken,
  counters: Arc<Counters>,
}

impl SinkTask {
  fn build(&self) -> RotatingSink {
    RotatingSink::new(
      self.component.clone(),
      Arc::clone(&self.stage.storage),
      Arc::clone(&self.stage.format),
      Box::new(self.stage.sync_policy()),
      self.stage.settings.clone(),
      Arc::clone(&self.reporter),
    )
  }

  async fn run(self, mut input: mpsc::Receiver<LineRecord>) -> PipelineResult<TaskOutcome> {
    let mut supervisor = Supervisor::new(self.supervision.clone());
    let mut sink = self.build();
    loop {
      let deadline = sink.next_deadline();
      let (result, finished) = tokio::select! {
        line = input.recv() => match line {
          Some(line) => {
            Counters::bump(&self.counters.written);
            (sink.accept(line).await, false)
          }
          None => (sink.finish().await, true),
        },
        _ = deadline_reached(deadline) => (sink.tick().await, false),
      };

      match result {
        Ok(durable) => {
          for record in durable {
            self.acks.ack(record);
          }
        }
        Err(e) => {
          for record in e.unacked() {
            self.acks.fail(*record);
          }
          let failure = FailureReport {
            component: self.component.clone(),
            error: e.to_string(),
          };
          match supervisor.on_failure(&failure) {
            SupervisionDecision::Restart { after, restarts } => {
              restart_event(&self.reporter, &self.counters, &failure, restarts);
              if !finished {
                tokio::time::sleep(after).await;
                sink = self.build();
              }
            }
            SupervisionDecision::Escalate { restarts } => {
              self.shutdown.cancel();
              return Err(PipelineError::TaskFailed {
                component: failure.component,
                restarts,
                reason: failure.error,
              });
            }
          }
        }
      }
      if finished {
        break;
      }
    }
    Ok(TaskOutcome::Sink)
  }
}

async fn deadline_reached(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending::<()>().await,
  }
}

/// Cancels `token` after `duration`, unless it is cancelled first.
pub fn cancel_after(token: CancellationToken, duration: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    tokio::select! {
      _ = token.cancelled() => {}
      _ = tokio::time::sleep(duration) => {
        info!(after_ms = duration.as_millis() as u64, "Run duration elapsed, shutting down");
        token.cancel();
      }
    }
  })
}

//! # Pipeline Definition
//!
//! Assembles the three stages into a [`Pipeline`] with a typestate builder,
//! and describes it as a serializable [`TopologyDefinition`] for submission
//! to a remote coordinator.
//!
//! The builder enforces the stage order at compile time: a source must be
//! set before a transform, and a transform before a sink.
//!
//! ```rust
//! use std::sync::Arc;
//! use streamweave_relay::log_client::MemoryLog;
//! use streamweave_relay::offset::InMemoryOffsetStore;
//! use streamweave_relay::pipeline::{PipelineBuilder, SinkStage, SourceStage, TransformStage};
//! use streamweave_relay::storage::MemoryStorage;
//! use streamweave_relay::transform::UpperCaseTransform;
//!
//! let pipeline = PipelineBuilder::new("demo")
//!   .source(SourceStage::new(
//!     "kafka-reader",
//!     Arc::new(MemoryLog::new()),
//!     Arc::new(InMemoryOffsetStore::new()),
//!   ))
//!   .transform(TransformStage::new("to-upper", Arc::new(UpperCaseTransform::new())))
//!   .sink(SinkStage::new("hdfs-bolt", Arc::new(MemoryStorage::new())));
//!
//! let definition = pipeline.definition();
//! assert_eq!(definition.components.len(), 3);
//! definition.validate().unwrap();
//! ```

use crate::error::{PipelineError, PipelineResult, PipelineStage};
use crate::events::{SharedReporter, TracingReporter};
use crate::log_client::LogClient;
use crate::offset::{CommitStrategy, OffsetResetPolicy, OffsetStore, OffsetTracker};
use crate::routing::Grouping;
use crate::sink::{CountSyncPolicy, DelimitedRecordFormat, RecordFormat, SinkSettings};
use crate::source::SourceSettings;
use crate::storage::DurableStorage;
use crate::supervision::SupervisionPolicy;
use crate::transform::Transform;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// Builder states
/// No stage set yet.
pub struct Empty;
/// Source set.
pub struct HasSource(SourceStage);
/// Source and transform set.
pub struct HasTransform(SourceStage, TransformStage);

/// The source reader stage.
#[derive(Debug, Clone)]
pub struct SourceStage {
  pub(crate) id: String,
  pub(crate) parallelism: usize,
  pub(crate) tasks: usize,
  pub(crate) log: Arc<dyn LogClient>,
  pub(crate) offsets: Arc<dyn OffsetStore>,
  pub(crate) settings: SourceSettings,
  pub(crate) commit_strategy: CommitStrategy,
  pub(crate) reset_policy: OffsetResetPolicy,
  pub(crate) poll_interval: Duration,
}

impl SourceStage {
  /// Creates a single-task source stage with default settings.
  pub fn new(id: impl Into<String>, log: Arc<dyn LogClient>, offsets: Arc<dyn OffsetStore>) -> Self {
    Self {
      id: id.into(),
      parallelism: 1,
      tasks: 1,
      log,
      offsets,
      settings: SourceSettings::default(),
      commit_strategy: CommitStrategy::default(),
      reset_policy: OffsetResetPolicy::default(),
      poll_interval: Duration::from_millis(50),
    }
  }

  /// Sets executors and task instances.
  #[must_use]
  pub fn with_parallelism(mut self, parallelism: usize, tasks: usize) -> Self {
    self.parallelism = parallelism;
    self.tasks = tasks;
    self
  }

  /// Sets the reader settings.
  #[must_use]
  pub fn with_settings(mut self, settings: SourceSettings) -> Self {
    self.settings = settings;
    self
  }

  /// Sets the commit strategy.
  #[must_use]
  pub fn with_commit_strategy(mut self, strategy: CommitStrategy) -> Self {
    self.commit_strategy = strategy;
    self
  }

  /// Sets the start position for partitions without a committed offset.
  #[must_use]
  pub fn with_reset_policy(mut self, policy: OffsetResetPolicy) -> Self {
    self.reset_policy = policy;
    self
  }

  /// Sets the idle wait between empty polls.
  #[must_use]
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub(crate) fn offset_tracker(&self) -> OffsetTracker {
    OffsetTracker::new(Arc::clone(&self.offsets))
      .with_strategy(self.commit_strategy)
      .with_reset_policy(self.reset_policy)
  }
}

/// The transform stage.
#[derive(Debug, Clone)]
pub struct TransformStage {
  pub(crate) id: String,
  pub(crate) parallelism: usize,
  pub(crate) tasks: usize,
  pub(crate) transform: Arc<dyn Transform>,
}

impl TransformStage {
  /// Creates a single-task transform stage.
  pub fn new(id: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
    Self {
      id: id.into(),
      parallelism: 1,
      tasks: 1,
      transform,
    }
  }

  /// Sets executors and task instances.
  #[must_use]
  pub fn with_parallelism(mut self, parallelism: usize, tasks: usize) -> Self {
    self.parallelism = parallelism;
    self.tasks = tasks;
    self
  }
}

/// The rotating sink stage.
#[derive(Debug, Clone)]
pub struct SinkStage {
  pub(crate) id: String,
  pub(crate) parallelism: usize,
  pub(crate) tasks: usize,
  pub(crate) storage: Arc<dyn DurableStorage>,
  pub(crate) storage_url: String,
  pub(crate) format: Arc<dyn RecordFormat>,
  pub(crate) sync_every: usize,
  pub(crate) settings: SinkSettings,
}

impl SinkStage {
  /// Creates a single-task sink stage writing tab-delimited records.
  pub fn new(id: impl Into<String>, storage: Arc<dyn DurableStorage>) -> Self {
    Self {
      id: id.into(),
      parallelism: 1,
      tasks: 1,
      storage,
      storage_url: "memory://".to_string(),
      format: Arc::new(DelimitedRecordFormat::new().with_field_delimiter("\t")),
      sync_every: 1000,
      settings: SinkSettings::default(),
    }
  }

  /// Sets executors and task instances.
  #[must_use]
  pub fn with_parallelism(mut self, parallelism: usize, tasks: usize) -> Self {
    self.parallelism = parallelism;
    self.tasks = tasks;
    self
  }

  /// Sets the record format.
  #[must_use]
  pub fn with_format(mut self, format: Arc<dyn RecordFormat>) -> Self {
    self.format = format;
    self
  }

  /// Flushes after every `count` records.
  #[must_use]
  pub fn with_sync_every(mut self, count: usize) -> Self {
    self.sync_every = count;
    self
  }

  /// Sets naming, rotation and retry settings.
  #[must_use]
  pub fn with_settings(mut self, settings: SinkSettings) -> Self {
    self.settings = settings;
    self
  }

  /// Records the storage URL in the topology definition.
  #[must_use]
  pub fn with_storage_url(mut self, url: impl Into<String>) -> Self {
    self.storage_url = url.into();
    self
  }

  pub(crate) fn sync_policy(&self) -> CountSyncPolicy {
    CountSyncPolicy::new(self.sync_every)
  }
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder<State> {
  name: String,
  stages: State,
  reporter: SharedReporter,
  supervision: SupervisionPolicy,
  channel_capacity: usize,
  max_task_parallelism: Option<usize>,
  workers: usize,
}

impl PipelineBuilder<Empty> {
  /// Starts a pipeline named `name`.
  pub fn new(name: impl Into<String>) -> Self {
    PipelineBuilder {
      name: name.into(),
      stages: Empty,
      reporter: TracingReporter::shared(),
      supervision: SupervisionPolicy::default(),
      channel_capacity: 1024,
      max_task_parallelism: None,
      workers: 1,
    }
  }

  /// Sets the source stage.
  pub fn source(self, source: SourceStage) -> PipelineBuilder<HasSource> {
    self.advance(HasSource(source))
  }
}

impl PipelineBuilder<HasSource> {
  /// Sets the transform stage.
  pub fn transform(self, transform: TransformStage) -> PipelineBuilder<HasTransform> {
    let HasSource(source) = self.stages;
    PipelineBuilder {
      name: self.name,
      stages: HasTransform(source, transform),
      reporter: self.reporter,
      supervision: self.supervision,
      channel_capacity: self.channel_capacity,
      max_task_parallelism: self.max_task_parallelism,
      workers: self.workers,
    }
  }
}

impl PipelineBuilder<HasTransform> {
  /// Sets the sink stage and completes the pipeline.
  pub fn sink(self, sink: SinkStage) -> Pipeline {
    let HasTransform(source, transform) = self.stages;
    Pipeline {
      name: self.name,
      source,
      transform,
      sink,
      reporter: self.reporter,
      supervision: self.supervision,
      channel_capacity: self.channel_capacity,
      max_task_parallelism: self.max_task_parallelism,
      workers: self.workers,
    }
  }
}

impl<State> PipelineBuilder<State> {
  fn advance<Next>(self, stages: Next) -> PipelineBuilder<Next> {
    PipelineBuilder {
      name: self.name,
      stages,
      reporter: self.reporter,
      supervision: self.supervision,
      channel_capacity: self.channel_capacity,
      max_task_parallelism: self.max_task_parallelism,
      workers: self.workers,
    }
  }

  /// Sets the reporter receiving operational events.
  #[must_use]
  pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Sets the restart policy for failed tasks.
  #[must_use]
  pub fn with_supervision(mut self, policy: SupervisionPolicy) -> Self {
    self.supervision = policy;
    self
  }

  /// Sets the capacity of the channels between stages.
  #[must_use]
  pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
    self.channel_capacity = capacity;
    self
  }

  /// Caps task instances per component.
  #[must_use]
  pub fn with_max_task_parallelism(mut self, max: usize) -> Self {
    self.max_task_parallelism = Some(max);
    self
  }

  /// Sets the worker processes requested from a cluster.
  #[must_use]
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }
}

/// A fully assembled pipeline, ready to run locally or be submitted.
#[derive(Debug, Clone)]
pub struct Pipeline {
  pub(crate) name: String,
  pub(crate) source: SourceStage,
  pub(crate) transform: TransformStage,
  pub(crate) sink: SinkStage,
  pub(crate) reporter: SharedReporter,
  pub(crate) supervision: SupervisionPolicy,
  pub(crate) channel_capacity: usize,
  pub(crate) max_task_parallelism: Option<usize>,
  pub(crate) workers: usize,
}

impl Pipeline {
  /// Pipeline name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Caps task instances per component.
  #[must_use]
  pub fn with_max_task_parallelism(mut self, max: usize) -> Self {
    self.max_task_parallelism = Some(max);
    self
  }

  /// Sets the worker processes requested from a cluster.
  #[must_use]
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  /// Task instances actually started for a stage.
  pub fn effective_tasks(&self, stage: PipelineStage) -> usize {
    let tasks = match stage {
      PipelineStage::Source => self.source.tasks,
      PipelineStage::Transform => self.transform.tasks,
      PipelineStage::Sink => self.sink.tasks,
    };
    match self.max_task_parallelism {
      Some(max) => tasks.min(max).max(1),
      None => tasks.max(1),
    }
  }

  /// Describes the pipeline for a remote coordinator.
  pub fn definition(&self) -> TopologyDefinition {
    let source = &self.source;
    let sink = &self.sink;
    TopologyDefinition {
      name: self.name.clone(),
      workers: self.workers,
      max_task_parallelism: self.max_task_parallelism,
      message_timeout: source.settings.message_timeout,
      components: vec![
        ComponentSpec {
          id: source.id.clone(),
          stage: PipelineStage::Source,
          parallelism: source.parallelism,
          tasks: source.tasks,
          input: None,
          config: serde_json::json!({
            "stream": source.settings.stream,
            "offset_root": source.settings.offset_root,
            "group": source.settings.group,
            "start_from_beginning": source.reset_policy == OffsetResetPolicy::Earliest,
            "window_capacity": source.settings.window_capacity,
            "max_retries": source.settings.max_retries,
          }),
        },
        ComponentSpec {
          id: self.transform.id.clone(),
          stage: PipelineStage::Transform,
          parallelism: self.transform.parallelism,
          tasks: self.transform.tasks,
          input: Some(InputSpec {
            from: source.id.clone(),
            grouping: Grouping::Shuffle,
            fields: Vec::new(),
          }),
          config: serde_json::json!({
            "transform": format!("{:?}", self.transform.transform),
            "fields": ["line", "len"],
          }),
        },
        ComponentSpec {
          id: sink.id.clone(),
          stage: PipelineStage::Sink,
          parallelism: sink.parallelism,
          tasks: sink.tasks,
          input: Some(InputSpec {
            from: self.transform.id.clone(),
            grouping: Grouping::Fields,
            fields: vec!["line".to_string()],
          }),
          config: serde_json::json!({
            "fs_url": sink.storage_url,
            "path": sink.settings.file_names.path(),
            "sync_every": sink.sync_every,
            "sync_interval": sink.settings.sync_interval.map(|d| d.as_millis() as u64),
            "rotation": sink.settings.rotation,
          }),
        },
      ],
    }
  }
}

/// Where a component's input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
  /// Upstream component id.
  pub from: String,
  /// How upstream output is distributed over this component's tasks.
  pub grouping: Grouping,
  /// Fields hashed by a fields grouping.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub fields: Vec<String>,
}

/// One component of a [`TopologyDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
  /// Component id.
  pub id: String,
  /// Stage the component implements.
  pub stage: PipelineStage,
  /// Executors requested.
  pub parallelism: usize,
  /// Task instances.
  pub tasks: usize,
  /// Upstream connection; `None` for the source.
  pub input: Option<InputSpec>,
  /// Component-specific settings.
  #[serde(default)]
  pub config: serde_json::Value,
}

/// Serializable description of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDefinition {
  /// Topology name.
  pub name: String,
  /// Worker processes requested.
  pub workers: usize,
  /// Cap on task instances per component.
  pub max_task_parallelism: Option<usize>,
  /// In-flight records older than this are replayed.
  #[serde(with = "crate::backoff::millis")]
  pub message_timeout: Duration,
  /// Components in dependency order.
  pub components: Vec<ComponentSpec>,
}

impl TopologyDefinition {
  /// Checks that the definition describes a runnable DAG.
  ///
  /// Requires a name, unique non-empty ids, positive counts, exactly one
  /// source, and inputs that refer to components declared earlier. A sink's
  /// `sync_interval` (milliseconds) must be shorter than the message timeout.
  pub fn validate(&self) -> PipelineResult<()> {
    let fail = |reason: String| Err(PipelineError::InvalidDefinition(reason));
    if self.name.trim().is_empty() {
      return fail("topology name is empty".to_string());
    }
    if self.workers == 0 {
      return fail("workers must be at least 1".to_string());
    }
    if self.max_task_parallelism == Some(0) {
      return fail("max task parallelism must be at least 1".to_string());
    }

    let mut seen = HashSet::new();
    let mut sources = 0;
    for component in &self.components {
      if component.id.trim().is_empty() {
        return fail("component id is empty".to_string());
      }
      if component.parallelism == 0 || component.tasks == 0 {
        return fail(format!("component {} has no tasks", component.id));
      }
      match &component.input {
        None if component.stage == PipelineStage::Source => sources += 1,
        None => return fail(format!("component {} has no input", component.id)),
        Some(_) if component.stage == PipelineStage::Source => {
          return fail(format!("source {} cannot have an input", component.id));
        }
        Some(input) => {
          if !seen.contains(input.from.as_str()) {
            return fail(format!(
              "component {} reads from unknown component {}",
              component.id, input.from
            ));
          }
          if input.grouping == Grouping::Fields && input.fields.is_empty() {
            return fail(format!("fields grouping into {} names no fields", component.id));
          }
        }
      }
      if !seen.insert(component.id.as_str()) {
        return fail(format!("duplicate component id {}", component.id));
      }
      if let Some(sync_ms) = component.config.get("sync_interval").and_then(|v| v.as_u64())
        && Duration::from_millis(sync_ms) >= self.message_timeout
      {
        return fail(format!(
          "sync interval of {} ({sync_ms} ms) must be shorter than the message timeout",
          component.id
        ));
      }
    }
    if sources != 1 {
      return fail(format!("expected exactly one source, found {sources}"));
    }
    Ok(())
  }
}

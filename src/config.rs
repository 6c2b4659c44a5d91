//! # Configuration
//!
//! Operator-facing configuration of a relay, loaded from JSON.
//!
//! Every section implements `Default` with the values of the reference
//! Kafka → uppercase → HDFS topology, and every field may be omitted from the
//! file. [`RelayConfig::validate`] rejects values the pipeline cannot run
//! with; [`RelayConfig::from_file`] validates before returning.
//!
//! ## Example
//!
//! ```rust
//! use streamweave_relay::config::{DeployMode, RelayConfig};
//!
//! let config = RelayConfig::from_json(r#"{
//!   "source": { "stream": "access_log", "start_from_beginning": false },
//!   "sink": { "sync_every": 10, "rotation": { "file_size": 1048576 } },
//!   "deploy": { "mode": "cluster", "coordinator_url": "http://nimbus:8080" }
//! }"#).unwrap();
//!
//! assert_eq!(config.source.stream, "access_log");
//! assert_eq!(config.source.group, "word");
//! assert!(matches!(config.deploy, DeployMode::Cluster { workers: 2, .. }));
//! ```

use crate::backoff::Backoff;
use crate::error::PipelineResult;
use crate::events::SharedReporter;
use crate::log_client::LogClient;
use crate::offset::{
  CommitStrategy, FileOffsetStore, InMemoryOffsetStore, OffsetResetPolicy, OffsetResult,
  OffsetStore, OffsetTracker,
};
use crate::pipeline::{Pipeline, PipelineBuilder, SinkStage, SourceStage, TransformStage};
use crate::sink::{DefaultFileNameFormat, DelimitedRecordFormat, RotationPolicy, SinkSettings};
use crate::source::{ReplayPolicy, SourceSettings};
use crate::storage::DurableStorage;
use crate::supervision::SupervisionPolicy;
use crate::transform::UpperCaseTransform;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("cannot read {path}: {source}")]
  Io {
    /// File that failed to load.
    path: PathBuf,
    /// Underlying error.
    #[source]
    source: std::io::Error,
  },
  /// The configuration is not valid JSON for this schema.
  #[error("cannot parse configuration: {0}")]
  Parse(#[from] serde_json::Error),
  /// A field holds a value the pipeline cannot run with.
  #[error("invalid value for {field}: {reason}")]
  Invalid {
    /// Dotted path of the offending field.
    field: &'static str,
    /// What is wrong with it.
    reason: String,
  },
  /// The storage URL uses a scheme this build cannot write to.
  #[error("unsupported storage url: {0}")]
  UnsupportedStorage(String),
}

impl crate::error::Classify for ConfigError {
  fn class(&self) -> crate::error::FailureClass {
    crate::error::FailureClass::FatalTask
  }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
  ConfigError::Invalid {
    field,
    reason: reason.into(),
  }
}

/// Complete configuration of a relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
  /// Where records are read from.
  pub source: SourceConfig,
  /// Where records are written to.
  pub sink: SinkConfig,
  /// Component names and parallelism.
  pub topology: TopologyConfig,
  /// Where committed offsets are kept.
  pub offsets: OffsetStoreConfig,
  /// Restart policy for failed tasks.
  pub supervision: SupervisionPolicy,
  /// Local run or cluster submission.
  pub deploy: DeployMode,
}

impl RelayConfig {
  /// Parses and validates a JSON document.
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Reads, parses and validates a JSON file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&json)
  }

  /// Checks every section.
  ///
  /// Records wait up to `sink.sync_interval` for the flush that acks them,
  /// so `source.message_timeout` must be longer or healthy records would be
  /// replayed.
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.source.validate()?;
    self.sink.validate()?;
    self.topology.validate()?;
    self.deploy.validate()?;
    if self.source.message_timeout <= self.sink.sync_interval {
      return Err(invalid(
        "source.message_timeout",
        format!(
          "must exceed sink.sync_interval ({:?} <= {:?})",
          self.source.message_timeout, self.sink.sync_interval
        ),
      ));
    }
    Ok(())
  }

  /// Sets the source section.
  #[must_use]
  pub fn with_source(mut self, source: SourceConfig) -> Self {
    self.source = source;
    self
  }

  /// Sets the sink section.
  #[must_use]
  pub fn with_sink(mut self, sink: SinkConfig) -> Self {
    self.sink = sink;
    self
  }

  /// Sets the topology section.
  #[must_use]
  pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
    self.topology = topology;
    self
  }

  /// Sets the offset store.
  #[must_use]
  pub fn with_offsets(mut self, offsets: OffsetStoreConfig) -> Self {
    self.offsets = offsets;
    self
  }

  /// Sets the deployment mode.
  #[must_use]
  pub fn with_deploy(mut self, deploy: DeployMode) -> Self {
    self.deploy = deploy;
    self
  }

  /// Assembles the pipeline described by this configuration.
  ///
  /// The log client and durable storage are supplied by the caller; the
  /// offset store is opened from [`offsets`](Self::offsets).
  pub fn build_pipeline(
    &self,
    log: Arc<dyn LogClient>,
    storage: Arc<dyn DurableStorage>,
    reporter: SharedReporter,
  ) -> PipelineResult<Pipeline> {
    self.validate()?;
    let topology = &self.topology;
    let source = SourceStage::new(topology.reader.id.clone(), log, self.offsets.open()?)
      .with_parallelism(topology.reader.parallelism, topology.reader.tasks)
      .with_settings(self.source.settings())
      .with_commit_strategy(self.source.commit_strategy)
      .with_reset_policy(self.source.reset_policy())
      .with_poll_interval(self.source.poll_interval);
    let transform = TransformStage::new(topology.transform.id.clone(), Arc::new(UpperCaseTransform::new()))
      .with_parallelism(topology.transform.parallelism, topology.transform.tasks);
    let sink = SinkStage::new(topology.sink.id.clone(), storage)
      .with_parallelism(topology.sink.parallelism, topology.sink.tasks)
      .with_format(Arc::new(self.sink.record_format()))
      .with_sync_every(self.sink.sync_every)
      .with_settings(self.sink.settings())
      .with_storage_url(self.sink.fs_url.clone());

    let mut pipeline = PipelineBuilder::new(topology.name.clone())
      .with_reporter(reporter)
      .with_supervision(self.supervision.clone())
      .with_channel_capacity(topology.channel_capacity)
      .source(source)
      .transform(transform)
      .sink(sink);
    pipeline = match self.deploy {
      DeployMode::Local {
        max_task_parallelism,
        ..
      } => pipeline.with_max_task_parallelism(max_task_parallelism),
      DeployMode::Cluster { workers, .. } => pipeline.with_workers(workers),
    };
    Ok(pipeline)
  }
}

/// Source reader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
  /// Log endpoints (`host:port`).
  pub endpoints: Vec<String>,
  /// Stream (topic) to read.
  pub stream: String,
  /// Root namespace of the committed offsets.
  pub offset_root: String,
  /// Consumer group id.
  pub group: String,
  /// Start at the earliest offset when nothing is committed; otherwise
  /// start at the latest.
  pub start_from_beginning: bool,
  /// In-flight window per reader task.
  pub window_capacity: usize,
  /// Records fetched per partition read.
  pub fetch_size: usize,
  /// Replays per record before it is skipped.
  pub max_retries: u32,
  /// Replay delay.
  pub retry_backoff: Backoff,
  /// Delay before re-reading an unavailable partition.
  pub unavailable_backoff: Backoff,
  /// What to replay after a failure.
  pub replay: ReplayPolicy,
  /// In-flight records older than this are replayed.
  #[serde(with = "crate::backoff::millis")]
  pub message_timeout: Duration,
  /// When committed offsets are persisted.
  pub commit_strategy: CommitStrategy,
  /// Idle wait between polls that returned nothing.
  #[serde(with = "crate::backoff::millis")]
  pub poll_interval: Duration,
}

impl Default for SourceConfig {
  fn default() -> Self {
    let settings = SourceSettings::default();
    Self {
      endpoints: vec![
        "zk1:2181".to_string(),
        "zk2:2181".to_string(),
        "zk3:2181".to_string(),
      ],
      stream: settings.stream,
      offset_root: settings.offset_root,
      group: settings.group,
      start_from_beginning: true,
      window_capacity: settings.window_capacity,
      fetch_size: settings.fetch_size,
      max_retries: settings.max_retries,
      retry_backoff: settings.retry_backoff,
      unavailable_backoff: settings.unavailable_backoff,
      replay: settings.replay,
      message_timeout: settings.message_timeout,
      commit_strategy: CommitStrategy::Auto,
      poll_interval: Duration::from_millis(50),
    }
  }
}

impl SourceConfig {
  /// Reader settings derived from this section.
  pub fn settings(&self) -> SourceSettings {
    SourceSettings {
      stream: self.stream.clone(),
      offset_root: self.offset_root.clone(),
      group: self.group.clone(),
      window_capacity: self.window_capacity,
      fetch_size: self.fetch_size,
      max_retries: self.max_retries,
      retry_backoff: self.retry_backoff,
      unavailable_backoff: self.unavailable_backoff,
      replay: self.replay,
      message_timeout: self.message_timeout,
    }
  }

  /// Start position for partitions without a committed offset.
  pub fn reset_policy(&self) -> OffsetResetPolicy {
    if self.start_from_beginning {
      OffsetResetPolicy::Earliest
    } else {
      OffsetResetPolicy::Latest
    }
  }

  /// Offset tracker over `store` applying this section's policies.
  pub fn offset_tracker(&self, store: Arc<dyn OffsetStore>) -> OffsetTracker {
    OffsetTracker::new(store)
      .with_strategy(self.commit_strategy)
      .with_reset_policy(self.reset_policy())
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.stream.trim().is_empty() {
      return Err(invalid("source.stream", "must not be empty"));
    }
    if self.group.trim().is_empty() {
      return Err(invalid("source.group", "must not be empty"));
    }
    if self.window_capacity == 0 {
      return Err(invalid("source.window_capacity", "must be at least 1"));
    }
    if self.fetch_size == 0 {
      return Err(invalid("source.fetch_size", "must be at least 1"));
    }
    if self.message_timeout.is_zero() {
      return Err(invalid("source.message_timeout", "must be positive"));
    }
    if let CommitStrategy::Periodic(0) = self.commit_strategy {
      return Err(invalid("source.commit_strategy", "periodic interval must be at least 1"));
    }
    Ok(())
  }
}

/// Rotating sink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
  /// Durable store: `file://<root>`, `memory://`, or `hdfs://host:port`
  /// (cluster only).
  pub fs_url: String,
  /// Output directory.
  pub path: PathBuf,
  /// Segment file name prefix.
  pub prefix: String,
  /// Segment file extension.
  pub extension: String,
  /// Delimiter between fields.
  pub field_delimiter: String,
  /// Delimiter after each record.
  pub record_delimiter: String,
  /// Flush after this many records.
  pub sync_every: usize,
  /// Flush records that have waited this long, however few.
  #[serde(with = "crate::backoff::millis")]
  pub sync_interval: Duration,
  /// When segments are rotated.
  pub rotation: RotationPolicy,
  /// Retries per storage operation.
  pub max_write_retries: u32,
  /// Delay between storage retries.
  pub retry_backoff: Backoff,
}

impl Default for SinkConfig {
  fn default() -> Self {
    Self {
      fs_url: "hdfs://hadoop6:8020".to_string(),
      path: PathBuf::from("/data/storm/"),
      prefix: "app_".to_string(),
      extension: ".log".to_string(),
      field_delimiter: "\t".to_string(),
      record_delimiter: "\n".to_string(),
      sync_every: 1000,
      sync_interval: Duration::from_secs(10),
      rotation: RotationPolicy::Timed(Duration::from_secs(60)),
      max_write_retries: 5,
      retry_backoff: Backoff::default(),
    }
  }
}

/// Durable store selected by [`SinkConfig::fs_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
  /// Local filesystem below a root directory.
  Local(PathBuf),
  /// In-process memory.
  Memory,
  /// Remote HDFS namenode, reachable from cluster workers only.
  Hdfs(String),
}

impl SinkConfig {
  /// Sink settings derived from this section.
  pub fn settings(&self) -> SinkSettings {
    SinkSettings {
      file_names: self.file_names(),
      rotation: self.rotation,
      sync_interval: Some(self.sync_interval),
      max_write_retries: self.max_write_retries,
      retry_backoff: self.retry_backoff,
    }
  }

  /// Segment name format.
  pub fn file_names(&self) -> DefaultFileNameFormat {
    DefaultFileNameFormat::new()
      .with_path(self.path.clone())
      .with_prefix(self.prefix.clone())
      .with_extension(self.extension.clone())
  }

  /// Record format.
  pub fn record_format(&self) -> DelimitedRecordFormat {
    DelimitedRecordFormat::new()
      .with_field_delimiter(self.field_delimiter.clone())
      .with_record_delimiter(self.record_delimiter.clone())
  }

  /// Parses [`fs_url`](Self::fs_url).
  pub fn backend(&self) -> Result<StorageBackend, ConfigError> {
    let url = self.fs_url.trim();
    if let Some(root) = url.strip_prefix("file://") {
      let root = if root.is_empty() { "/" } else { root };
      Ok(StorageBackend::Local(PathBuf::from(root)))
    } else if url == "memory://" {
      Ok(StorageBackend::Memory)
    } else if url.starts_with("hdfs://") {
      Ok(StorageBackend::Hdfs(url.to_string()))
    } else {
      Err(ConfigError::UnsupportedStorage(url.to_string()))
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    self.backend()?;
    if self.sync_every == 0 {
      return Err(invalid("sink.sync_every", "must be at least 1"));
    }
    if self.record_delimiter.is_empty() {
      return Err(invalid("sink.record_delimiter", "must not be empty"));
    }
    if self.sync_interval.is_zero() {
      return Err(invalid("sink.sync_interval", "must be positive"));
    }
    match self.rotation {
      RotationPolicy::Timed(interval) if interval.is_zero() => {
        Err(invalid("sink.rotation", "interval must be positive"))
      }
      RotationPolicy::FileSize(0) => Err(invalid("sink.rotation", "size must be positive")),
      _ => Ok(()),
    }
  }
}

/// One component of the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
  /// Component id, used in logs, segment names and the topology definition.
  pub id: String,
  /// Executors requested from the cluster.
  pub parallelism: usize,
  /// Task instances.
  pub tasks: usize,
}

impl ComponentConfig {
  /// Creates a component entry.
  pub fn new(id: impl Into<String>, parallelism: usize, tasks: usize) -> Self {
    Self {
      id: id.into(),
      parallelism,
      tasks,
    }
  }

  fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
    if self.id.trim().is_empty() {
      return Err(invalid(field, "id must not be empty"));
    }
    if self.parallelism == 0 || self.tasks == 0 {
      return Err(invalid(field, "parallelism and tasks must be at least 1"));
    }
    Ok(())
  }
}

/// Names and parallelism of the three stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
  /// Topology name.
  pub name: String,
  /// Source reader component.
  pub reader: ComponentConfig,
  /// Transform component.
  pub transform: ComponentConfig,
  /// Sink component.
  pub sink: ComponentConfig,
  /// Capacity of the channels between stages.
  pub channel_capacity: usize,
}

impl Default for TopologyConfig {
  fn default() -> Self {
    Self {
      name: "KafkaToStormToHDFSTopology".to_string(),
      reader: ComponentConfig::new("kafka-reader", 5, 5),
      transform: ComponentConfig::new("to-upper", 2, 4),
      sink: ComponentConfig::new("hdfs-bolt", 2, 4),
      channel_capacity: 1024,
    }
  }
}

impl TopologyConfig {
  fn validate(&self) -> Result<(), ConfigError> {
    if self.name.trim().is_empty() {
      return Err(invalid("topology.name", "must not be empty"));
    }
    self.reader.validate("topology.reader")?;
    self.transform.validate("topology.transform")?;
    self.sink.validate("topology.sink")?;
    let ids: HashSet<&str> = [&self.reader.id, &self.transform.id, &self.sink.id]
      .into_iter()
      .map(String::as_str)
      .collect();
    if ids.len() != 3 {
      return Err(invalid("topology", "component ids must be distinct"));
    }
    if self.channel_capacity == 0 {
      return Err(invalid("topology.channel_capacity", "must be at least 1"));
    }
    Ok(())
  }
}

/// Where committed offsets are persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OffsetStoreConfig {
  /// In process memory; offsets are lost on exit.
  #[default]
  Memory,
  /// A JSON file.
  File {
    /// Path of the offsets file.
    path: PathBuf,
  },
}

impl OffsetStoreConfig {
  /// Opens the configured store.
  pub fn open(&self) -> OffsetResult<Arc<dyn OffsetStore>> {
    Ok(match self {
      OffsetStoreConfig::Memory => Arc::new(InMemoryOffsetStore::new()),
      OffsetStoreConfig::File { path } => Arc::new(FileOffsetStore::new(path)?),
    })
  }
}

fn default_run_for() -> Duration {
  Duration::from_secs(600)
}

fn default_max_task_parallelism() -> usize {
  3
}

fn default_workers() -> usize {
  2
}

/// How the pipeline is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeployMode {
  /// Run in this process for a bounded time, then drain and stop.
  Local {
    /// How long to run before shutting down.
    #[serde(with = "crate::backoff::millis", default = "default_run_for")]
    run_for: Duration,
    /// Cap on task instances per component.
    #[serde(default = "default_max_task_parallelism")]
    max_task_parallelism: usize,
  },
  /// Submit the topology definition to a remote coordinator.
  Cluster {
    /// Coordinator base URL, e.g. `http://nimbus:8080`.
    coordinator_url: String,
    /// Worker processes requested.
    #[serde(default = "default_workers")]
    workers: usize,
  },
}

impl Default for DeployMode {
  fn default() -> Self {
    DeployMode::Local {
      run_for: default_run_for(),
      max_task_parallelism: default_max_task_parallelism(),
    }
  }
}

impl DeployMode {
  fn validate(&self) -> Result<(), ConfigError> {
    match self {
      DeployMode::Local {
        max_task_parallelism,
        ..
      } if *max_task_parallelism == 0 => {
        Err(invalid("deploy.max_task_parallelism", "must be at least 1"))
      }
      DeployMode::Cluster {
        coordinator_url, ..
      } if !coordinator_url.starts_with("http://") => Err(invalid(
        "deploy.coordinator_url",
        format!("expected an http:// url, got {coordinator_url:?}"),
      )),
      DeployMode::Cluster { workers: 0, .. } => {
        Err(invalid("deploy.workers", "must be at least 1"))
      }
      _ => Ok(()),
    }
  }
}

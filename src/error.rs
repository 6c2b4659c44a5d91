//! # Error Handling
//!
//! Failure taxonomy and pipeline-level errors for the relay.
//!
//! ## Overview
//!
//! Every component error type reports a [`FailureClass`], which decides where
//! the failure is handled:
//!
//! - **Transient**: infrastructure hiccup (log or storage unavailable). Retried
//!   with exponential backoff at the I/O boundary.
//! - **DataQuality**: one malformed record. Dropped and reported; the pipeline
//!   keeps running.
//! - **PermanentRecord**: a record that kept failing past its retry budget.
//!   Skipped (its offset is committed past) and reported.
//! - **FatalTask**: unrecoverable for the task instance. The coordinator
//!   restarts the task, which resumes from the last committed offset.
//!
//! Only `FatalTask` failures that exhaust the supervision budget surface as a
//! [`PipelineError`] to the caller.
//!
//! ## Example
//!
//! ```rust
//! use streamweave_relay::error::{Classify, FailureClass};
//! use streamweave_relay::storage::StorageError;
//!
//! let err = StorageError::Unavailable("namenode down".to_string());
//! assert_eq!(err.class(), FailureClass::Transient);
//! ```

use crate::config::ConfigError;
use crate::offset::OffsetError;
use crate::source::SourceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a failure is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
  /// Retried with backoff at the I/O boundary.
  Transient,
  /// Single record dropped and reported.
  DataQuality,
  /// Record skipped after its retry budget was exhausted.
  PermanentRecord,
  /// Task instance terminated and restarted by the coordinator.
  FatalTask,
}

impl fmt::Display for FailureClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FailureClass::Transient => "transient",
      FailureClass::DataQuality => "data-quality",
      FailureClass::PermanentRecord => "permanent-record",
      FailureClass::FatalTask => "fatal-task",
    };
    f.write_str(name)
  }
}

/// Implemented by every component error so callers can route it.
pub trait Classify {
  /// Returns the failure class of this error.
  fn class(&self) -> FailureClass;
}

/// Stage of the pipeline a task instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
  /// Source reader.
  Source,
  /// Transform stage.
  Transform,
  /// Rotating sink.
  Sink,
}

impl fmt::Display for PipelineStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PipelineStage::Source => "source",
      PipelineStage::Transform => "transform",
      PipelineStage::Sink => "sink",
    };
    f.write_str(name)
  }
}

/// Information about a pipeline component task, used in logs and reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentInfo {
  /// The component id from the topology definition (e.g. `hdfs-bolt`).
  pub name: String,
  /// Stage the component belongs to.
  pub stage: PipelineStage,
  /// Task index within the component.
  pub task: usize,
}

impl ComponentInfo {
  /// Creates a new `ComponentInfo`.
  pub fn new(name: impl Into<String>, stage: PipelineStage, task: usize) -> Self {
    Self {
      name: name.into(),
      stage,
      task,
    }
  }
}

impl fmt::Display for ComponentInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.name, self.task)
  }
}

/// Errors surfaced by the pipeline coordinator.
#[derive(Error, Debug)]
pub enum PipelineError {
  /// The configuration was rejected.
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),
  /// The pipeline definition was rejected.
  #[error("invalid pipeline definition: {0}")]
  InvalidDefinition(String),
  /// Offsets could not be loaded or persisted.
  #[error("offset store error: {0}")]
  Offset(#[from] OffsetError),
  /// A source reader could not be opened.
  #[error("source error: {0}")]
  Source(#[from] SourceError),
  /// A task instance failed more often than its supervision policy allows.
  #[error("task {component} failed permanently after {restarts} restarts: {reason}")]
  TaskFailed {
    /// The failed task.
    component: ComponentInfo,
    /// Restarts performed before giving up.
    restarts: u32,
    /// Last failure.
    reason: String,
  },
  /// A task panicked or was aborted.
  #[error("task join error: {0}")]
  Join(String),
}

impl Classify for PipelineError {
  fn class(&self) -> FailureClass {
    FailureClass::FatalTask
  }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

//! # Error Handling Test Suite
//!
//! Failure classes of every component error and display of the
//! pipeline-level errors.

use crate::config::ConfigError;
use crate::error::{Classify, ComponentInfo, FailureClass, PipelineError, PipelineStage};
use crate::log_client::LogError;
use crate::offset::OffsetError;
use crate::record::PartitionId;
use crate::source::SourceError;

#[test]
fn test_failure_class_display() {
  assert_eq!(FailureClass::Transient.to_string(), "transient");
  assert_eq!(FailureClass::DataQuality.to_string(), "data-quality");
  assert_eq!(FailureClass::PermanentRecord.to_string(), "permanent-record");
  assert_eq!(FailureClass::FatalTask.to_string(), "fatal-task");
}

#[test]
fn test_component_info_display() {
  let info = ComponentInfo::new("hdfs-bolt", PipelineStage::Sink, 3);
  assert_eq!(info.to_string(), "hdfs-bolt[3]");
  assert_eq!(info.stage.to_string(), "sink");
  assert_eq!(PipelineStage::Source.to_string(), "source");
  assert_eq!(PipelineStage::Transform.to_string(), "transform");
}

#[test]
fn test_log_error_classes() {
  assert_eq!(
    LogError::Unavailable("leader election".into()).class(),
    FailureClass::Transient
  );
  assert_eq!(
    LogError::OffsetOutOfRange {
      partition: PartitionId(0),
      requested: 1,
      earliest: 5
    }
    .class(),
    FailureClass::Transient
  );
  assert_eq!(
    LogError::Corrupt {
      partition: PartitionId(1),
      offset: 9,
      reason: "crc".into()
    }
    .class(),
    FailureClass::PermanentRecord
  );
  assert_eq!(
    LogError::UnknownStream("nope".into()).class(),
    FailureClass::FatalTask
  );
}

#[test]
fn test_source_error_inherits_class() {
  let err = SourceError::from(LogError::Unavailable("down".into()));
  assert_eq!(err.class(), FailureClass::Transient);
  let err = SourceError::from(OffsetError::NotFound("/storm/word/t/0".into()));
  assert_eq!(err.class(), FailureClass::FatalTask);
}

#[test]
fn test_pipeline_error_display() {
  let err = PipelineError::TaskFailed {
    component: ComponentInfo::new("hdfs-bolt", PipelineStage::Sink, 0),
    restarts: 3,
    reason: "flush failed".into(),
  };
  assert_eq!(
    err.to_string(),
    "task hdfs-bolt[0] failed permanently after 3 restarts: flush failed"
  );
  assert_eq!(err.class(), FailureClass::FatalTask);

  let err = PipelineError::from(ConfigError::UnsupportedStorage("s3://x".into()));
  assert_eq!(
    err.to_string(),
    "invalid configuration: unsupported storage url: s3://x"
  );
  assert!(matches!(
    PipelineError::from(OffsetError::Lock("poisoned".into())),
    PipelineError::Offset(_)
  ));
}

//! # Pipeline Definition Test Suite
//!
//! Builder wiring, task caps, and validation of the serializable topology
//! definition.

use crate::config::{DeployMode, RelayConfig, SinkConfig};
use crate::error::{PipelineError, PipelineStage};
use crate::events::MemoryReporter;
use crate::log_client::MemoryLog;
use crate::offset::InMemoryOffsetStore;
use crate::pipeline::{
  InputSpec, Pipeline, PipelineBuilder, SinkStage, SourceStage, TopologyDefinition, TransformStage,
};
use crate::routing::Grouping;
use crate::storage::MemoryStorage;
use crate::transform::UpperCaseTransform;
use std::sync::Arc;
use std::time::Duration;

fn reference_pipeline() -> Pipeline {
  PipelineBuilder::new("KafkaToStormToHDFSTopology")
    .source(
      SourceStage::new(
        "kafka-reader",
        Arc::new(MemoryLog::new()),
        Arc::new(InMemoryOffsetStore::new()),
      )
      .with_parallelism(5, 5),
    )
    .transform(
      TransformStage::new("to-upper", Arc::new(UpperCaseTransform::new())).with_parallelism(2, 4),
    )
    .sink(SinkStage::new("hdfs-bolt", Arc::new(MemoryStorage::new())).with_parallelism(2, 4))
}

fn invalid_reason(definition: &TopologyDefinition) -> String {
  match definition.validate() {
    Err(PipelineError::InvalidDefinition(reason)) => reason,
    other => panic!("expected InvalidDefinition, got {other:?}"),
  }
}

#[test]
fn test_definition_wires_stages() {
  let definition = reference_pipeline().with_workers(2).definition();
  definition.validate().unwrap();
  assert_eq!(definition.name, "KafkaToStormToHDFSTopology");
  assert_eq!(definition.workers, 2);

  let ids: Vec<&str> = definition.components.iter().map(|c| c.id.as_str()).collect();
  assert_eq!(ids, ["kafka-reader", "to-upper", "hdfs-bolt"]);

  let transform = &definition.components[1];
  assert_eq!((transform.parallelism, transform.tasks), (2, 4));
  assert_eq!(
    transform.input,
    Some(InputSpec {
      from: "kafka-reader".to_string(),
      grouping: Grouping::Shuffle,
      fields: Vec::new(),
    })
  );
  let sink = &definition.components[2];
  let input = sink.input.as_ref().unwrap();
  assert_eq!(input.grouping, Grouping::Fields);
  assert_eq!(input.fields, vec!["line".to_string()]);
  assert_eq!(sink.config["sync_every"], 1000);
}

#[test]
fn test_definition_json_shape() {
  let definition = reference_pipeline().definition();
  let json = serde_json::to_value(&definition).unwrap();
  assert_eq!(json["message_timeout"], 30_000);
  assert_eq!(json["components"][0]["stage"], "source");
  assert!(json["components"][1]["input"].get("fields").is_none());

  let parsed: TopologyDefinition = serde_json::from_value(json).unwrap();
  assert_eq!(parsed, definition);
}

#[test]
fn test_effective_tasks_respects_cap() {
  let pipeline = reference_pipeline();
  assert_eq!(pipeline.effective_tasks(PipelineStage::Source), 5);

  let capped = pipeline.with_max_task_parallelism(3);
  assert_eq!(capped.effective_tasks(PipelineStage::Source), 3);
  assert_eq!(capped.effective_tasks(PipelineStage::Transform), 3);
  assert_eq!(capped.effective_tasks(PipelineStage::Sink), 3);
  assert_eq!(capped.definition().max_task_parallelism, Some(3));
}

#[test]
fn test_validate_rejects_broken_definitions() {
  let valid = reference_pipeline().definition();

  let mut definition = valid.clone();
  definition.name = "  ".to_string();
  assert!(invalid_reason(&definition).contains("name"));

  let mut definition = valid.clone();
  definition.workers = 0;
  assert!(invalid_reason(&definition).contains("workers"));

  let mut definition = valid.clone();
  definition.components[2].id = "to-upper".to_string();
  assert!(invalid_reason(&definition).contains("duplicate"));

  let mut definition = valid.clone();
  definition.components[1].tasks = 0;
  assert!(invalid_reason(&definition).contains("no tasks"));

  let mut definition = valid.clone();
  definition.components[2].input.as_mut().unwrap().from = "nowhere".to_string();
  assert!(invalid_reason(&definition).contains("unknown component"));

  let mut definition = valid.clone();
  definition.components[2].input.as_mut().unwrap().fields.clear();
  assert!(invalid_reason(&definition).contains("no fields"));

  let mut definition = valid.clone();
  definition.components.remove(0);
  definition.components[0].input = None;
  assert!(invalid_reason(&definition).contains("no input"));

  let mut definition = valid.clone();
  definition.max_task_parallelism = Some(0);
  assert!(invalid_reason(&definition).contains("parallelism"));

  let mut definition = valid;
  assert_eq!(definition.components[2].config["sync_interval"], 10_000);
  definition.message_timeout = Duration::from_secs(10);
  assert!(invalid_reason(&definition).contains("sync interval"));
}

#[test]
fn test_build_from_config() {
  let config = RelayConfig::default()
    .with_sink(SinkConfig {
      fs_url: "memory://".to_string(),
      ..SinkConfig::default()
    })
    .with_deploy(DeployMode::Local {
      run_for: Duration::from_secs(1),
      max_task_parallelism: 3,
    });
  let pipeline = config
    .build_pipeline(
      Arc::new(MemoryLog::new()),
      Arc::new(MemoryStorage::new()),
      Arc::new(MemoryReporter::new()),
    )
    .unwrap();
  assert_eq!(pipeline.name(), "KafkaToStormToHDFSTopology");
  assert_eq!(pipeline.effective_tasks(PipelineStage::Source), 3);

  let definition = pipeline.definition();
  assert_eq!(definition.components[0].config["stream"], "basis_common");
  assert_eq!(definition.components[0].config["start_from_beginning"], true);
  assert_eq!(definition.components[2].config["fs_url"], "memory://");
  assert_eq!(definition.components[2].config["path"], "/data/storm/");
}

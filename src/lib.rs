//! # StreamWeave Relay
//!
//! At-least-once relay from a partitioned log into rotating files.
//!
//! A relay is a three-stage pipeline:
//!
//! - **Source reader**: reads partitions of a stream, tracks every emitted
//!   record in a bounded in-flight window, replays failures with backoff and
//!   commits the highest contiguous acknowledged offset per partition.
//! - **Transform**: stateless; the built-in [`UpperCaseTransform`] trims and
//!   upper-cases each line into `(line, len)`.
//! - **Rotating sink**: appends delimited records to segment files, flushes
//!   by count, rotates by time or size, and acknowledges records only once
//!   they are durable.
//!
//! Records flow reader → transform with a shuffle grouping and
//! transform → sink with a fields grouping on the line, so identical lines
//! always land on the same sink instance.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamweave_relay::log_client::MemoryLog;
//! use streamweave_relay::offset::InMemoryOffsetStore;
//! use streamweave_relay::pipeline::{PipelineBuilder, SinkStage, SourceStage, TransformStage};
//! use streamweave_relay::record::PartitionId;
//! use streamweave_relay::storage::MemoryStorage;
//! use streamweave_relay::transform::UpperCaseTransform;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let log = Arc::new(MemoryLog::new());
//! log.create_stream("basis_common", 1);
//! log.append("basis_common", PartitionId(0), "hello");
//!
//! let pipeline = PipelineBuilder::new("relay")
//!   .source(SourceStage::new("kafka-reader", log, Arc::new(InMemoryOffsetStore::new())))
//!   .transform(TransformStage::new("to-upper", Arc::new(UpperCaseTransform::new())))
//!   .sink(SinkStage::new("hdfs-bolt", Arc::new(MemoryStorage::new())).with_sync_every(1));
//!
//! let cancel = CancellationToken::new();
//! let report = pipeline.run(cancel).await?;
//! println!("acked {} records", report.records_acked);
//! # Ok(())
//! # }
//! ```
//!
//! [`UpperCaseTransform`]: transform::UpperCaseTransform

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Exponential retry delays.
pub mod backoff;
/// Operator configuration loaded from JSON.
pub mod config;
/// Local runs and cluster submission.
pub mod deploy;
/// Failure taxonomy and pipeline errors.
pub mod error;
/// Operational events and reporters.
pub mod events;
/// Partitioned log abstraction and an in-memory log.
pub mod log_client;
/// Committed offsets: stores, trackers and commit strategies.
pub mod offset;
/// Pipeline builder and topology definition.
pub mod pipeline;
/// Record identity and payload types.
pub mod record;
/// Stable-hash routing between stages.
pub mod routing;
/// In-process execution of a pipeline.
pub mod runtime;
/// Rotating file sink.
pub mod sink;
/// Source reader with in-flight window and replay.
pub mod source;
/// Durable segment storage.
pub mod storage;
/// Restart policies for failed tasks.
pub mod supervision;
/// Stateless record transforms.
pub mod transform;

#[cfg(test)]
mod error_test;
#[cfg(test)]
mod pipeline_test;
#[cfg(test)]
mod routing_test;
#[cfg(test)]
mod storage_test;
#[cfg(test)]
mod transform_test;

//! # Transform Stage
//!
//! Stateless per-record transformation between the source reader and the
//! sink.
//!
//! A [`Transform`] receives a source [`Record`] and returns at most one
//! [`LineRecord`]. It must not keep state between calls: the reader may
//! redeliver a record after a downstream failure, and the replayed output has
//! to be byte-identical for duplicates to be harmless.
//!
//! Rejected payloads come back as [`TransformError`], which is always a
//! data-quality failure: the coordinator acknowledges the origin record,
//! reports it, and does not forward anything to the sink.

use crate::error::{Classify, FailureClass};
use crate::record::{LineRecord, Record};
use crate::routing::RoutingKey;
use std::fmt::Debug;
use thiserror::Error;

/// Why a payload was rejected by the transform stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
  /// The payload is empty after trimming.
  #[error("empty payload")]
  EmptyPayload,
  /// The payload could not be decoded.
  #[error("malformed payload: {0}")]
  Malformed(String),
}

impl Classify for TransformError {
  fn class(&self) -> FailureClass {
    FailureClass::DataQuality
  }
}

/// A pure, stateless record transformation.
pub trait Transform: Send + Sync + Debug {
  /// Transforms one record. `Ok(None)` filters the record out.
  fn transform(&self, record: &Record) -> Result<Option<LineRecord>, TransformError>;

  /// Routing key of a transformed record.
  fn routing_key(&self, output: &LineRecord) -> RoutingKey {
    RoutingKey::new(output.line.clone())
  }
}

/// Trims each line and upper-cases it, emitting `(line, len)`.
///
/// The routing key is the upper-cased line, so identical lines are written by
/// the same sink instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpperCaseTransform;

impl UpperCaseTransform {
  /// Creates the transform.
  pub fn new() -> Self {
    Self
  }
}

impl Transform for UpperCaseTransform {
  fn transform(&self, record: &Record) -> Result<Option<LineRecord>, TransformError> {
    let text = std::str::from_utf8(&record.payload)
      .map_err(|e| TransformError::Malformed(e.to_string()))?;
    let line = text.trim();
    if line.is_empty() {
      return Err(TransformError::EmptyPayload);
    }
    let line = line.to_uppercase();
    let len = line.chars().count();
    Ok(Some(LineRecord {
      origin: record.reference(),
      line,
      len,
    }))
  }
}

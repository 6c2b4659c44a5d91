//! Output formatting: how a record becomes bytes and how segments are named.

use crate::record::LineRecord;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;

/// Turns a transformed record into the bytes appended to a segment.
pub trait RecordFormat: Send + Sync + Debug {
  /// Formats one record, including its terminator.
  fn format(&self, record: &LineRecord) -> Vec<u8>;
}

/// Joins the record's fields with a field delimiter and terminates it with a
/// record delimiter.
///
/// With the defaults used by the relay (`\t`, `\n`) the line
/// `"HELLO WORLD"` of length 11 is written as `HELLO WORLD\t11\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimitedRecordFormat {
  field_delimiter: String,
  record_delimiter: String,
}

impl Default for DelimitedRecordFormat {
  fn default() -> Self {
    Self {
      field_delimiter: ",".to_string(),
      record_delimiter: "\n".to_string(),
    }
  }
}

impl DelimitedRecordFormat {
  /// Creates a format with `,` between fields and `\n` after each record.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the field delimiter.
  #[must_use]
  pub fn with_field_delimiter(mut self, delimiter: impl Into<String>) -> Self {
    self.field_delimiter = delimiter.into();
    self
  }

  /// Sets the record delimiter.
  #[must_use]
  pub fn with_record_delimiter(mut self, delimiter: impl Into<String>) -> Self {
    self.record_delimiter = delimiter.into();
    self
  }

  /// Field delimiter in use.
  pub fn field_delimiter(&self) -> &str {
    &self.field_delimiter
  }
}

impl RecordFormat for DelimitedRecordFormat {
  fn format(&self, record: &LineRecord) -> Vec<u8> {
    let mut out = record.fields().join(&self.field_delimiter);
    out.push_str(&self.record_delimiter);
    out.into_bytes()
  }
}

/// Names output segments as
/// `{path}/{prefix}{component}-{task}-{rotation}-{timestamp_ms}{extension}`.
///
/// The task index and the rotation counter make names unique within one
/// sink instance; the sink additionally bumps the rotation counter when the
/// store reports that a name is already taken, so a restarted task never
/// reuses a previous segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultFileNameFormat {
  path: PathBuf,
  prefix: String,
  extension: String,
}

impl Default for DefaultFileNameFormat {
  fn default() -> Self {
    Self {
      path: PathBuf::from("/storm"),
      prefix: String::new(),
      extension: ".txt".to_string(),
    }
  }
}

impl DefaultFileNameFormat {
  /// Creates the default format (`/storm`, no prefix, `.txt`).
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the output directory.
  #[must_use]
  pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.path = path.into();
    self
  }

  /// Sets the file name prefix.
  #[must_use]
  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  /// Sets the file extension, including the leading dot.
  #[must_use]
  pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
    self.extension = extension.into();
    self
  }

  /// Output directory.
  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  /// File name for a segment.
  pub fn name(&self, component: &str, task: usize, rotation: u64, timestamp_ms: i64) -> String {
    format!(
      "{}{}-{}-{}-{}{}",
      self.prefix, component, task, rotation, timestamp_ms, self.extension
    )
  }

  /// Full path for a segment.
  pub fn segment_path(
    &self,
    component: &str,
    task: usize,
    rotation: u64,
    timestamp_ms: i64,
  ) -> PathBuf {
    self.path.join(self.name(component, task, rotation, timestamp_ms))
  }
}

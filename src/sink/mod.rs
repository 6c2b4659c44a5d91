//! # Rotating Sink
//!
//! Writes transformed records to a durable store in batched, rotated,
//! delimited segments, and acknowledges a record only after the flush that
//! persisted it succeeded.
//!
//! - [`format`]: record and segment-name formats.
//! - [`policy`]: when to flush ([`SyncPolicy`]) and when to rotate
//!   ([`RotationPolicy`]).
//! - [`rotating`]: the [`RotatingSink`] itself.

pub mod format;
pub mod policy;
pub mod rotating;

#[cfg(test)]
mod rotating_test;

pub use format::{DefaultFileNameFormat, DelimitedRecordFormat, RecordFormat};
pub use policy::{CountSyncPolicy, RotationPolicy, SyncPolicy};
pub use rotating::{RotatingSink, SinkError, SinkSettings, SinkStats};

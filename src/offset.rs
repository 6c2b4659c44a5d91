//! Offset tracking for resumable consumption.
//!
//! This module provides the committed-offset store shared by all source
//! readers, the per-partition [`CommitTracker`] that turns out-of-order
//! acknowledgments into an in-order committed offset, and the
//! [`OffsetTracker`] that applies a [`CommitStrategy`] on top of a store.
//!
//! A committed offset is the highest offset of a partition known to be fully
//! processed. It never decreases: stores reject regressions with
//! [`OffsetError::Regression`]. After a restart a reader resumes at
//! `committed + 1`.

use crate::record::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Key under which a partition's committed offset is stored.
///
/// Rendered as `{root}/{group}/{stream}/{partition}`, e.g.
/// `/storm/word/basis_common/3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffsetKey {
  /// Root namespace shared by all pipelines using the store.
  pub root: String,
  /// Consumer group identifier.
  pub group: String,
  /// Stream (topic) name.
  pub stream: String,
  /// Partition within the stream.
  pub partition: PartitionId,
}

impl OffsetKey {
  /// Creates an offset key.
  pub fn new(
    root: impl Into<String>,
    group: impl Into<String>,
    stream: impl Into<String>,
    partition: PartitionId,
  ) -> Self {
    Self {
      root: root.into(),
      group: group.into(),
      stream: stream.into(),
      partition,
    }
  }
}

impl Display for OffsetKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}/{}/{}",
      self.root.trim_end_matches('/'),
      self.group,
      self.stream,
      self.partition.get()
    )
  }
}

/// Where to start reading a partition that has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OffsetResetPolicy {
  /// Start from the earliest available offset.
  #[default]
  Earliest,
  /// Start from the latest available offset.
  Latest,
  /// Fail if no offset is found.
  None,
}

/// Strategy for persisting committed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitStrategy {
  /// Persist every time the committed offset advances.
  #[default]
  Auto,
  /// Persist after this many advances.
  Periodic(usize),
  /// Only persist when explicitly requested.
  Manual,
}

/// Error type for offset operations.
#[derive(Error, Debug)]
pub enum OffsetError {
  /// IO error during persistence.
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  /// Serialization/deserialization error.
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// No committed offset and the reset policy forbids guessing.
  #[error("No committed offset for {0}")]
  NotFound(String),
  /// Lock acquisition failed.
  #[error("Lock error: {0}")]
  Lock(String),
  /// A commit tried to move an offset backwards.
  #[error("Offset regression for {key}: committed {committed}, attempted {attempted}")]
  Regression {
    /// Offending key.
    key: String,
    /// Offset currently stored.
    committed: u64,
    /// Offset the caller tried to store.
    attempted: u64,
  },
}

impl crate::error::Classify for OffsetError {
  fn class(&self) -> crate::error::FailureClass {
    match self {
      OffsetError::Io(_) => crate::error::FailureClass::Transient,
      _ => crate::error::FailureClass::FatalTask,
    }
  }
}

/// Result type for offset operations.
pub type OffsetResult<T> = Result<T, OffsetError>;

/// Storage backend for committed offsets.
///
/// `commit` is a per-key compare-and-set: it succeeds when the new offset is
/// greater than or equal to the stored one and fails with
/// [`OffsetError::Regression`] otherwise.
pub trait OffsetStore: Send + Sync + fmt::Debug {
  /// Get the committed offset for a key.
  fn get(&self, key: &OffsetKey) -> OffsetResult<Option<u64>>;

  /// Commit an offset for a key.
  fn commit(&self, key: &OffsetKey, offset: u64) -> OffsetResult<()>;

  /// Get all committed offsets, keyed by their rendered path.
  fn get_all(&self) -> OffsetResult<HashMap<String, u64>>;

  /// Clear the offset for a key.
  fn clear(&self, key: &OffsetKey) -> OffsetResult<()>;
}

fn check_monotonic(
  offsets: &HashMap<String, u64>,
  key: &str,
  offset: u64,
) -> OffsetResult<()> {
  match offsets.get(key) {
    Some(&committed) if offset < committed => Err(OffsetError::Regression {
      key: key.to_string(),
      committed,
      attempted: offset,
    }),
    _ => Ok(()),
  }
}

/// In-memory offset store.
///
/// Clones share state, so a "restarted" reader in tests sees the offsets
/// committed by its predecessor.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOffsetStore {
  offsets: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemoryOffsetStore {
  /// Creates a new in-memory offset store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates an in-memory offset store with initial offsets.
  pub fn with_offsets(offsets: impl IntoIterator<Item = (OffsetKey, u64)>) -> Self {
    let offsets = offsets
      .into_iter()
      .map(|(key, offset)| (key.to_string(), offset))
      .collect();
    Self {
      offsets: Arc::new(RwLock::new(offsets)),
    }
  }
}

impl OffsetStore for InMemoryOffsetStore {
  fn get(&self, key: &OffsetKey) -> OffsetResult<Option<u64>> {
    let offsets = self
      .offsets
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(offsets.get(&key.to_string()).copied())
  }

  fn commit(&self, key: &OffsetKey, offset: u64) -> OffsetResult<()> {
    let mut offsets = self
      .offsets
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    let key = key.to_string();
    check_monotonic(&offsets, &key, offset)?;
    offsets.insert(key, offset);
    Ok(())
  }

  fn get_all(&self) -> OffsetResult<HashMap<String, u64>> {
    let offsets = self
      .offsets
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(offsets.clone())
  }

  fn clear(&self, key: &OffsetKey) -> OffsetResult<()> {
    let mut offsets = self
      .offsets
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    offsets.remove(&key.to_string());
    Ok(())
  }
}

/// File-based offset store.
///
/// Persists offsets to a JSON file on disk. Writes go to a sibling temporary
/// file that is renamed into place, so a crash mid-write leaves the
/// previous offsets intact.
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
  path: PathBuf,
  cache: Arc<RwLock<HashMap<String, u64>>>,
}

impl FileOffsetStore {
  /// Opens (or creates on first commit) a file-based offset store.
  pub fn new<P: AsRef<Path>>(path: P) -> OffsetResult<Self> {
    let path = path.as_ref().to_path_buf();

    let cache = if path.exists() {
      let data = fs::read_to_string(&path)?;
      if data.trim().is_empty() {
        HashMap::new()
      } else {
        serde_json::from_str(&data).map_err(|e| OffsetError::Serialization(e.to_string()))?
      }
    } else {
      HashMap::new()
    };

    Ok(Self {
      path,
      cache: Arc::new(RwLock::new(cache)),
    })
  }

  fn persist(&self, offsets: &HashMap<String, u64>) -> OffsetResult<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string_pretty(offsets)
      .map_err(|e| OffsetError::Serialization(e.to_string()))?;
    let tmp = self.path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &self.path)?;
    Ok(())
  }

  /// Returns the path to the offset file.
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl OffsetStore for FileOffsetStore {
  fn get(&self, key: &OffsetKey) -> OffsetResult<Option<u64>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(cache.get(&key.to_string()).copied())
  }

  fn commit(&self, key: &OffsetKey, offset: u64) -> OffsetResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    let key = key.to_string();
    check_monotonic(&cache, &key, offset)?;
    if cache.get(&key) == Some(&offset) {
      return Ok(());
    }
    cache.insert(key, offset);
    self.persist(&cache)?;
    Ok(())
  }

  fn get_all(&self) -> OffsetResult<HashMap<String, u64>> {
    let cache = self
      .cache
      .read()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    Ok(cache.clone())
  }

  fn clear(&self, key: &OffsetKey) -> OffsetResult<()> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| OffsetError::Lock(e.to_string()))?;
    cache.remove(&key.to_string());
    self.persist(&cache)?;
    Ok(())
  }
}

/// Turns out-of-order completions into an in-order committed offset.
///
/// Offsets are registered with [`emitted`](Self::emitted) when they enter the
/// pipeline and removed with [`complete`](Self::complete) when acknowledged
/// (or permanently skipped). The committable offset is one below the smallest
/// still-pending offset, or the highest emitted offset when nothing is
/// pending. Gaps in the log are therefore harmless.
#[derive(Debug, Clone, Default)]
pub struct CommitTracker {
  pending: BTreeSet<u64>,
  highest_emitted: Option<u64>,
  committed: Option<u64>,
}

impl CommitTracker {
  /// Creates a tracker resuming from a committed offset.
  pub fn new(committed: Option<u64>) -> Self {
    Self {
      pending: BTreeSet::new(),
      highest_emitted: committed,
      committed,
    }
  }

  /// Registers an offset that has been handed to the pipeline.
  pub fn emitted(&mut self, offset: u64) {
    if self.committed.is_some_and(|c| offset <= c) {
      return;
    }
    self.pending.insert(offset);
    self.highest_emitted = Some(self.highest_emitted.map_or(offset, |h| h.max(offset)));
  }

  /// Marks an offset as fully processed.
  ///
  /// Returns the new committed offset if it advanced.
  pub fn complete(&mut self, offset: u64) -> Option<u64> {
    if !self.pending.remove(&offset) {
      return None;
    }
    let candidate = match self.pending.first() {
      Some(&lowest) => lowest.checked_sub(1),
      None => self.highest_emitted,
    };
    match (candidate, self.committed) {
      (Some(next), Some(current)) if next > current => {
        self.committed = Some(next);
        self.committed
      }
      (Some(next), None) => {
        self.committed = Some(next);
        self.committed
      }
      _ => None,
    }
  }

  /// Returns true if the offset has been emitted and not yet completed.
  pub fn is_pending(&self, offset: u64) -> bool {
    self.pending.contains(&offset)
  }

  /// Number of offsets emitted but not yet completed.
  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  /// Returns the current committed offset.
  pub fn committed(&self) -> Option<u64> {
    self.committed
  }
}

/// Applies a commit strategy on top of an offset store.
///
/// Readers call [`record`](Self::record) whenever a partition's committed
/// offset advances. Depending on the strategy the offset is persisted
/// immediately, every `n` advances, or only on an explicit commit.
#[derive(Debug)]
pub struct OffsetTracker {
  store: Arc<dyn OffsetStore>,
  strategy: CommitStrategy,
  reset_policy: OffsetResetPolicy,
  pending: HashMap<OffsetKey, (u64, usize)>,
}

impl OffsetTracker {
  /// Creates a new offset tracker with the given store and default settings.
  pub fn new(store: Arc<dyn OffsetStore>) -> Self {
    Self {
      store,
      strategy: CommitStrategy::default(),
      reset_policy: OffsetResetPolicy::default(),
      pending: HashMap::new(),
    }
  }

  /// Sets the commit strategy.
  #[must_use]
  pub fn with_strategy(mut self, strategy: CommitStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  /// Sets the offset reset policy.
  #[must_use]
  pub fn with_reset_policy(mut self, policy: OffsetResetPolicy) -> Self {
    self.reset_policy = policy;
    self
  }

  /// Gets the committed offset for a key.
  ///
  /// Returns `Ok(None)` when nothing is committed and the reset policy allows
  /// a fallback start position.
  pub fn committed(&self, key: &OffsetKey) -> OffsetResult<Option<u64>> {
    match self.store.get(key)? {
      Some(offset) => Ok(Some(offset)),
      None if self.reset_policy == OffsetResetPolicy::None => {
        Err(OffsetError::NotFound(key.to_string()))
      }
      None => Ok(None),
    }
  }

  /// Records that the committed offset of a partition advanced.
  ///
  /// Returns true if the offset was persisted by this call.
  pub fn record(&mut self, key: &OffsetKey, offset: u64) -> OffsetResult<bool> {
    match self.strategy {
      CommitStrategy::Auto => {
        self.store.commit(key, offset)?;
        Ok(true)
      }
      CommitStrategy::Periodic(interval) => {
        let entry = self.pending.entry(key.clone()).or_insert((offset, 0));
        entry.0 = offset;
        entry.1 += 1;
        if entry.1 >= interval.max(1) {
          entry.1 = 0;
          let to_commit = entry.0;
          self.pending.remove(key);
          self.store.commit(key, to_commit)?;
          Ok(true)
        } else {
          Ok(false)
        }
      }
      CommitStrategy::Manual => {
        let entry = self.pending.entry(key.clone()).or_insert((offset, 0));
        entry.0 = offset;
        entry.1 += 1;
        Ok(false)
      }
    }
  }

  /// Persists every offset recorded but not yet committed.
  ///
  /// Returns the keys and offsets that were written.
  pub fn commit_pending(&mut self) -> OffsetResult<Vec<(OffsetKey, u64)>> {
    let mut committed = Vec::with_capacity(self.pending.len());
    let mut keys: Vec<OffsetKey> = self.pending.keys().cloned().collect();
    keys.sort();
    for key in keys {
      if let Some((offset, _)) = self.pending.get(&key).copied() {
        self.store.commit(&key, offset)?;
        self.pending.remove(&key);
        committed.push((key, offset));
      }
    }
    Ok(committed)
  }

  /// Returns the current commit strategy.
  pub fn strategy(&self) -> CommitStrategy {
    self.strategy
  }

  /// Returns the current reset policy.
  pub fn reset_policy(&self) -> OffsetResetPolicy {
    self.reset_policy
  }

  /// Returns offsets recorded but not yet persisted.
  pub fn pending(&self) -> HashMap<OffsetKey, u64> {
    self
      .pending
      .iter()
      .map(|(k, (o, _))| (k.clone(), *o))
      .collect()
  }
}

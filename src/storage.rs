//! # Durable Storage
//!
//! Handle-based client for the sink's output store (HDFS in production
//! clusters).
//!
//! Data passed to [`DurableStorage::append`] may sit in client buffers until
//! [`DurableStorage::flush`] returns `Ok`; only then is it durable. The sink
//! relies on that contract to acknowledge records no earlier than the flush
//! that persisted them.
//!
//! Two implementations are provided:
//!
//! - [`LocalFsStorage`]: `tokio::fs` files, `sync_data` on every flush,
//!   optionally confined under a root directory.
//! - [`MemoryStorage`]: in-memory files that separate buffered from durable
//!   bytes, with fault injection and call counters for tests.

use crate::error::{Classify, FailureClass};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Opaque handle to an open segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(u64);

impl fmt::Display for SegmentHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "segment#{}", self.0)
  }
}

/// Errors reported by durable storage.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
  /// The store cannot be reached right now.
  #[error("storage unavailable: {0}")]
  Unavailable(String),
  /// A file already exists at the path passed to `open`.
  #[error("segment already exists: {0}")]
  AlreadyExists(PathBuf),
  /// The handle does not refer to an open segment.
  #[error("unknown or closed handle: {0}")]
  InvalidHandle(SegmentHandle),
  /// Any other I/O failure.
  #[error("storage I/O error: {0}")]
  Io(String),
}

impl From<io::Error> for StorageError {
  fn from(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(PathBuf::new()),
      _ => StorageError::Io(err.to_string()),
    }
  }
}

impl Classify for StorageError {
  fn class(&self) -> FailureClass {
    match self {
      StorageError::Unavailable(_) | StorageError::Io(_) => FailureClass::Transient,
      StorageError::AlreadyExists(_) | StorageError::InvalidHandle(_) => FailureClass::FatalTask,
    }
  }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Client for an append-only durable store.
#[async_trait]
pub trait DurableStorage: Send + Sync + Debug {
  /// Creates a new file at `path` and opens it for append.
  ///
  /// Fails with [`StorageError::AlreadyExists`] if the path is taken; a
  /// segment is never reopened.
  async fn open(&self, path: &Path) -> StorageResult<SegmentHandle>;

  /// Appends bytes to an open segment.
  async fn append(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()>;

  /// Makes every byte appended so far durable.
  async fn flush(&self, handle: SegmentHandle) -> StorageResult<()>;

  /// Flushes and closes a segment. The handle is invalid afterwards.
  async fn close(&self, handle: SegmentHandle) -> StorageResult<()>;

  /// Releases a segment without flushing it, after a failure the caller
  /// has given up on. Bytes appended since the last flush may be lost.
  /// Unknown handles are ignored.
  async fn abandon(&self, handle: SegmentHandle);
}

type SharedWriter = Arc<tokio::sync::Mutex<BufWriter<File>>>;

/// Local filesystem storage.
///
/// Without a root, segment paths are used as given. With a root, absolute
/// segment paths are re-anchored below it, so `/data/storm/a.log` with root
/// `/tmp/out` is written to `/tmp/out/data/storm/a.log`.
///
/// Each segment has its own writer lock; the handle table is only locked to
/// look a writer up, so sinks writing different segments never wait on each
/// other's I/O.
#[derive(Debug, Default)]
pub struct LocalFsStorage {
  root: Option<PathBuf>,
  next_id: AtomicU64,
  open: tokio::sync::Mutex<HashMap<SegmentHandle, SharedWriter>>,
}

impl LocalFsStorage {
  /// Creates a local filesystem store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a store confined under `root`.
  pub fn with_root(root: impl Into<PathBuf>) -> Self {
    Self {
      root: Some(root.into()),
      ..Self::default()
    }
  }

  /// Where a segment path lands on disk.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    match &self.root {
      Some(root) => {
        let relative: PathBuf = path
          .components()
          .filter(|c| matches!(c, std::path::Component::Normal(_)))
          .collect();
        root.join(relative)
      }
      None => path.to_path_buf(),
    }
  }

  /// Number of segments currently open.
  pub async fn open_segments(&self) -> usize {
    self.open.lock().await.len()
  }

  async fn writer(&self, handle: SegmentHandle) -> StorageResult<SharedWriter> {
    self
      .open
      .lock()
      .await
      .get(&handle)
      .cloned()
      .ok_or(StorageError::InvalidHandle(handle))
  }
}

#[async_trait]
impl DurableStorage for LocalFsStorage {
  async fn open(&self, path: &Path) -> StorageResult<SegmentHandle> {
    let path = self.resolve(path);
    let path = path.as_path();
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(path)
      .await
      .map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_path_buf()),
        _ => StorageError::from(e),
      })?;
    let handle = SegmentHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
    let writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(file)));
    self.open.lock().await.insert(handle, writer);
    Ok(handle)
  }

  async fn append(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()> {
    let writer = self.writer(handle).await?;
    writer.lock().await.write_all(bytes).await?;
    Ok(())
  }

  async fn flush(&self, handle: SegmentHandle) -> StorageResult<()> {
    let writer = self.writer(handle).await?;
    let mut writer = writer.lock().await;
    writer.flush().await?;
    writer.get_ref().sync_data().await?;
    Ok(())
  }

  async fn close(&self, handle: SegmentHandle) -> StorageResult<()> {
    let writer = self.writer(handle).await?;
    {
      let mut writer = writer.lock().await;
      writer.flush().await?;
      writer.get_ref().sync_all().await?;
    }
    self.open.lock().await.remove(&handle);
    writer.lock().await.shutdown().await?;
    Ok(())
  }

  async fn abandon(&self, handle: SegmentHandle) {
    if self.open.lock().await.remove(&handle).is_some() {
      debug!(handle = %handle, "Abandoned segment");
    }
  }
}

/// Contents of an in-memory segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFile {
  /// Bytes made durable by a successful flush.
  pub durable: Vec<u8>,
  /// Bytes appended but not yet flushed.
  pub buffered: Vec<u8>,
  /// Whether the segment has been closed.
  pub closed: bool,
}

impl MemoryFile {
  /// Durable contents as UTF-8 text (lossy).
  pub fn durable_text(&self) -> String {
    String::from_utf8_lossy(&self.durable).into_owned()
  }
}

#[derive(Debug, Default)]
struct MemoryStorageState {
  files: HashMap<PathBuf, MemoryFile>,
  handles: HashMap<SegmentHandle, PathBuf>,
  next_id: u64,
  fail_flushes: u32,
  fail_appends: u32,
  flush_calls: u64,
  successful_flushes: u64,
  append_after_close: u64,
}

/// In-memory durable storage with fault injection.
///
/// Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
  state: Arc<Mutex<MemoryStorageState>>,
}

impl MemoryStorage {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes the next `count` flush calls fail with `Unavailable`.
  pub fn fail_next_flushes(&self, count: u32) {
    if let Ok(mut state) = self.state.lock() {
      state.fail_flushes = count;
    }
  }

  /// Makes the next `count` append calls fail with `Unavailable`.
  pub fn fail_next_appends(&self, count: u32) {
    if let Ok(mut state) = self.state.lock() {
      state.fail_appends = count;
    }
  }

  /// Number of flush calls, failed ones included.
  pub fn flush_calls(&self) -> u64 {
    self.state.lock().map(|s| s.flush_calls).unwrap_or(0)
  }

  /// Number of flush calls that succeeded.
  pub fn successful_flushes(&self) -> u64 {
    self.state.lock().map(|s| s.successful_flushes).unwrap_or(0)
  }

  /// Number of segments currently open.
  pub fn open_segments(&self) -> usize {
    self.state.lock().map(|s| s.handles.len()).unwrap_or(0)
  }

  /// Appends attempted against closed segments (always rejected).
  pub fn appends_after_close(&self) -> u64 {
    self.state.lock().map(|s| s.append_after_close).unwrap_or(0)
  }

  /// Snapshot of a file.
  pub fn file(&self, path: &Path) -> Option<MemoryFile> {
    self
      .state
      .lock()
      .ok()
      .and_then(|s| s.files.get(path).cloned())
  }

  /// Snapshot of every file, sorted by path.
  pub fn files(&self) -> Vec<(PathBuf, MemoryFile)> {
    let mut files: Vec<_> = self
      .state
      .lock()
      .map(|s| s.files.iter().map(|(p, f)| (p.clone(), f.clone())).collect())
      .unwrap_or_default();
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
  }

  /// Every durable line across all files.
  pub fn durable_lines(&self) -> Vec<String> {
    self
      .files()
      .into_iter()
      .flat_map(|(_, f)| {
        f.durable_text()
          .lines()
          .map(str::to_string)
          .collect::<Vec<_>>()
      })
      .collect()
  }

  fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, MemoryStorageState>> {
    self
      .state
      .lock()
      .map_err(|e| StorageError::Io(e.to_string()))
  }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
  async fn open(&self, path: &Path) -> StorageResult<SegmentHandle> {
    let mut state = self.lock()?;
    if state.files.contains_key(path) {
      return Err(StorageError::AlreadyExists(path.to_path_buf()));
    }
    state.files.insert(path.to_path_buf(), MemoryFile::default());
    let handle = SegmentHandle(state.next_id);
    state.next_id += 1;
    state.handles.insert(handle, path.to_path_buf());
    Ok(handle)
  }

  async fn append(&self, handle: SegmentHandle, bytes: &[u8]) -> StorageResult<()> {
    let mut state = self.lock()?;
    if state.fail_appends > 0 {
      state.fail_appends -= 1;
      return Err(StorageError::Unavailable("injected append failure".to_string()));
    }
    let Some(path) = state.handles.get(&handle).cloned() else {
      state.append_after_close += 1;
      return Err(StorageError::InvalidHandle(handle));
    };
    let file = state
      .files
      .get_mut(&path)
      .ok_or(StorageError::InvalidHandle(handle))?;
    file.buffered.extend_from_slice(bytes);
    Ok(())
  }

  async fn flush(&self, handle: SegmentHandle) -> StorageResult<()> {
    let mut state = self.lock()?;
    state.flush_calls += 1;
    if state.fail_flushes > 0 {
      state.fail_flushes -= 1;
      return Err(StorageError::Unavailable("injected flush failure".to_string()));
    }
    let path = state
      .handles
      .get(&handle)
      .cloned()
      .ok_or(StorageError::InvalidHandle(handle))?;
    let file = state
      .files
      .get_mut(&path)
      .ok_or(StorageError::InvalidHandle(handle))?;
    let buffered = std::mem::take(&mut file.buffered);
    file.durable.extend_from_slice(&buffered);
    state.successful_flushes += 1;
    Ok(())
  }

  async fn close(&self, handle: SegmentHandle) -> StorageResult<()> {
    let mut state = self.lock()?;
    let path = state
      .handles
      .remove(&handle)
      .ok_or(StorageError::InvalidHandle(handle))?;
    if let Some(file) = state.files.get_mut(&path) {
      let buffered = std::mem::take(&mut file.buffered);
      file.durable.extend_from_slice(&buffered);
      file.closed = true;
    }
    Ok(())
  }

  async fn abandon(&self, handle: SegmentHandle) {
    let Ok(mut state) = self.state.lock() else {
      return;
    };
    let Some(path) = state.handles.remove(&handle) else {
      return;
    };
    if let Some(file) = state.files.get_mut(&path) {
      file.buffered.clear();
      file.closed = true;
    }
  }
}

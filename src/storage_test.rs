//! # Storage Test Suite
//!
//! Durability contract of both storage backends: appended bytes are durable
//! only after `flush`, segments are create-only, and closed handles are
//! rejected.

use crate::error::{Classify, FailureClass};
use crate::storage::{DurableStorage, LocalFsStorage, MemoryStorage, StorageError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// LocalFsStorage
// ============================================================================

#[tokio::test]
async fn test_local_append_flush_close() {
  let dir = TempDir::new().unwrap();
  let storage = LocalFsStorage::new();
  let path = dir.path().join("nested").join("app_0.log");

  let handle = storage.open(&path).await.unwrap();
  storage.append(handle, b"HELLO\t5\n").await.unwrap();
  storage.flush(handle).await.unwrap();
  assert_eq!(std::fs::read_to_string(&path).unwrap(), "HELLO\t5\n");

  storage.append(handle, b"WORLD\t5\n").await.unwrap();
  storage.close(handle).await.unwrap();
  assert_eq!(
    std::fs::read_to_string(&path).unwrap(),
    "HELLO\t5\nWORLD\t5\n"
  );
  assert!(matches!(
    storage.append(handle, b"late").await,
    Err(StorageError::InvalidHandle(_))
  ));
}

#[tokio::test]
async fn test_local_never_reopens_a_segment() {
  let dir = TempDir::new().unwrap();
  let storage = LocalFsStorage::new();
  let path = dir.path().join("seg.log");
  let handle = storage.open(&path).await.unwrap();
  storage.close(handle).await.unwrap();

  match storage.open(&path).await {
    Err(StorageError::AlreadyExists(existing)) => assert_eq!(existing, path),
    other => panic!("expected AlreadyExists, got {other:?}"),
  }
}

#[tokio::test]
async fn test_local_root_confines_absolute_paths() {
  let dir = TempDir::new().unwrap();
  let storage = LocalFsStorage::with_root(dir.path());
  let resolved = storage.resolve(Path::new("/data/storm/../app_1.log"));
  assert_eq!(resolved, dir.path().join("data").join("storm").join("app_1.log"));

  let handle = storage.open(Path::new("/data/storm/app_2.log")).await.unwrap();
  storage.append(handle, b"X\t1\n").await.unwrap();
  storage.close(handle).await.unwrap();
  let on_disk = dir.path().join("data/storm/app_2.log");
  assert_eq!(std::fs::read_to_string(on_disk).unwrap(), "X\t1\n");
}

#[tokio::test]
async fn test_local_abandon_releases_handle() {
  let dir = TempDir::new().unwrap();
  let storage = LocalFsStorage::new();
  let path = dir.path().join("abandoned.log");
  let handle = storage.open(&path).await.unwrap();
  storage.append(handle, b"KEPT\t4\n").await.unwrap();
  storage.flush(handle).await.unwrap();
  storage.append(handle, b"LOST\t4\n").await.unwrap();
  assert_eq!(storage.open_segments().await, 1);

  storage.abandon(handle).await;
  assert_eq!(storage.open_segments().await, 0);
  assert_err!(storage.append(handle, b"late").await);
  assert_eq!(std::fs::read_to_string(&path).unwrap(), "KEPT\t4\n");

  // Abandoning twice is harmless.
  storage.abandon(handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_segments_are_written_independently() {
  let dir = TempDir::new().unwrap();
  let storage = std::sync::Arc::new(LocalFsStorage::new());
  let mut tasks = Vec::new();
  for name in ["a", "b", "c", "d"] {
    let storage = storage.clone();
    let path = dir.path().join(format!("{name}.log"));
    tasks.push(tokio::spawn(async move {
      let handle = storage.open(&path).await?;
      for i in 0..50 {
        storage.append(handle, format!("{name}{i}\n").as_bytes()).await?;
        storage.flush(handle).await?;
      }
      storage.close(handle).await?;
      Ok::<_, StorageError>(path)
    }));
  }
  for task in tasks {
    let path = task.await.unwrap().unwrap();
    let name = path.file_stem().unwrap().to_string_lossy().into_owned();
    let lines: Vec<String> = std::fs::read_to_string(&path)
      .unwrap()
      .lines()
      .map(str::to_string)
      .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("{name}{i}")).collect();
    assert_eq!(lines, expected);
  }
  assert_eq!(storage.open_segments().await, 0);
}

#[test]
fn test_local_without_root_keeps_paths() {
  let storage = LocalFsStorage::new();
  assert_eq!(
    storage.resolve(Path::new("/data/storm/a.log")),
    PathBuf::from("/data/storm/a.log")
  );
}

// ============================================================================
// MemoryStorage
// ============================================================================

#[tokio::test]
async fn test_memory_separates_buffered_from_durable() {
  let storage = MemoryStorage::new();
  let path = Path::new("/out/a.log");
  let handle = storage.open(path).await.unwrap();
  storage.append(handle, b"A\t1\n").await.unwrap();

  let file = storage.file(path).unwrap();
  assert!(file.durable.is_empty());
  assert_eq!(file.buffered, b"A\t1\n");

  storage.flush(handle).await.unwrap();
  let file = storage.file(path).unwrap();
  assert_eq!(file.durable_text(), "A\t1\n");
  assert!(file.buffered.is_empty());
  assert!(!file.closed);
}

#[tokio::test]
async fn test_memory_injected_failures() {
  let storage = MemoryStorage::new();
  let handle = storage.open(Path::new("/out/b.log")).await.unwrap();

  storage.fail_next_appends(1);
  let err = storage.append(handle, b"x").await.unwrap_err();
  assert_eq!(err.class(), FailureClass::Transient);
  storage.append(handle, b"x").await.unwrap();

  storage.fail_next_flushes(2);
  assert_err!(storage.flush(handle).await);
  assert_err!(storage.flush(handle).await);
  assert_ok!(storage.flush(handle).await);
  assert_eq!(storage.flush_calls(), 3);
  assert_eq!(storage.successful_flushes(), 1);
}

#[tokio::test]
async fn test_memory_close_and_late_append() {
  let storage = MemoryStorage::new();
  let path = Path::new("/out/c.log");
  let handle = storage.open(path).await.unwrap();
  storage.append(handle, b"C\t1\n").await.unwrap();
  storage.close(handle).await.unwrap();

  let file = storage.file(path).unwrap();
  assert!(file.closed);
  assert_eq!(file.durable_text(), "C\t1\n");

  assert_err!(storage.append(handle, b"D\t1\n").await);
  assert_eq!(storage.appends_after_close(), 1);
  assert!(matches!(
    storage.open(path).await,
    Err(StorageError::AlreadyExists(_))
  ));
  assert_eq!(storage.durable_lines(), vec!["C\t1".to_string()]);
}

#[tokio::test]
async fn test_memory_abandon_discards_buffered_bytes() {
  let storage = MemoryStorage::new();
  let path = Path::new("/out/d.log");
  let handle = storage.open(path).await.unwrap();
  storage.append(handle, b"D\t1\n").await.unwrap();
  storage.flush(handle).await.unwrap();
  storage.append(handle, b"E\t1\n").await.unwrap();

  storage.abandon(handle).await;
  let file = storage.file(path).unwrap();
  assert!(file.closed);
  assert!(file.buffered.is_empty());
  assert_eq!(file.durable_text(), "D\t1\n");
  assert_eq!(storage.open_segments(), 0);
  assert_err!(storage.flush(handle).await);
}

#[test]
fn test_error_classes() {
  assert_eq!(
    StorageError::Unavailable("down".into()).class(),
    FailureClass::Transient
  );
  assert_eq!(StorageError::Io("eio".into()).class(), FailureClass::Transient);
  assert_eq!(
    StorageError::AlreadyExists(PathBuf::from("/x")).class(),
    FailureClass::FatalTask
  );
}

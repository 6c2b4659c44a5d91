use super::*;
use crate::backoff::Backoff;
use crate::error::{ComponentInfo, PipelineStage};
use crate::events::{MemoryReporter, PipelineEvent};
use crate::record::{LineRecord, PartitionId, RecordRef};
use crate::storage::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;

fn line(offset: u64, text: &str) -> LineRecord {
  LineRecord {
    origin: RecordRef::new(PartitionId(0), offset),
    line: text.to_string(),
    len: text.chars().count(),
  }
}

fn refs(offsets: &[u64]) -> Vec<RecordRef> {
  offsets
    .iter()
    .map(|o| RecordRef::new(PartitionId(0), *o))
    .collect()
}

fn settings(rotation: RotationPolicy, retries: u32) -> SinkSettings {
  SinkSettings {
    file_names: DefaultFileNameFormat::new()
      .with_path("/data/storm")
      .with_prefix("app_")
      .with_extension(".log"),
    rotation,
    sync_interval: None,
    max_write_retries: retries,
    retry_backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
  }
}

fn sink_from(
  storage: &MemoryStorage,
  reporter: &MemoryReporter,
  sync_every: usize,
  settings: SinkSettings,
) -> RotatingSink {
  RotatingSink::new(
    ComponentInfo::new("hdfs-bolt", PipelineStage::Sink, 0),
    Arc::new(storage.clone()),
    Arc::new(DelimitedRecordFormat::new().with_field_delimiter("\t")),
    Box::new(CountSyncPolicy::new(sync_every)),
    settings,
    Arc::new(reporter.clone()),
  )
}

fn sink_with(
  storage: &MemoryStorage,
  reporter: &MemoryReporter,
  sync_every: usize,
  rotation: RotationPolicy,
  retries: u32,
) -> RotatingSink {
  sink_from(storage, reporter, sync_every, settings(rotation, retries))
}

#[test]
fn test_delimited_format() {
  let format = DelimitedRecordFormat::new().with_field_delimiter("\t");
  assert_eq!(format.format(&line(0, "HELLO WORLD")), b"HELLO WORLD\t11\n");

  let csv = DelimitedRecordFormat::default();
  assert_eq!(csv.format(&line(0, "A")), b"A,1\n");
}

#[test]
fn test_file_name_format() {
  let names = DefaultFileNameFormat::new()
    .with_path("/data/storm/")
    .with_prefix("app_")
    .with_extension(".log");
  assert_eq!(names.name("hdfs-bolt", 3, 2, 1_700_000), "app_hdfs-bolt-3-2-1700000.log");
  assert_eq!(
    names.segment_path("hdfs-bolt", 0, 0, 5),
    std::path::PathBuf::from("/data/storm/app_hdfs-bolt-0-0-5.log")
  );
}

#[test]
fn test_count_sync_policy() {
  let mut policy = CountSyncPolicy::new(3);
  assert!(!policy.mark(10));
  assert!(!policy.mark(10));
  assert!(policy.mark(10));
  policy.reset();
  assert_eq!(policy.executed(), 0);
  assert!(!policy.mark(10));
}

#[test]
fn test_rotation_policy_triggers() {
  assert!(RotationPolicy::FileSize(100).size_due(100));
  assert!(!RotationPolicy::FileSize(100).size_due(99));
  assert!(!RotationPolicy::Never.size_due(u64::MAX));

  let start = tokio::time::Instant::now();
  let timed = RotationPolicy::Timed(Duration::from_secs(60));
  assert!(!timed.time_due(start, start + Duration::from_secs(59)));
  assert!(timed.time_due(start, start + Duration::from_secs(60)));
  assert!(!RotationPolicy::Never.time_due(start, start + Duration::from_secs(3600)));
}

#[tokio::test(start_paused = true)]
async fn test_acks_only_after_sync() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 3, RotationPolicy::Never, 3);

  assert!(sink.accept(line(0, "A")).await.unwrap().is_empty());
  assert!(sink.accept(line(1, "B")).await.unwrap().is_empty());
  assert_eq!(sink.pending().len(), 2);
  assert!(storage.durable_lines().is_empty());

  let acked = sink.accept(line(2, "C")).await.unwrap();
  assert_eq!(acked, refs(&[0, 1, 2]));
  assert_eq!(storage.flush_calls(), 1);
  assert_eq!(storage.durable_lines(), vec!["A\t1", "B\t1", "C\t1"]);
  assert!(sink.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flush_retry_acks_exactly_once() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 3, RotationPolicy::Never, 3);
  storage.fail_next_flushes(1);

  sink.accept(line(0, "A")).await.unwrap();
  sink.accept(line(1, "B")).await.unwrap();
  let acked = sink.accept(line(2, "C")).await.unwrap();

  assert_eq!(acked, refs(&[0, 1, 2]));
  assert_eq!(storage.flush_calls(), 2);
  assert_eq!(storage.successful_flushes(), 1);
  assert_eq!(sink.stats().acknowledged, 3);
  assert_eq!(
    reporter.count(|e| matches!(e, PipelineEvent::StorageRetry { attempt: 1, .. })),
    1
  );

  // Nothing left to acknowledge on the next flush.
  let more = sink.finish().await.unwrap();
  assert!(more.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_are_fatal() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 2, RotationPolicy::Never, 2);
  storage.fail_next_flushes(10);

  sink.accept(line(0, "A")).await.unwrap();
  let err = sink.accept(line(1, "B")).await.unwrap_err();
  assert_eq!(err.unacked(), refs(&[0, 1]).as_slice());
  assert!(matches!(err, SinkError::Fatal { operation: "flush", .. }));
  assert_eq!(storage.flush_calls(), 3);

  let closed = sink.accept(line(2, "C")).await.unwrap_err();
  assert!(matches!(closed, SinkError::Closed(_)));
  assert!(closed.unacked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_releases_segment() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 10, RotationPolicy::Never, 1);

  sink.accept(line(0, "A")).await.unwrap();
  let path = sink.current_segment().cloned().unwrap();
  assert_eq!(storage.open_segments(), 1);

  storage.fail_next_appends(5);
  sink.accept(line(1, "B")).await.unwrap_err();
  assert!(sink.current_segment().is_none());
  assert_eq!(storage.open_segments(), 0);

  // Unflushed bytes are discarded; both records were failed upstream.
  let file = storage.file(&path).unwrap();
  assert!(file.closed);
  assert!(file.durable.is_empty());
  assert!(file.buffered.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_interval_bounds_ack_latency() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_from(
    &storage,
    &reporter,
    1000,
    SinkSettings {
      sync_interval: Some(Duration::from_secs(5)),
      ..settings(RotationPolicy::Never, 3)
    },
  );
  assert_eq!(sink.next_deadline(), None);

  sink.accept(line(0, "A")).await.unwrap();
  tokio::time::advance(Duration::from_secs(2)).await;
  sink.accept(line(1, "B")).await.unwrap();
  let deadline = sink.next_deadline().unwrap();

  tokio::time::advance(Duration::from_secs(2)).await;
  assert!(sink.tick().await.unwrap().is_empty());
  assert!(storage.durable_lines().is_empty());

  tokio::time::sleep_until(deadline).await;
  assert_eq!(sink.tick().await.unwrap(), refs(&[0, 1]));
  assert_eq!(storage.durable_lines(), vec!["A\t1", "B\t1"]);
  assert_eq!(sink.next_deadline(), None);

  // The interval restarts with the next record, not the segment.
  tokio::time::advance(Duration::from_secs(30)).await;
  sink.accept(line(2, "C")).await.unwrap();
  let next = sink.next_deadline().unwrap();
  assert_eq!(next - tokio::time::Instant::now(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_failed_append_reports_incoming_record() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 10, RotationPolicy::Never, 1);

  sink.accept(line(0, "A")).await.unwrap();
  storage.fail_next_appends(5);
  let err = sink.accept(line(1, "B")).await.unwrap_err();
  assert_eq!(err.unacked(), refs(&[0, 1]).as_slice());
}

#[tokio::test(start_paused = true)]
async fn test_timed_rotation_closes_segment() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(
    &storage,
    &reporter,
    1000,
    RotationPolicy::Timed(Duration::from_secs(60)),
    3,
  );

  sink.accept(line(0, "R1")).await.unwrap();
  sink.accept(line(1, "R2")).await.unwrap();
  let first = sink.current_segment().cloned().unwrap();

  tokio::time::advance(Duration::from_secs(61)).await;
  let acked = sink.tick().await.unwrap();
  assert_eq!(acked, refs(&[0, 1]));

  let closed = storage.file(&first).unwrap();
  assert!(closed.closed);
  assert_eq!(closed.durable_text(), "R1\t2\nR2\t2\n");

  sink.accept(line(2, "R3")).await.unwrap();
  let second = sink.current_segment().cloned().unwrap();
  assert_ne!(first, second);
  assert_eq!(storage.appends_after_close(), 0);
  assert_eq!(storage.file(&first).unwrap().durable_text(), "R1\t2\nR2\t2\n");
  assert_eq!(sink.stats().rotations, 1);
  assert_eq!(
    reporter.count(|e| matches!(e, PipelineEvent::SegmentRotated { records: 2, .. })),
    1
  );
}

#[tokio::test(start_paused = true)]
async fn test_timed_rotation_is_checked_before_append() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(
    &storage,
    &reporter,
    1000,
    RotationPolicy::Timed(Duration::from_secs(60)),
    3,
  );

  sink.accept(line(0, "R1")).await.unwrap();
  tokio::time::advance(Duration::from_secs(90)).await;
  let acked = sink.accept(line(1, "R2")).await.unwrap();
  assert_eq!(acked, refs(&[0]));
  assert_eq!(storage.files().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timed_rotation_skips_empty_segment() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(
    &storage,
    &reporter,
    1000,
    RotationPolicy::Timed(Duration::from_secs(60)),
    3,
  );

  let armed = sink.next_deadline().unwrap();
  tokio::time::advance(Duration::from_secs(61)).await;
  assert!(sink.tick().await.unwrap().is_empty());
  assert!(storage.files().is_empty());
  assert!(sink.next_deadline().unwrap() > armed);
}

#[tokio::test(start_paused = true)]
async fn test_size_rotation() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  // "AAAA\t4\n" is 7 bytes; two records cross the limit.
  let mut sink = sink_with(&storage, &reporter, 1000, RotationPolicy::FileSize(10), 3);

  assert!(sink.accept(line(0, "AAAA")).await.unwrap().is_empty());
  let acked = sink.accept(line(1, "BBBB")).await.unwrap();
  assert_eq!(acked, refs(&[0, 1]));
  assert!(sink.current_segment().is_none());

  sink.accept(line(2, "CCCC")).await.unwrap();
  let files = storage.files();
  assert_eq!(files.len(), 2);
  assert!(files.iter().any(|(_, f)| f.closed && f.durable_text() == "AAAA\t4\nBBBB\t4\n"));
}

#[tokio::test(start_paused = true)]
async fn test_finish_flushes_and_closes() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 1000, RotationPolicy::Never, 3);

  sink.accept(line(0, "A")).await.unwrap();
  sink.accept(line(1, "B")).await.unwrap();
  let path = sink.current_segment().cloned().unwrap();

  let acked = sink.finish().await.unwrap();
  assert_eq!(acked, refs(&[0, 1]));
  let file = storage.file(&path).unwrap();
  assert!(file.closed);
  assert_eq!(file.durable_text(), "A\t1\nB\t1\n");
  assert!(matches!(
    sink.accept(line(2, "C")).await,
    Err(SinkError::Closed(_))
  ));
}

#[tokio::test(start_paused = true)]
async fn test_segment_names_follow_format() {
  let storage = MemoryStorage::new();
  let reporter = MemoryReporter::new();
  let mut sink = sink_with(&storage, &reporter, 1, RotationPolicy::Never, 3);

  sink.accept(line(0, "A")).await.unwrap();
  let path = sink.current_segment().cloned().unwrap();
  let name = path.file_name().unwrap().to_string_lossy().into_owned();
  assert!(path.starts_with("/data/storm"));
  assert!(name.starts_with("app_hdfs-bolt-0-0-"));
  assert!(name.ends_with(".log"));
  assert_eq!(
    reporter.count(|e| matches!(e, PipelineEvent::SegmentOpened { .. })),
    1
  );
}

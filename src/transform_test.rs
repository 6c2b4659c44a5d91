use crate::error::{Classify, FailureClass};
use crate::record::{PartitionId, Record, RecordRef};
use crate::routing::RoutingKey;
use crate::transform::{Transform, TransformError, UpperCaseTransform};

fn record(payload: &[u8]) -> Record {
  Record::new(PartitionId(2), 17, payload.to_vec())
}

#[test]
fn test_trims_and_uppercases() {
  let out = UpperCaseTransform::new()
    .transform(&record(b"  hello world\n"))
    .unwrap()
    .unwrap();
  assert_eq!(out.line, "HELLO WORLD");
  assert_eq!(out.len, 11);
  assert_eq!(out.origin, RecordRef::new(PartitionId(2), 17));
  assert_eq!(out.fields(), ["HELLO WORLD".to_string(), "11".to_string()]);
}

#[test]
fn test_length_counts_characters() {
  let out = UpperCaseTransform::new()
    .transform(&record("straße".as_bytes()))
    .unwrap()
    .unwrap();
  assert_eq!(out.line, "STRASSE");
  assert_eq!(out.len, 7);
}

#[test]
fn test_blank_payload_is_data_quality() {
  for payload in [&b""[..], b"   ", b"\t\r\n"] {
    let err = UpperCaseTransform::new()
      .transform(&record(payload))
      .unwrap_err();
    assert_eq!(err, TransformError::EmptyPayload);
    assert_eq!(err.class(), FailureClass::DataQuality);
  }
}

#[test]
fn test_invalid_utf8_is_malformed() {
  let err = UpperCaseTransform::new()
    .transform(&record(&[0xff, 0xfe, b'a']))
    .unwrap_err();
  assert!(matches!(err, TransformError::Malformed(_)));
  assert_eq!(err.class(), FailureClass::DataQuality);
}

#[test]
fn test_replay_produces_identical_output() {
  let transform = UpperCaseTransform::new();
  let input = record(b"error: disk full");
  assert_eq!(
    transform.transform(&input).unwrap(),
    transform.transform(&input.clone()).unwrap()
  );
}

#[test]
fn test_routing_key_is_the_line() {
  let transform = UpperCaseTransform::new();
  let out = transform.transform(&record(b"a b")).unwrap().unwrap();
  assert_eq!(transform.routing_key(&out), RoutingKey::new("A B"));
}

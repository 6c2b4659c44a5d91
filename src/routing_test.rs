//! # Routing Test Suite
//!
//! Key-stable routing, shuffle distribution and partition ownership.

use crate::record::PartitionId;
use crate::routing::{Grouping, Router, RoutingKey, owner_of, partitions_for_task, route};
use proptest::prelude::*;
use std::collections::HashSet;

#[test]
fn test_stable_hash_is_fixed() {
  // SHA-256("HELLO") starts with 3733cd977ff8eb18.
  assert_eq!(RoutingKey::new("HELLO").stable_hash(), 0x3733_cd97_7ff8_eb18);
}

#[test]
fn test_route_with_no_instances() {
  assert_eq!(route(&RoutingKey::new("X"), 0), 0);
  assert_eq!(route(&RoutingKey::new("X"), 1), 0);
}

#[test]
fn test_fields_router_ignores_call_order() {
  let mut first = Router::new(Grouping::Fields, 4);
  let mut second = Router::new(Grouping::Fields, 4);
  let key = RoutingKey::from("ERROR DISK FULL");
  let expected = first.select(Some(&key));
  for other in ["A", "B", "C"] {
    second.select(Some(&RoutingKey::from(other)));
  }
  assert_eq!(second.select(Some(&key)), expected);
  assert_eq!(first.select(Some(&key)), expected);
}

#[test]
fn test_shuffle_round_robin() {
  let mut router = Router::new(Grouping::Shuffle, 3);
  let picks: Vec<usize> = (0..7).map(|_| router.select(None)).collect();
  assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
  assert_eq!(router.instances(), 3);
  assert_eq!(router.grouping(), Grouping::Shuffle);
}

#[test]
fn test_router_clamps_instances() {
  let mut router = Router::new(Grouping::Shuffle, 0);
  assert_eq!(router.instances(), 1);
  assert_eq!(router.select(None), 0);
}

#[test]
fn test_fields_without_key_falls_back_to_round_robin() {
  let mut router = Router::new(Grouping::Fields, 2);
  assert_eq!(router.select(None), 0);
  assert_eq!(router.select(None), 1);
}

#[test]
fn test_partition_ownership() {
  let partitions: Vec<PartitionId> = (0..5).map(PartitionId).collect();
  assert_eq!(
    partitions_for_task(&partitions, 3, 0),
    vec![PartitionId(0), PartitionId(3)]
  );
  assert_eq!(
    partitions_for_task(&partitions, 3, 2),
    vec![PartitionId(2)]
  );
  assert!(partitions_for_task(&partitions, 8, 6).is_empty());
  assert!(partitions_for_task(&partitions, 0, 0).is_empty());
  assert_eq!(owner_of(PartitionId(7), 3), 1);
}

proptest! {
  #[test]
  fn prop_route_is_deterministic_and_in_range(key in ".*", instances in 1usize..64) {
    let key = RoutingKey::new(key);
    let index = route(&key, instances);
    prop_assert!(index < instances);
    prop_assert_eq!(index, route(&key.clone(), instances));
  }

  #[test]
  fn prop_every_partition_has_one_owner(partitions in 1u32..64, tasks in 1usize..16) {
    let all: Vec<PartitionId> = (0..partitions).map(PartitionId).collect();
    let mut seen = HashSet::new();
    for task in 0..tasks {
      for p in partitions_for_task(&all, tasks, task) {
        prop_assert!(seen.insert(p));
        prop_assert_eq!(owner_of(p, tasks), task);
      }
    }
    prop_assert_eq!(seen.len(), all.len());
  }
}

// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::*;
use claims::{assert_none, assert_some_eq};
use proptest::{collection::vec, prelude::*};
use rayon::prelude::*;
use std::collections::BTreeMap;

#[derive(Default, Debug, Clone, PartialEq)]
struct Counter {
    value: u64,
    touches: usize,
}

#[test]
fn put_default_constructs_missing_entries() {
    let table: Table<String, Counter> = Table::new(4);
    assert!(table.is_empty());

    let touches = table.put("a", |entry| {
        entry.touches += 1;
        entry.touches
    });
    assert_eq!(touches, 1);
    assert_eq!(table.len(), 1);

    // Reads also leave a default footprint.
    let value = table.get("b", |entry| entry.value);
    assert_eq!(value, 0);
    assert_eq!(table.len(), 2);
}

#[test]
fn try_get_does_not_insert() {
    let table: Table<String, Counter> = Table::new(2);
    assert_none!(table.try_get("missing", |entry| entry.value));
    assert!(table.is_empty());

    table.put("present", |entry| entry.value = 7);
    assert_some_eq!(table.try_get("present", |entry| entry.value), 7);
}

#[test]
fn zero_partitions_is_clamped() {
    let table: Table<u64, Counter> = Table::new(0);
    assert_eq!(table.num_partitions(), 1);
    assert_eq!(table.partition_of(&42), 0);
}

#[test]
fn partition_choice_is_stable_for_borrowed_keys() {
    let table: Table<String, Counter> = Table::new(16);
    let owned = String::from("warehouse-1");
    assert_eq!(table.partition_of("warehouse-1"), table.partition_of(&owned));
}

#[test]
fn concurrent_mutators_are_exclusive_per_key() {
    let table: Table<u64, Counter> = Table::new(3);
    (0..8_000u64).into_par_iter().for_each(|i| {
        table.put(&(i % 10), |entry| {
            entry.value += i;
            entry.touches += 1;
        });
    });

    let mut total_touches = 0;
    table.for_each(|key, entry| {
        assert!(*key < 10);
        total_touches += entry.touches;
    });
    assert_eq!(total_touches, 8_000);
    assert_eq!(table.len(), 10);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn table_matches_btreemap_baseline(
        ops in vec((0u8..32, any::<u64>()), 1..200),
        partitions in 1usize..9,
    ) {
        let table: Table<u8, Counter> = Table::new(partitions);
        let mut baseline = BTreeMap::new();

        for (key, value) in ops {
            table.put(&key, |entry| entry.value = value);
            baseline.insert(key, value);
        }

        let mut observed = BTreeMap::new();
        table.for_each(|key, entry| {
            observed.insert(*key, entry.value);
        });
        prop_assert_eq!(observed, baseline);
    }
}

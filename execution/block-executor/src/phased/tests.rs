// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    errors::ExecutorError,
    proptest_types::{
        TxnSpec, blind_write_blocks, blocks_strategy, computed_blocks, run_to_completion,
        serial_outcome,
    },
    txn::{FnTransaction, RwTransaction},
};
use claims::{assert_err, assert_ok};
use proptest::prelude::*;
use test_case::test_case;

fn statistics(name: &str) -> Arc<Statistics> {
    Arc::new(Statistics::new(name))
}

fn read_then_copy_block() -> Vec<Block> {
    // tx0 writes A = 1, tx1 copies A into B.
    let copy = FnTransaction::new(|view| {
        let a = view.get("A");
        view.put("B", a);
    });
    vec![Block::new(0, vec![
        Arc::new(RwTransaction::new(vec![], vec!["A".into()], "1")),
        Arc::new(copy),
    ])]
}

#[test]
fn raw_conflict_falls_back_and_observes_earlier_write() {
    let stats = statistics("aria-raw");
    let mut aria = Aria::new(read_then_copy_block(), stats.clone(), 2, 4, false).without_pinning();
    let snapshot = run_to_completion(&mut aria);

    assert_eq!(snapshot.get("A").map(String::as_str), Some("1"));
    assert_eq!(snapshot.get("B").map(String::as_str), Some("1"));
    assert_eq!(stats.commits(), 2);
    // tx1 executed twice: optimistically and in fallback.
    assert_eq!(stats.executions(), 3);
}

#[test]
fn reordering_commits_raw_without_war_in_place() {
    let stats = statistics("aria-reorder");
    let mut aria = Aria::new(read_then_copy_block(), stats.clone(), 2, 4, true).without_pinning();
    let snapshot = run_to_completion(&mut aria);

    // tx1 is serialized before tx0 and copies the absent value.
    assert_eq!(snapshot.get("A").map(String::as_str), Some("1"));
    assert_eq!(snapshot.get("B"), None);
    assert_eq!(stats.executions(), 2);
}

#[test_case(1; "one worker")]
#[test_case(3; "three workers")]
fn aria_runs_four_rendezvous_per_batch(num_threads: usize) {
    let blocks = blind_write_blocks(&[vec![], vec![], vec![]]);
    let mut aria = Aria::new(blocks, statistics("aria-barrier"), num_threads, 2, false).without_pinning();
    run_to_completion(&mut aria);
    assert_eq!(aria.barrier_generations(), 12);
}

#[test]
fn aria_er_runs_six_rendezvous_per_batch() {
    let blocks = blind_write_blocks(&[vec![], vec![]]);
    let mut aria_er = AriaEr::new(blocks, statistics("ariaer-barrier"), 2, 2, false).without_pinning();
    run_to_completion(&mut aria_er);
    assert_eq!(aria_er.barrier_generations(), 12);
}

#[test]
fn stop_leaves_after_one_extra_rendezvous() {
    let heavy: Vec<Block> = (0..2_000u64)
        .map(|id| {
            Block::new(id, vec![
                Arc::new(RwTransaction::new(vec![], vec![format!("k{}", id % 7)], "v").with_cost(50))
                    as Arc<dyn Transaction>;
                4
            ])
        })
        .collect();
    let mut harmony = Harmony::new(heavy, statistics("harmony-stop"), 3, 4, false).without_pinning();
    assert_ok!(harmony.start());
    assert_ok!(harmony.stop());

    let generations = harmony.barrier_generations();
    assert!(generations == 4 * 2_000 || generations % 4 == 1, "{}", generations);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let mut aria = Aria::new(vec![], statistics("aria-lifecycle"), 2, 2, false).without_pinning();
    assert!(matches!(aria.stop(), Err(ExecutorError::NotStarted("Aria"))));
    assert_ok!(aria.start());
    assert!(matches!(aria.start(), Err(ExecutorError::AlreadyStarted("Aria"))));
    assert_ok!(aria.wait());
    assert_err!(aria.start());
}

#[test]
fn harmony_commits_highest_writer_without_reads() {
    let blocks = blind_write_blocks(&[vec![
        TxnSpec::writes(&[1, 2]),
        TxnSpec::writes(&[2]),
        TxnSpec::writes(&[1]),
    ]]);
    let expected = serial_outcome(&blocks);
    let stats = statistics("harmony-lww");
    let mut harmony = Harmony::new(blocks, stats.clone(), 2, 4, false).without_pinning();
    assert_eq!(run_to_completion(&mut harmony), expected);
    // No reads, no dependencies, no fallback.
    assert_eq!(stats.executions(), 3);
}

fn fallback_below_committed_writer_block() -> Vec<Block> {
    // tx0 writes a, tx1 reads a and writes K, tx2 reads K and writes z, tx3 writes K.
    blind_write_blocks(&[vec![
        TxnSpec::writes(&[0]),
        TxnSpec {
            reads: vec![0],
            writes: vec![1],
        },
        TxnSpec {
            reads: vec![1],
            writes: vec![2],
        },
        TxnSpec::writes(&[1]),
    ]])
}

#[test_case(1)]
#[test_case(2)]
#[test_case(4)]
fn harmony_fallback_keeps_higher_committed_write(num_threads: usize) {
    let blocks = fallback_below_committed_writer_block();
    let expected = serial_outcome(&blocks);
    assert_eq!(expected.get("k1").map(String::as_str), Some("b0-t3"));

    let stats = statistics("harmony-fallback");
    let mut harmony = Harmony::new(blocks, stats.clone(), num_threads, 2, false).without_pinning();
    assert_eq!(run_to_completion(&mut harmony), expected);
    // Only tx1 falls back: it missed the write of tx0 and tx2 missed its own.
    assert_eq!(stats.executions(), 5);
}

#[test_case(false)]
#[test_case(true)]
fn aria_fallback_below_committed_writer_matches_serial(enable_reordering: bool) {
    let blocks = fallback_below_committed_writer_block();
    let expected = serial_outcome(&blocks);
    let mut aria = Aria::new(blocks.clone(), statistics("aria-fallback"), 2, 2, enable_reordering)
        .without_pinning();
    assert_eq!(run_to_completion(&mut aria), expected);
    let mut aria_er = AriaEr::new(blocks, statistics("ariaer-fallback"), 2, 2, enable_reordering)
        .without_pinning();
    assert_eq!(run_to_completion(&mut aria_er), expected);
}

#[test_case(1)]
#[test_case(3)]
fn panicking_transaction_does_not_strand_other_workers(num_threads: usize) {
    let mut txns: Vec<Arc<dyn Transaction>> = (0..6)
        .map(|idx| {
            Arc::new(RwTransaction::new(vec!["k0".into()], vec![format!("k{}", idx % 3)], "v"))
                as Arc<dyn Transaction>
        })
        .collect();
    txns[1] = Arc::new(FnTransaction::new(|_| panic!("transaction failed")));
    let blocks = vec![Block::new(0, txns.clone()), Block::new(1, txns)];

    let mut aria = Aria::new(blocks, statistics("aria-panic"), num_threads, 2, false).without_pinning();
    assert_ok!(aria.start());
    assert!(matches!(aria.wait(), Err(ExecutorError::WorkerPanicked(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tagged_writes_match_serial_order(
        specs in blocks_strategy(12, 2, 3, 12, 4),
        num_threads in 1usize..5,
        enable_reordering in any::<bool>(),
    ) {
        let blocks = blind_write_blocks(&specs);
        let expected = serial_outcome(&blocks);

        let mut aria = Aria::new(blocks.clone(), statistics("aria-prop"), num_threads, 3, enable_reordering)
            .without_pinning();
        prop_assert_eq!(&run_to_completion(&mut aria), &expected);

        let mut aria_er = AriaEr::new(blocks.clone(), statistics("ariaer-prop"), num_threads, 3, enable_reordering)
            .without_pinning();
        prop_assert_eq!(&run_to_completion(&mut aria_er), &expected);

        let mut harmony = Harmony::new(blocks, statistics("harmony-prop"), num_threads, 3, false)
            .without_pinning();
        prop_assert_eq!(&run_to_completion(&mut harmony), &expected);
    }

    #[test]
    fn outcome_is_independent_of_worker_count(
        specs in blocks_strategy(8, 3, 2, 10, 3),
        enable_reordering in any::<bool>(),
    ) {
        let blocks = computed_blocks(&specs);

        let run_aria = |num_threads| {
            let mut aria = Aria::new(blocks.clone(), statistics("aria-det"), num_threads, 2, enable_reordering)
                .without_pinning();
            run_to_completion(&mut aria)
        };
        prop_assert_eq!(run_aria(1), run_aria(4));

        let run_aria_er = |num_threads| {
            let mut aria_er = AriaEr::new(blocks.clone(), statistics("ariaer-det"), num_threads, 2, enable_reordering)
                .without_pinning();
            run_to_completion(&mut aria_er)
        };
        prop_assert_eq!(run_aria_er(1), run_aria_er(3));

        let run_harmony = |num_threads| {
            let mut harmony = Harmony::new(blocks.clone(), statistics("harmony-det"), num_threads, 2, false)
                .without_pinning();
            run_to_completion(&mut harmony)
        };
        prop_assert_eq!(run_harmony(1), run_harmony(3));
    }
}

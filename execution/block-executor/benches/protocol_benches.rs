// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

// Run this bencher via `cargo bench --features fuzzing`.
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use dcc_block_executor::{
    Aria, AriaEr, Block, Fractal, Harmony, Loom, Moss, OptMe, Protocol, Serial, Statistics,
    proptest_types::{TxnSpec, blind_write_blocks, blocks_strategy, computed_blocks, disjoint_blocks, run_to_completion},
};
use proptest::{
    strategy::{Strategy, ValueTree},
    test_runner::TestRunner,
};
use std::sync::Arc;

const NUM_THREADS: usize = 4;
const PARTITIONS: usize = 64;

type Build = fn(Vec<Block>, Arc<Statistics>) -> Box<dyn Protocol>;

fn serial(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(Serial::new(blocks, stats, PARTITIONS))
}

fn aria(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(Aria::new(blocks, stats, NUM_THREADS, PARTITIONS, false).without_pinning())
}

fn aria_er(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(AriaEr::new(blocks, stats, NUM_THREADS, PARTITIONS, false).without_pinning())
}

fn harmony(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(Harmony::new(blocks, stats, NUM_THREADS, PARTITIONS, true).without_pinning())
}

fn moss(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(Moss::new(blocks, stats, NUM_THREADS, PARTITIONS))
}

fn loom(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(Loom::new(blocks, stats, NUM_THREADS, PARTITIONS, true, false))
}

fn optme(blocks: Vec<Block>, stats: Arc<Statistics>) -> Box<dyn Protocol> {
    Box::new(OptMe::new(blocks, stats, NUM_THREADS, PARTITIONS))
}

const PROTOCOLS: &[(&str, Build)] = &[
    ("serial", serial),
    ("aria", aria),
    ("aria_er", aria_er),
    ("harmony", harmony),
    ("moss", moss),
    ("loom", loom),
    ("optme", optme),
];

fn specs() -> Vec<Vec<TxnSpec>> {
    let mut runner = TestRunner::deterministic();
    blocks_strategy(64, 2, 2, 200, 4)
        .new_tree(&mut runner)
        .expect("strategy must generate")
        .current()
}

fn bench_protocols(c: &mut Criterion, group: &str, blocks: Vec<Block>) {
    let mut group = c.benchmark_group(group);
    for (name, build) in PROTOCOLS {
        group.bench_function(*name, |b| {
            b.iter_batched(
                || build(blocks.clone(), Arc::new(Statistics::new(format!("bench-{}", name)))),
                |mut protocol| run_to_completion(protocol.as_mut()),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn blind_write_benches(c: &mut Criterion) {
    bench_protocols(c, "blind_writes", blind_write_blocks(&specs()));
}

fn computed_benches(c: &mut Criterion) {
    bench_protocols(c, "computed", computed_blocks(&specs()));
}

fn fractal_benches(c: &mut Criterion) {
    let blocks = disjoint_blocks(4, 256);
    c.bench_function("fractal_disjoint", |b| {
        b.iter_batched(
            || {
                Fractal::new(
                    blocks.clone(),
                    Arc::new(Statistics::new("bench-fractal")),
                    NUM_THREADS,
                    PARTITIONS,
                )
            },
            |mut fractal| run_to_completion(&mut fractal),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, blind_write_benches, computed_benches, fractal_benches);

criterion_main!(benches);

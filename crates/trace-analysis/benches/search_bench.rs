//! Benchmarks for the synchronous analysis passes.
//!
//! Uses a synthetic layered transfer graph (no ledger I/O).
//! Run with: `cargo bench --package trace-analysis`

use chrono::DateTime;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trace_analysis::community::CommunityDetector;
use trace_analysis::path_finder::find_paths_in;
use trace_analysis::{NodeScorer, TraceConfig, TransferGraph};
use trace_data::{Address, Amount, Transfer};

fn addr(n: u32) -> Address {
    Address::parse(&format!("T{n:0>33}")).unwrap()
}

/// Five layers of 40 addresses; every node pays three nodes in the next layer.
fn layered_graph() -> (TransferGraph, Address, Address) {
    const WIDTH: u32 = 40;
    const LAYERS: u32 = 5;
    let source = 0;
    let target = 9_999;
    let mut transfers = Vec::new();
    let mut id = 0u64;
    let mut push = |from: u32, to: u32, usdt: u64| {
        id += 1;
        transfers.push(Transfer {
            tx_id: format!("{id:064x}"),
            from: addr(from),
            to: addr(to),
            amount: Amount::from_usdt(usdt),
            timestamp: DateTime::from_timestamp(1_700_000_000 + id as i64 * 60, 0).unwrap(),
        });
    };

    for i in 0..WIDTH {
        push(source, 1 + i, 100 + u64::from(i));
    }
    for layer in 0..LAYERS - 1 {
        for i in 0..WIDTH {
            let from = 1 + layer * WIDTH + i;
            for k in 0..3 {
                let to = 1 + (layer + 1) * WIDTH + (i * 7 + k * 13) % WIDTH;
                push(from, to, 50 + u64::from(k));
            }
        }
    }
    for i in 0..WIDTH {
        push(1 + (LAYERS - 1) * WIDTH + i, target, 75);
    }
    (TransferGraph::from_transfers(&transfers), addr(source), addr(target))
}

fn bench_find_paths(c: &mut Criterion) {
    let (graph, source, target) = layered_graph();
    c.bench_function("find_paths_6_hops_200_nodes", |b| {
        b.iter(|| find_paths_in(black_box(&graph), &source, &target, 6, 20));
    });
}

fn bench_node_scoring(c: &mut Criterion) {
    let (graph, _, _) = layered_graph();
    let scorer = NodeScorer::new(&TraceConfig::default());
    c.bench_function("pagerank_and_kcore_200_nodes", |b| {
        b.iter(|| scorer.score(black_box(&graph)));
    });
}

fn bench_communities(c: &mut Criterion) {
    let (graph, _, _) = layered_graph();
    let detector = CommunityDetector::new(20);
    c.bench_function("label_propagation_200_nodes", |b| {
        b.iter(|| detector.detect(black_box(&graph)));
    });
}

criterion_group!(benches, bench_find_paths, bench_node_scoring, bench_communities);
criterion_main!(benches);

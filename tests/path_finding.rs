//! Path invariants and pruning behaviour across full runs.

mod common;

use std::collections::HashSet;

use common::{addr, analyzer, fan_out, ledger, transfer, transfer_at};
use trace_analysis::{find_paths_in, AnalysisRequest, ProgressReporter, TraceConfig, TransferGraph};
use trace_data::{Amount, MemoryLedger};

/// A small mesh with cycles, parallel transfers and dead ends.
fn mesh() -> Vec<(u32, u32, u64)> {
    vec![
        (1, 3, 500),
        (1, 4, 300),
        (1, 4, 250),
        (3, 4, 120),
        (4, 3, 80),
        (3, 5, 200),
        (4, 6, 150),
        (5, 6, 90),
        (6, 5, 60),
        (5, 2, 400),
        (6, 2, 350),
        (6, 7, 40),
        (7, 1, 30),
        (3, 8, 20),
    ]
}

#[tokio::test]
async fn every_path_is_simple_bounded_and_anchored() {
    let min = TraceConfig::default().min_transaction_amount;
    for max_hops in 1..=5 {
        let request = AnalysisRequest::new(addr(1).as_str(), addr(2).as_str(), max_hops).unwrap();
        let result = analyzer(ledger(&mesh()), &[], TraceConfig::default())
            .run(&request, &mut ProgressReporter::disabled())
            .await
            .unwrap();

        for analyzed in &result.paths {
            let path = &analyzed.path;
            assert!(path.addresses.len() <= max_hops + 1, "too long at max_hops={max_hops}");
            assert_eq!(path.addresses.first(), Some(&addr(1)));
            assert_eq!(path.addresses.last(), Some(&addr(2)));
            let distinct: HashSet<_> = path.addresses.iter().collect();
            assert_eq!(distinct.len(), path.addresses.len(), "repeated address");

            assert_eq!(path.hops.len(), path.addresses.len() - 1);
            for (hop, pair) in path.hops.iter().zip(path.addresses.windows(2)) {
                assert_eq!((&hop.from, &hop.to), (&pair[0], &pair[1]));
                assert!(!hop.transfers.is_empty());
                for t in &hop.transfers {
                    assert_eq!((&t.from, &t.to), (&hop.from, &hop.to));
                    assert!(t.amount >= min);
                }
            }
        }

        let hop_counts: Vec<usize> = result.paths.iter().map(|p| p.path.hop_count()).collect();
        assert!(hop_counts.windows(2).all(|w| w[0] <= w[1]), "not ranked by hops");
    }
}

#[tokio::test]
async fn more_hops_never_lose_shorter_paths() {
    let mut previous: Vec<Vec<trace_data::Address>> = Vec::new();
    for max_hops in 2..=4 {
        let request = AnalysisRequest::new(addr(1).as_str(), addr(2).as_str(), max_hops).unwrap();
        let result = analyzer(ledger(&mesh()), &[], TraceConfig::default())
            .run(&request, &mut ProgressReporter::disabled())
            .await
            .unwrap();
        let found: Vec<_> = result.paths.iter().map(|p| p.path.addresses.clone()).collect();
        for path in &previous {
            assert!(found.contains(path), "lost {path:?} at max_hops={max_hops}");
        }
        previous = found;
    }
}

/// A hub over the connectivity limit keeps its known edges but is never expanded.
#[tokio::test]
async fn pruned_hub_stays_on_path_without_expanding() {
    let hub = 50;
    let mut memory = MemoryLedger::from_transfers(fan_out(hub, 100, 20));
    memory.push(transfer(1, hub, 1_000));
    memory.push(transfer(hub, 2, 900));
    let config = TraceConfig {
        max_node_connections: 5,
        ..TraceConfig::default()
    };

    let request = AnalysisRequest::new(addr(1).as_str(), addr(2).as_str(), 3).unwrap();
    let result = analyzer(memory, &[], config)
        .run(&request, &mut ProgressReporter::disabled())
        .await
        .unwrap();

    assert_eq!(result.paths.len(), 1);
    assert_eq!(result.paths[0].path.addresses, vec![addr(1), addr(hub), addr(2)]);
    assert_eq!(result.graph_statistics.pruned_count, 1);
    for i in 0..20 {
        assert!(!result.node_scores.contains_key(&addr(100 + i)), "hub fan-out was expanded");
    }
}

#[tokio::test]
async fn parallel_transfers_form_one_hop() {
    let memory = MemoryLedger::from_transfers([
        transfer_at(1, 3, 100, 0),
        transfer_at(1, 3, 200, 3_600),
        transfer_at(1, 3, 300, 7_200),
        transfer_at(3, 2, 550, 10_800),
    ]);
    let request = AnalysisRequest::new(addr(1).as_str(), addr(2).as_str(), 2).unwrap();
    let result = analyzer(memory, &[], TraceConfig::default())
        .run(&request, &mut ProgressReporter::disabled())
        .await
        .unwrap();

    let path = &result.paths[0].path;
    assert_eq!(path.hops[0].transfers.len(), 3);
    assert_eq!(path.hops[0].total, Amount::from_usdt(600));
    assert_eq!(path.total_amount, Amount::from_usdt(1_150));
}

#[test]
fn ties_in_length_prefer_larger_amounts() {
    let transfers = [
        transfer(1, 3, 100),
        transfer(3, 2, 100),
        transfer(1, 4, 5_000),
        transfer(4, 2, 5_000),
        transfer(1, 5, 700),
        transfer(5, 2, 700),
    ];
    let graph = TransferGraph::from_transfers(&transfers);
    let outcome = find_paths_in(&graph, &addr(1), &addr(2), 2, 20);

    let middles: Vec<_> = outcome.paths.iter().map(|p| p.addresses[1].clone()).collect();
    assert_eq!(middles, vec![addr(4), addr(5), addr(3)]);
}

#[test]
fn reverse_direction_is_not_a_path() {
    let graph = TransferGraph::from_transfers(&[transfer(2, 3, 100), transfer(3, 1, 100)]);
    assert!(find_paths_in(&graph, &addr(1), &addr(2), 5, 20).paths.is_empty());
}

//! Bidirectional breadth-first path search.
//!
//! Two frontiers grow level by level: one from the source along outgoing
//! transfers, one from the target along incoming transfers. Each frontier
//! maps every node it has visited to the first (shortest) partial path that
//! reached it. When a newly visited node is already known to the other
//! frontier, the two partial paths are joined into a candidate.
//!
//! [`BidirectionalPathFinder`] is a plain state machine: the caller asks for
//! the next side with [`next_side`](BidirectionalPathFinder::next_side), makes
//! sure that side's level is expanded, then calls
//! [`step`](BidirectionalPathFinder::step). [`search`] drives it against a
//! live [`GraphBuilder`]; [`find_paths_in`] drives it over a finished graph.
//!
//! Side choice: the smaller non-empty level goes first, then the shallower
//! side, then forward. Both sides draw on one shared address budget in that
//! order, so allocation between them is deterministic.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;
use serde::Serialize;
use tokio::time::Instant;
use trace_data::{Address, Amount, LedgerClient, Transfer};

use crate::builder::GraphBuilder;
use crate::graph::TransferGraph;
use crate::progress::{Phase, ProgressReporter};

/// One address-to-address step of a path, possibly several transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    pub from: Address,
    pub to: Address,
    /// Oldest first.
    pub transfers: Vec<Transfer>,
    pub total: Amount,
}

/// A simple directed path from source to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Path {
    /// Source first, target last, no repeats.
    pub addresses: Vec<Address>,
    pub hops: Vec<Hop>,
    /// Combined frontier depth when the path was confirmed.
    pub discovered_at_hop: usize,
    pub total_amount: Amount,
}

impl Path {
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Addresses strictly between source and target.
    pub fn intermediaries(&self) -> &[Address] {
        match self.addresses.len() {
            0..=2 => &[],
            n => &self.addresses[1..n - 1],
        }
    }

    pub fn transfers(&self) -> impl Iterator<Item = &Transfer> + '_ {
        self.hops.iter().flat_map(|h| h.transfers.iter())
    }
}

/// Why the search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Combined depth reached the hop budget.
    HopBudget,
    /// Neither side has anything left to expand.
    FrontiersExhausted,
    PathLimit,
    AddressBudget,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Forward,
    Backward,
}

#[derive(Debug)]
struct Frontier {
    /// Partial path from this side's endpoint to each visited node, endpoint first.
    visited: HashMap<NodeIndex, Vec<NodeIndex>>,
    level: Vec<NodeIndex>,
    depth: usize,
}

impl Frontier {
    fn new(endpoint: NodeIndex) -> Self {
        Self {
            visited: HashMap::from([(endpoint, vec![endpoint])]),
            level: vec![endpoint],
            depth: 0,
        }
    }
}

#[derive(Debug)]
struct Candidate {
    nodes: Vec<NodeIndex>,
    discovered_at_hop: usize,
}

/// Search state for one source/target pair.
#[derive(Debug)]
pub struct BidirectionalPathFinder {
    source: NodeIndex,
    target: NodeIndex,
    max_hops: usize,
    max_paths: usize,
    forward: Frontier,
    backward: Frontier,
    /// In discovery order.
    candidates: Vec<Candidate>,
    /// Exchange shortcuts among `candidates`; they never end the search.
    shortcuts: usize,
    seen: HashSet<Vec<NodeIndex>>,
}

impl BidirectionalPathFinder {
    pub fn new(source: NodeIndex, target: NodeIndex, max_hops: usize, max_paths: usize) -> Self {
        Self {
            source,
            target,
            max_hops,
            max_paths,
            forward: Frontier::new(source),
            backward: Frontier::new(target),
            candidates: Vec::new(),
            shortcuts: 0,
            seen: HashSet::new(),
        }
    }

    /// Combined depth of both frontiers.
    pub fn depth(&self) -> usize {
        self.forward.depth + self.backward.depth
    }

    pub fn paths_found(&self) -> usize {
        self.candidates.len()
    }

    pub fn level(&self, side: Side) -> &[NodeIndex] {
        match side {
            Side::Forward => &self.forward.level,
            Side::Backward => &self.backward.level,
        }
    }

    /// The side to expand next, or why the search is over.
    pub fn next_side(&self) -> Result<Side, Termination> {
        if self.candidates.len() - self.shortcuts >= self.max_paths {
            return Err(Termination::PathLimit);
        }
        if self.depth() >= self.max_hops {
            return Err(Termination::HopBudget);
        }
        let (f, b) = (&self.forward, &self.backward);
        match (f.level.is_empty(), b.level.is_empty()) {
            (true, true) => Err(Termination::FrontiersExhausted),
            (false, true) => Ok(Side::Forward),
            (true, false) => Ok(Side::Backward),
            (false, false) => {
                if (f.level.len(), f.depth) <= (b.level.len(), b.depth) {
                    Ok(Side::Forward)
                } else {
                    Ok(Side::Backward)
                }
            }
        }
    }

    /// Records `source -> exchange -> target` for every known exchange that
    /// receives from the source and sends to the target.
    pub fn record_exchange_shortcuts(&mut self, graph: &TransferGraph) {
        if self.max_hops < 2 {
            return;
        }
        let into_target: HashSet<NodeIndex> =
            graph.predecessors(self.target).into_iter().map(|(ix, _)| ix).collect();
        for (ix, _) in graph.successors(self.source) {
            if ix != self.target && graph.node(ix).is_exchange() && into_target.contains(&ix) {
                tracing::debug!(exchange = %graph.address(ix), "exchange-mediated path");
                if self.push_candidate(vec![self.source, ix, self.target], 2) {
                    self.shortcuts += 1;
                }
            }
        }
    }

    /// Advances `side` by one level over the current graph. Returns the
    /// number of new paths confirmed.
    pub fn step(&mut self, side: Side, graph: &TransferGraph) -> usize {
        let (own, other) = match side {
            Side::Forward => (&mut self.forward, &self.backward),
            Side::Backward => (&mut self.backward, &self.forward),
        };

        let level = std::mem::take(&mut own.level);
        let mut next = Vec::new();
        let mut meetings = Vec::new();
        for u in level {
            let neighbors = match side {
                Side::Forward => graph.successors(u),
                Side::Backward => graph.predecessors(u),
            };
            for (v, _) in neighbors {
                if own.visited.contains_key(&v) {
                    continue;
                }
                let mut partial = own.visited.get(&u).cloned().unwrap_or_default();
                partial.push(v);
                if let Some(opposite) = other.visited.get(&v) {
                    meetings.push(join(side, &partial, opposite));
                }
                own.visited.insert(v, partial);
                next.push(v);
            }
        }
        own.level = next;
        own.depth += 1;

        let depth = self.depth();
        let before = self.candidates.len();
        for nodes in meetings {
            self.push_candidate(nodes, depth);
        }
        self.candidates.len() - before
    }

    /// Records a candidate unless it is invalid or already known. The path
    /// limit is applied after ranking, in [`Self::into_paths`].
    fn push_candidate(&mut self, nodes: Vec<NodeIndex>, discovered_at_hop: usize) -> bool {
        let hops = nodes.len().saturating_sub(1);
        let distinct: HashSet<_> = nodes.iter().collect();
        let valid = hops >= 1
            && hops <= self.max_hops
            && distinct.len() == nodes.len()
            && nodes.first() == Some(&self.source)
            && nodes.last() == Some(&self.target);
        if valid && self.seen.insert(nodes.clone()) {
            self.candidates.push(Candidate {
                nodes,
                discovered_at_hop,
            });
            return true;
        }
        false
    }

    /// Materializes candidates, ranked by hop count, then total amount
    /// (larger first), then discovery order, keeping the best `max_paths`.
    pub fn into_paths(self, graph: &TransferGraph) -> Vec<Path> {
        let max_paths = self.max_paths;
        let mut paths: Vec<(usize, Path)> = self
            .candidates
            .into_iter()
            .enumerate()
            .map(|(order, c)| (order, materialize(graph, &c)))
            .collect();
        paths.sort_by(|(oa, a), (ob, b)| {
            a.hop_count()
                .cmp(&b.hop_count())
                .then(b.total_amount.cmp(&a.total_amount))
                .then(oa.cmp(ob))
        });
        paths.into_iter().take(max_paths).map(|(_, p)| p).collect()
    }
}

/// Joins a partial path from the side just expanded with the opposite
/// side's partial path to the same node.
fn join(side: Side, own: &[NodeIndex], opposite: &[NodeIndex]) -> Vec<NodeIndex> {
    let (forward, backward) = match side {
        Side::Forward => (own, opposite),
        Side::Backward => (opposite, own),
    };
    let mut nodes = forward.to_vec();
    nodes.extend(backward.iter().rev().skip(1));
    nodes
}

fn materialize(graph: &TransferGraph, candidate: &Candidate) -> Path {
    let hops: Vec<Hop> = candidate
        .nodes
        .windows(2)
        .map(|pair| {
            let transfers: Vec<Transfer> = graph.transfers_between(pair[0], pair[1]).into_iter().cloned().collect();
            let total: Amount = transfers.iter().map(|t| t.amount).sum();
            Hop {
                from: graph.address(pair[0]).clone(),
                to: graph.address(pair[1]).clone(),
                transfers,
                total,
            }
        })
        .collect();
    let total_amount: Amount = hops.iter().map(|h| h.total).sum();
    Path {
        addresses: candidate.nodes.iter().map(|&ix| graph.address(ix).clone()).collect(),
        hops,
        discovered_at_hop: candidate.discovered_at_hop,
        total_amount,
    }
}

/// Paths found and why the search ended.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub paths: Vec<Path>,
    /// Ranked below the path limit and discarded.
    pub paths_dropped: usize,
    pub termination: Termination,
    pub depth_reached: usize,
}

/// Runs the search while growing the graph through `builder`.
#[tracing::instrument(skip_all, fields(max_hops = max_hops))]
pub async fn search<L: LedgerClient + ?Sized>(
    builder: &mut GraphBuilder<'_, L>,
    source: NodeIndex,
    target: NodeIndex,
    max_hops: usize,
    deadline: Instant,
    progress: &mut ProgressReporter,
) -> SearchOutcome {
    let mut finder = BidirectionalPathFinder::new(source, target, max_hops, builder.config().max_paths);
    finder.record_exchange_shortcuts(builder.graph());

    let termination = loop {
        let side = match finder.next_side() {
            Ok(side) => side,
            Err(done) => break done,
        };
        if Instant::now() >= deadline {
            break Termination::Deadline;
        }

        let level = finder.level(side).to_vec();
        let batch = builder.expand_batch(&level, deadline).await;
        let found = finder.step(side, builder.graph());
        progress.report(
            Phase::Searching,
            builder.graph().node_count(),
            finder.depth(),
            finder.paths_found(),
        );
        tracing::debug!(
            side = ?side,
            level = level.len(),
            fetched = batch.fetched,
            depth = finder.depth(),
            found,
            nodes = builder.graph().node_count(),
            "search round complete"
        );

        if batch.deadline_hit {
            break Termination::Deadline;
        }
        if builder.address_budget_exhausted() {
            break Termination::AddressBudget;
        }
    };

    let depth_reached = finder.depth();
    let found = finder.paths_found();
    let paths = finder.into_paths(builder.graph());
    let paths_dropped = found - paths.len();
    tracing::info!(paths = paths.len(), paths_dropped, termination = ?termination, depth_reached, "search finished");
    SearchOutcome {
        paths,
        paths_dropped,
        termination,
        depth_reached,
    }
}

/// Runs the search over an already built graph, without fetching.
pub fn find_paths_in(
    graph: &TransferGraph,
    source: &Address,
    target: &Address,
    max_hops: usize,
    max_paths: usize,
) -> SearchOutcome {
    let (Some(s), Some(t)) = (graph.index_of(source), graph.index_of(target)) else {
        return SearchOutcome {
            paths: Vec::new(),
            paths_dropped: 0,
            termination: Termination::FrontiersExhausted,
            depth_reached: 0,
        };
    };
    let mut finder = BidirectionalPathFinder::new(s, t, max_hops, max_paths);
    finder.record_exchange_shortcuts(graph);
    let termination = loop {
        match finder.next_side() {
            Ok(side) => {
                finder.step(side, graph);
            }
            Err(done) => break done,
        }
    };
    let depth_reached = finder.depth();
    let found = finder.paths_found();
    let paths = finder.into_paths(graph);
    SearchOutcome {
        depth_reached,
        paths_dropped: found - paths.len(),
        paths,
        termination,
    }
}

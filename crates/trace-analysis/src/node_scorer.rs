//! Node importance (PageRank) and density (k-core) over the built graph.

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::config::TraceConfig;
use crate::graph::TransferGraph;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeScore {
    pub page_rank: f64,
    pub core_number: usize,
}

/// Scores for every node, indexed by graph position.
#[derive(Debug, Clone, Default)]
pub struct NodeScores {
    scores: Vec<NodeScore>,
    pub iterations: usize,
    pub converged: bool,
}

impl NodeScores {
    pub fn get(&self, ix: NodeIndex) -> Option<&NodeScore> {
        self.scores.get(ix.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &NodeScore)> + '_ {
        self.scores.iter().enumerate().map(|(i, s)| (NodeIndex::new(i), s))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn page_rank_sum(&self) -> f64 {
        self.scores.iter().map(|s| s.page_rank).sum()
    }

    /// The `k` highest-ranked nodes, ties by graph position.
    pub fn top_by_page_rank(&self, k: usize) -> Vec<NodeIndex> {
        let mut ranked: Vec<_> = self.iter().collect();
        ranked.sort_by(|(ia, a), (ib, b)| b.page_rank.total_cmp(&a.page_rank).then(ia.cmp(ib)));
        ranked.into_iter().take(k).map(|(ix, _)| ix).collect()
    }
}

/// PageRank and k-core parameters.
#[derive(Debug, Clone, Copy)]
pub struct NodeScorer {
    pub damping: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Weight edges by aggregate amount instead of counting distinct recipients.
    pub weighted: bool,
}

impl NodeScorer {
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            damping: config.pagerank_damping,
            max_iterations: config.pagerank_max_iterations,
            tolerance: config.pagerank_tolerance,
            weighted: config.pagerank_weighted,
        }
    }

    pub fn score(&self, graph: &TransferGraph) -> NodeScores {
        let (ranks, iterations, converged) = self.page_rank(graph);
        let cores = core_numbers(graph);
        tracing::debug!(nodes = graph.node_count(), iterations, converged, "scored nodes");
        NodeScores {
            scores: ranks
                .into_iter()
                .zip(cores)
                .map(|(page_rank, core_number)| NodeScore { page_rank, core_number })
                .collect(),
            iterations,
            converged,
        }
    }

    /// Damped power iteration. Nodes with no outgoing weight spread their
    /// mass uniformly so the total stays at one.
    fn page_rank(&self, graph: &TransferGraph) -> (Vec<f64>, usize, bool) {
        let n = graph.node_count();
        if n == 0 {
            return (Vec::new(), 0, true);
        }

        let out_links: Vec<Vec<(usize, f64)>> = graph
            .node_indices()
            .map(|ix| {
                graph
                    .successors(ix)
                    .into_iter()
                    .map(|(to, amount)| {
                        let w = if self.weighted { amount.micros() as f64 } else { 1.0 };
                        (to.index(), w)
                    })
                    .collect()
            })
            .collect();
        let out_weight: Vec<f64> = out_links.iter().map(|l| l.iter().map(|(_, w)| w).sum()).collect();

        let n_f = n as f64;
        let mut rank = vec![1.0 / n_f; n];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iterations {
            iterations += 1;
            let dangling: f64 = (0..n).filter(|&u| out_weight[u] <= 0.0).map(|u| rank[u]).sum();
            let base = (1.0 - self.damping) / n_f + self.damping * dangling / n_f;
            let mut next = vec![base; n];
            for (u, links) in out_links.iter().enumerate() {
                if out_weight[u] <= 0.0 {
                    continue;
                }
                let share = self.damping * rank[u] / out_weight[u];
                for &(v, w) in links {
                    next[v] += share * w;
                }
            }

            let delta = rank
                .iter()
                .zip(&next)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            rank = next;
            if delta < self.tolerance {
                converged = true;
                break;
            }
        }
        (rank, iterations, converged)
    }
}

/// Core number of every node on the undirected simple graph.
///
/// Peels nodes in rounds: at threshold `k`, every node whose remaining degree
/// is at most `k` is removed and assigned `k`; when none qualify, `k` grows.
pub fn core_numbers(graph: &TransferGraph) -> Vec<usize> {
    let n = graph.node_count();
    let neighbors: Vec<Vec<usize>> = graph
        .node_indices()
        .map(|ix| graph.undirected_neighbors(ix).into_iter().map(|v| v.index()).collect())
        .collect();
    let mut degree: Vec<usize> = neighbors.iter().map(Vec::len).collect();
    let mut removed = vec![false; n];
    let mut core = vec![0; n];
    let mut remaining = n;
    let mut k = 0;

    while remaining > 0 {
        let mut stack: Vec<usize> = (0..n).filter(|&v| !removed[v] && degree[v] <= k).collect();
        if stack.is_empty() {
            k += 1;
            continue;
        }
        while let Some(v) = stack.pop() {
            if removed[v] {
                continue;
            }
            removed[v] = true;
            core[v] = k;
            remaining -= 1;
            for &u in &neighbors[v] {
                if !removed[u] {
                    degree[u] -= 1;
                    if degree[u] <= k {
                        stack.push(u);
                    }
                }
            }
        }
    }
    core
}

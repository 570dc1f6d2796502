//! The working transfer multigraph.
//!
//! Nodes are Tron addresses, edges are individual USDT transfers. Parallel
//! edges are intentional: several payments between the same ordered pair
//! each stay a separate edge. Nodes are never removed once added, only
//! enriched as the run progresses.
//!
//! The graph is mutated only by [`crate::builder::GraphBuilder`] (and the
//! annotation setters the orchestrator calls between phases); every other
//! component reads it.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction as EdgeDirection;
use serde::Serialize;
use trace_data::{Address, Amount, BlacklistStatus, Transfer};

use crate::features::{AddressActivity, Classification};

/// Where a node stands in the expansion lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Discovered as a counterparty, history not fetched yet.
    Unexpanded,
    Expanded,
    /// Too highly connected to trace; kept as a waypoint, never expanded.
    Pruned,
    /// Known exchange; treated as a sink/source and never expanded.
    Exchange,
    /// History fetch failed.
    Failed,
}

/// Per-node attributes accumulated during a run.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub address: Address,
    pub state: NodeState,
    /// Distinct qualifying transfers observed touching this address, in any history fetched so far.
    pub observed_degree: usize,
    /// Exchange name, when the address is a registered exchange.
    pub exchange: Option<String>,
    pub blacklist: Option<BlacklistStatus>,
    pub classification: Option<Classification>,
    /// Activity over the full fetched history; `None` until expanded.
    pub activity: Option<AddressActivity>,
}

impl NodeInfo {
    fn new(address: Address) -> Self {
        Self {
            address,
            state: NodeState::Unexpanded,
            observed_degree: 0,
            exchange: None,
            blacklist: None,
            classification: None,
            activity: None,
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklist.is_some_and(BlacklistStatus::is_listed)
    }

    pub fn is_exchange(&self) -> bool {
        self.exchange.is_some()
    }
}

/// Identity of one transfer edge, for de-duplication across histories.
type EdgeKey = (String, NodeIndex, NodeIndex);

/// Directed transfer multigraph with address lookup.
#[derive(Debug, Clone, Default)]
pub struct TransferGraph {
    graph: DiGraph<NodeInfo, Transfer>,
    index: HashMap<Address, NodeIndex>,
    edges_seen: HashSet<EdgeKey>,
}

impl TransferGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph holding exactly `transfers`, without any budgets.
    ///
    /// Self-transfers are skipped. Every node is marked expanded.
    pub fn from_transfers<'a>(transfers: impl IntoIterator<Item = &'a Transfer>) -> Self {
        let mut graph = Self::new();
        for transfer in transfers {
            if !transfer.is_self_transfer() {
                graph.add_transfer(transfer.clone());
            }
        }
        for node in graph.graph.node_weights_mut() {
            node.state = NodeState::Expanded;
        }
        graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn index_of(&self, address: &Address) -> Option<NodeIndex> {
        self.index.get(address).copied()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    pub fn node(&self, ix: NodeIndex) -> &NodeInfo {
        &self.graph[ix]
    }

    pub fn node_by_address(&self, address: &Address) -> Option<&NodeInfo> {
        self.index_of(address).map(|ix| &self.graph[ix])
    }

    pub(crate) fn node_mut(&mut self, ix: NodeIndex) -> &mut NodeInfo {
        &mut self.graph[ix]
    }

    pub fn address(&self, ix: NodeIndex) -> &Address {
        &self.graph[ix].address
    }

    /// Node indices in insertion order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodeInfo)> + '_ {
        self.graph.node_indices().map(move |ix| (ix, &self.graph[ix]))
    }

    pub fn count_in_state(&self, state: NodeState) -> usize {
        self.graph.node_weights().filter(|n| n.state == state).count()
    }

    /// Returns the node for `address`, adding an unexpanded one if absent.
    pub(crate) fn ensure_node(&mut self, address: &Address) -> NodeIndex {
        if let Some(ix) = self.index.get(address) {
            return *ix;
        }
        let ix = self.graph.add_node(NodeInfo::new(address.clone()));
        self.index.insert(address.clone(), ix);
        ix
    }

    /// Adds `transfer` as a new edge. Returns `false` if the same transfer is
    /// already present.
    pub(crate) fn add_transfer(&mut self, transfer: Transfer) -> bool {
        let from = self.ensure_node(&transfer.from);
        let to = self.ensure_node(&transfer.to);
        if !self.edges_seen.insert((transfer.tx_id.clone(), from, to)) {
            return false;
        }
        self.graph.add_edge(from, to, transfer);
        true
    }

    pub(crate) fn has_transfer(&self, transfer: &Transfer) -> bool {
        match (self.index_of(&transfer.from), self.index_of(&transfer.to)) {
            (Some(from), Some(to)) => self.edges_seen.contains(&(transfer.tx_id.clone(), from, to)),
            _ => false,
        }
    }

    /// Edges touching `ix`, counting parallel edges.
    pub fn degree(&self, ix: NodeIndex) -> usize {
        self.graph.edges_directed(ix, EdgeDirection::Outgoing).count()
            + self.graph.edges_directed(ix, EdgeDirection::Incoming).count()
    }

    /// Recipients of `ix` with the aggregate amount sent to each, largest first.
    pub fn successors(&self, ix: NodeIndex) -> Vec<(NodeIndex, Amount)> {
        self.aggregate(ix, EdgeDirection::Outgoing)
    }

    /// Senders to `ix` with the aggregate amount received from each, largest first.
    pub fn predecessors(&self, ix: NodeIndex) -> Vec<(NodeIndex, Amount)> {
        self.aggregate(ix, EdgeDirection::Incoming)
    }

    fn aggregate(&self, ix: NodeIndex, dir: EdgeDirection) -> Vec<(NodeIndex, Amount)> {
        let mut totals: HashMap<NodeIndex, Amount> = HashMap::new();
        for edge in self.graph.edges_directed(ix, dir) {
            let other = match dir {
                EdgeDirection::Outgoing => edge.target(),
                EdgeDirection::Incoming => edge.source(),
            };
            let total = totals.entry(other).or_default();
            *total = *total + edge.weight().amount;
        }
        let mut out: Vec<_> = totals.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out
    }

    /// Distinct neighbors ignoring direction, excluding `ix` itself.
    pub fn undirected_neighbors(&self, ix: NodeIndex) -> BTreeSet<NodeIndex> {
        self.graph
            .neighbors_undirected(ix)
            .filter(|&n| n != ix)
            .collect()
    }

    /// All transfers `from -> to`, oldest first.
    pub fn transfers_between(&self, from: NodeIndex, to: NodeIndex) -> Vec<&Transfer> {
        let mut transfers: Vec<&Transfer> = self
            .graph
            .edges_directed(from, EdgeDirection::Outgoing)
            .filter(|e| e.target() == to)
            .map(|e| e.weight())
            .collect();
        transfers.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.tx_id.cmp(&b.tx_id)));
        transfers
    }

    /// All transfers touching `ix`, in either direction.
    pub fn transfers_of(&self, ix: NodeIndex) -> impl Iterator<Item = &Transfer> + '_ {
        self.graph
            .edges_directed(ix, EdgeDirection::Outgoing)
            .chain(self.graph.edges_directed(ix, EdgeDirection::Incoming))
            .map(|e| e.weight())
    }

    /// Activity of `ix`: its full fetched history when expanded, else the
    /// transfers the graph holds for it.
    pub fn activity(&self, ix: NodeIndex) -> AddressActivity {
        match &self.graph[ix].activity {
            Some(activity) => activity.clone(),
            None => AddressActivity::from_transfers(self.address(ix), self.transfers_of(ix)),
        }
    }

    pub fn set_blacklist(&mut self, ix: NodeIndex, status: BlacklistStatus) {
        self.graph[ix].blacklist = Some(status);
    }

    pub fn set_classification(&mut self, ix: NodeIndex, classification: Classification) {
        self.graph[ix].classification = Some(classification);
    }

    pub fn set_exchange(&mut self, ix: NodeIndex, name: impl Into<String>) {
        self.graph[ix].exchange = Some(name.into());
    }

    /// Read-only access for algorithms that walk petgraph directly.
    pub fn inner(&self) -> &DiGraph<NodeInfo, Transfer> {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn addr(n: u32) -> Address {
        Address::parse(&format!("T{n:0>33}")).unwrap()
    }

    fn transfer(id: &str, from: u32, to: u32, usdt: u64) -> Transfer {
        Transfer {
            tx_id: id.to_string(),
            from: addr(from),
            to: addr(to),
            amount: Amount::from_usdt(usdt),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn parallel_edges_are_kept() {
        let transfers = vec![transfer("a", 1, 2, 10), transfer("b", 1, 2, 20)];
        let g = TransferGraph::from_transfers(&transfers);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 2);
        let a = g.index_of(&addr(1)).unwrap();
        let b = g.index_of(&addr(2)).unwrap();
        assert_eq!(g.transfers_between(a, b).len(), 2);
        assert_eq!(g.successors(a), vec![(b, Amount::from_usdt(30))]);
        assert_eq!(g.degree(a), 2);
    }

    #[test]
    fn duplicate_transfer_is_ignored() {
        let mut g = TransferGraph::new();
        assert!(g.add_transfer(transfer("a", 1, 2, 10)));
        assert!(!g.add_transfer(transfer("a", 1, 2, 10)));
        assert!(g.has_transfer(&transfer("a", 1, 2, 10)));
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn neighbors_sorted_by_amount() {
        let transfers = vec![
            transfer("a", 1, 2, 10),
            transfer("b", 1, 3, 500),
            transfer("c", 1, 4, 50),
            transfer("d", 5, 1, 1),
        ];
        let g = TransferGraph::from_transfers(&transfers);
        let one = g.index_of(&addr(1)).unwrap();
        let order: Vec<_> = g.successors(one).into_iter().map(|(ix, _)| g.address(ix).clone()).collect();
        assert_eq!(order, vec![addr(3), addr(4), addr(2)]);
        assert_eq!(g.predecessors(one).len(), 1);
        assert_eq!(g.undirected_neighbors(one).len(), 4);
    }

    #[test]
    fn self_transfers_are_skipped() {
        let g = TransferGraph::from_transfers(&[transfer("s", 1, 1, 100)]);
        assert_eq!(g.node_count(), 0);
    }
}

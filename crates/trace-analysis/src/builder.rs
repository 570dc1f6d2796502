//! Budgeted, incremental graph construction.
//!
//! [`GraphBuilder`] owns the [`TransferGraph`] for the duration of a run and
//! is the only code path that mutates its structure. The path finder pulls
//! from it level by level via [`GraphBuilder::expand_batch`]: fetches for a
//! batch run concurrently (bounded by `fetch_concurrency`), results are
//! applied one at a time in batch order, so growth is deterministic for a
//! given ledger.
//!
//! Policies applied to each fetched history:
//! - transfers below `min_transaction_amount` and self-transfers are dropped
//!   before anything else sees them
//! - a node observed with more than `max_node_connections` transfers is
//!   marked [`NodeState::Pruned`] and contributes no edges
//! - counterparties are ranked by aggregate amount and truncated to
//!   `max_neighbors_to_expand`
//! - at most `max_connections_per_address` edges touch any node; excess
//!   transfers are dropped
//! - transfers directly between the two endpoints bypass both caps
//! - no node is added beyond `max_addresses_to_explore`
//! - known exchanges are flagged and never expanded

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tokio::time::Instant;
use trace_data::{Address, Amount, ClientError, Direction, ExchangeRegistry, LedgerClient, Transfer};

use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::features::AddressActivity;
use crate::graph::{NodeState, TransferGraph};

/// Size and health of the built graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatistics {
    /// Nodes in the graph.
    pub nodes_explored: usize,
    /// Nodes whose history was fetched.
    pub nodes_expanded: usize,
    pub edges_explored: usize,
    pub pruned_count: usize,
    pub exchange_count: usize,
    pub failed_count: usize,
    /// Transfers discarded by the per-node edge cap.
    pub dropped_transfers: usize,
    /// Counterparties discarded by the per-expansion neighbor cap.
    pub truncated_neighbors: usize,
}

/// What construction ran into, for the result's degradation list.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub statistics: GraphStatistics,
    /// Addresses whose history could not be fetched, in failure order.
    pub failed: Vec<Address>,
    pub address_budget_exhausted: bool,
}

/// Outcome of one [`GraphBuilder::expand_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub fetched: usize,
    pub deadline_hit: bool,
}

/// Unique identity of a transfer for observed-degree counting.
type TransferKey = (String, Address, Address);

pub struct GraphBuilder<'a, L: ?Sized> {
    ledger: &'a L,
    config: &'a TraceConfig,
    exchanges: &'a ExchangeRegistry,
    graph: TransferGraph,
    observed: HashMap<Address, HashSet<TransferKey>>,
    nodes_expanded: usize,
    dropped_transfers: usize,
    truncated_neighbors: usize,
    failed: Vec<Address>,
    budget_exhausted: bool,
    endpoints: Option<(Address, Address)>,
}

impl<'a, L: LedgerClient + ?Sized> GraphBuilder<'a, L> {
    pub fn new(ledger: &'a L, config: &'a TraceConfig, exchanges: &'a ExchangeRegistry) -> Self {
        Self {
            ledger,
            config,
            exchanges,
            graph: TransferGraph::new(),
            observed: HashMap::new(),
            nodes_expanded: 0,
            dropped_transfers: 0,
            truncated_neighbors: 0,
            failed: Vec::new(),
            budget_exhausted: false,
            endpoints: None,
        }
    }

    pub fn graph(&self) -> &TransferGraph {
        &self.graph
    }

    pub fn config(&self) -> &TraceConfig {
        self.config
    }

    pub fn address_budget_exhausted(&self) -> bool {
        self.budget_exhausted
    }

    /// Fetches and expands both endpoints.
    ///
    /// Endpoints are always expanded: they are never pruned or treated as
    /// exchange sinks. Fails with [`TraceError::NotFound`] when either has no
    /// history or cannot be fetched before `deadline`; the source is reported
    /// first.
    #[tracing::instrument(skip_all, fields(source = %source, target = %target))]
    pub async fn resolve_endpoints(
        &mut self,
        source: &Address,
        target: &Address,
        deadline: Instant,
    ) -> Result<(NodeIndex, NodeIndex), TraceError> {
        let cap = self.config.max_transactions_per_address;
        let (source_history, target_history) = futures::future::join(
            tokio::time::timeout_at(deadline, fetch_history(self.ledger, source, cap)),
            tokio::time::timeout_at(deadline, fetch_history(self.ledger, target, cap)),
        )
        .await;

        let source_history = endpoint_history(source, source_history)?;
        let target_history = endpoint_history(target, target_history)?;
        self.endpoints = Some((source.clone(), target.clone()));

        let source_ix = self.graph.ensure_node(source);
        let target_ix = self.graph.ensure_node(target);
        for ix in [source_ix, target_ix] {
            if let Some(name) = self.exchanges.name_of(self.graph.address(ix)) {
                self.graph.set_exchange(ix, name);
            }
        }

        self.apply_history(source_ix, source_history, true);
        self.apply_history(target_ix, target_history, true);
        tracing::info!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "endpoints resolved"
        );
        Ok((source_ix, target_ix))
    }

    /// Expands every unexpanded node in `nodes`.
    ///
    /// Nodes already expanded, pruned, failed or flagged as exchanges are
    /// skipped, so each node is fetched at most once per run. Fetch results
    /// that arrive after `deadline` are discarded and their nodes stay
    /// unexpanded.
    pub async fn expand_batch(&mut self, nodes: &[NodeIndex], deadline: Instant) -> BatchOutcome {
        let mut pending = Vec::new();
        let mut queued = HashSet::new();
        for &ix in nodes {
            if self.graph.node(ix).state != NodeState::Unexpanded || !queued.insert(ix) {
                continue;
            }
            if self.observed_degree(self.graph.address(ix)) > self.config.max_node_connections {
                self.prune(ix);
                continue;
            }
            pending.push((ix, self.graph.address(ix).clone()));
        }

        let mut outcome = BatchOutcome::default();
        if pending.is_empty() {
            return outcome;
        }

        let ledger = self.ledger;
        let cap = self.config.max_transactions_per_address;
        let fetches = stream::iter(pending.into_iter().map(|(ix, address)| async move {
            let result = fetch_history(ledger, &address, cap).await;
            (ix, address, result)
        }))
        .buffered(self.config.fetch_concurrency.max(1));
        let mut fetches = std::pin::pin!(fetches);

        loop {
            match tokio::time::timeout_at(deadline, fetches.next()).await {
                Ok(Some((ix, _, Ok(history)))) => {
                    outcome.fetched += 1;
                    self.apply_history(ix, history, false);
                }
                // No history at all: nothing to expand, but nothing missing either.
                Ok(Some((ix, _, Err(ClientError::NotFound(_))))) => {
                    outcome.fetched += 1;
                    self.apply_history(ix, Vec::new(), false);
                }
                Ok(Some((ix, address, Err(e)))) => {
                    tracing::warn!(address = %address, error = %e, "expansion failed, continuing with partial data");
                    self.graph.node_mut(ix).state = NodeState::Failed;
                    self.failed.push(address);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("deadline reached during expansion");
                    outcome.deadline_hit = true;
                    break;
                }
            }
        }
        outcome
    }

    /// Consumes the builder, returning the finished graph and its report.
    pub fn finish(self) -> (TransferGraph, BuildReport) {
        let statistics = GraphStatistics {
            nodes_explored: self.graph.node_count(),
            nodes_expanded: self.nodes_expanded,
            edges_explored: self.graph.edge_count(),
            pruned_count: self.graph.count_in_state(NodeState::Pruned),
            exchange_count: self.graph.nodes().filter(|(_, n)| n.is_exchange()).count(),
            failed_count: self.failed.len(),
            dropped_transfers: self.dropped_transfers,
            truncated_neighbors: self.truncated_neighbors,
        };
        let report = BuildReport {
            statistics,
            failed: self.failed,
            address_budget_exhausted: self.budget_exhausted,
        };
        (self.graph, report)
    }

    fn observed_degree(&self, address: &Address) -> usize {
        self.observed.get(address).map_or(0, HashSet::len)
    }

    fn prune(&mut self, ix: NodeIndex) {
        let node = self.graph.node_mut(ix);
        if node.state == NodeState::Unexpanded {
            node.state = NodeState::Pruned;
            tracing::debug!(address = %node.address, observed = node.observed_degree, "pruned high-connectivity node");
        }
    }

    /// The single mutation path for a fetched history.
    fn apply_history(&mut self, ix: NodeIndex, history: Vec<Transfer>, is_endpoint: bool) {
        self.nodes_expanded += 1;
        let address = self.graph.address(ix).clone();
        let min_amount = self.config.min_transaction_amount;
        let history: Vec<Transfer> = history
            .into_iter()
            .filter(|t| t.amount >= min_amount && !t.is_self_transfer() && t.counterparty(&address).is_some())
            .collect();

        self.graph.node_mut(ix).activity = Some(AddressActivity::from_transfers(&address, &history));
        for transfer in &history {
            self.observe(transfer);
        }
        self.refresh_observed_degrees(&history);

        if !is_endpoint && self.observed_degree(&address) > self.config.max_node_connections {
            self.prune(ix);
            return;
        }
        self.graph.node_mut(ix).state = NodeState::Expanded;

        // Counterparties ranked by aggregate amount, ties by address.
        let mut by_counterparty: HashMap<&Address, (Amount, Vec<&Transfer>)> = HashMap::new();
        for transfer in &history {
            if let Some(other) = transfer.counterparty(&address) {
                let entry = by_counterparty.entry(other).or_default();
                entry.0 = entry.0 + transfer.amount;
                entry.1.push(transfer);
            }
        }
        let (pinned, mut ranked): (Vec<_>, Vec<_>) = by_counterparty
            .into_iter()
            .partition(|(other, _)| self.links_endpoints(&address, other));
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));
        if ranked.len() > self.config.max_neighbors_to_expand {
            self.truncated_neighbors += ranked.len() - self.config.max_neighbors_to_expand;
            ranked.truncate(self.config.max_neighbors_to_expand);
        }

        let pinned = pinned.into_iter().map(|entry| (true, entry));
        let ranked = ranked.into_iter().map(|entry| (false, entry));
        for (is_pinned, (counterparty, (_, transfers))) in pinned.chain(ranked) {
            let Some(other_ix) = self.admit(counterparty) else {
                continue;
            };
            for transfer in transfers {
                if self.graph.has_transfer(transfer) {
                    continue;
                }
                let cap = self.config.max_connections_per_address;
                if !is_pinned && (self.graph.degree(ix) >= cap || self.graph.degree(other_ix) >= cap) {
                    self.dropped_transfers += 1;
                    continue;
                }
                self.graph.add_transfer(transfer.clone());
            }
        }
    }

    fn links_endpoints(&self, a: &Address, b: &Address) -> bool {
        self.endpoints
            .as_ref()
            .is_some_and(|(source, target)| (a == source && b == target) || (a == target && b == source))
    }

    /// Returns the node for `address`, adding it if the address budget allows.
    fn admit(&mut self, address: &Address) -> Option<NodeIndex> {
        if let Some(ix) = self.graph.index_of(address) {
            return Some(ix);
        }
        if self.graph.node_count() >= self.config.max_addresses_to_explore {
            if !self.budget_exhausted {
                tracing::info!(limit = self.config.max_addresses_to_explore, "address budget exhausted");
            }
            self.budget_exhausted = true;
            return None;
        }

        let ix = self.graph.ensure_node(address);
        self.graph.node_mut(ix).observed_degree = self.observed_degree(address);
        if let Some(name) = self.exchanges.name_of(address) {
            self.graph.set_exchange(ix, name);
            self.graph.node_mut(ix).state = NodeState::Exchange;
        } else if self.observed_degree(address) > self.config.max_node_connections {
            self.prune(ix);
        }
        Some(ix)
    }

    fn observe(&mut self, transfer: &Transfer) {
        let key = (transfer.tx_id.clone(), transfer.from.clone(), transfer.to.clone());
        for side in [&transfer.from, &transfer.to] {
            self.observed.entry(side.clone()).or_default().insert(key.clone());
        }
    }

    /// Copies observed degrees onto graph nodes touched by `history`, pruning
    /// unexpanded ones that crossed the threshold.
    fn refresh_observed_degrees(&mut self, history: &[Transfer]) {
        let touched: HashSet<&Address> = history.iter().flat_map(|t| [&t.from, &t.to]).collect();
        for address in touched {
            if let Some(ix) = self.graph.index_of(address) {
                let degree = self.observed_degree(address);
                self.graph.node_mut(ix).observed_degree = degree;
                if degree > self.config.max_node_connections {
                    self.prune(ix);
                }
            }
        }
    }
}

/// Pages through `address`'s history until `cap` transfers or the last page.
pub async fn fetch_history<L: LedgerClient + ?Sized>(
    ledger: &L,
    address: &Address,
    cap: usize,
) -> Result<Vec<Transfer>, ClientError> {
    let mut transfers = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = ledger
            .fetch_transfers(address, Direction::Both, cursor.as_deref())
            .await?;
        let empty = page.transfers.is_empty();
        transfers.extend(page.transfers);
        match page.next_cursor {
            Some(next) if !empty && transfers.len() < cap => cursor = Some(next),
            _ => break,
        }
    }
    transfers.truncate(cap);
    tracing::debug!(address = %address, transfers = transfers.len(), "fetched history");
    Ok(transfers)
}

fn endpoint_history(
    address: &Address,
    history: Result<Result<Vec<Transfer>, ClientError>, tokio::time::error::Elapsed>,
) -> Result<Vec<Transfer>, TraceError> {
    let reason = match history {
        Ok(Ok(transfers)) if !transfers.is_empty() => return Ok(transfers),
        Ok(Ok(_)) => "no transfer history".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "deadline exceeded while resolving endpoint".to_string(),
    };
    Err(TraceError::NotFound {
        address: address.clone(),
        reason,
    })
}

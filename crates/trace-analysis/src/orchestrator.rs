//! One analysis run, end to end.
//!
//! [`Analyzer`] sequences the components and owns no algorithmic logic of
//! its own: resolve the endpoints, search while growing the graph, score
//! nodes, annotate path and key nodes (classification, blacklist), detect
//! communities, assess every path. The run deadline covers all of it; once
//! it passes, the run returns what it has, tagged as degraded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tokio::time::Instant;
use trace_data::{Address, BlacklistClient, BlacklistStatus, ExchangeRegistry, LedgerClient, RiskRegistry};

use crate::builder::{GraphBuilder, GraphStatistics};
use crate::community::{Community, CommunityDetector};
use crate::config::{TraceConfig, MAX_HOPS, MIN_HOPS};
use crate::error::{Budget, Degradation, TraceError};
use crate::features::{Classification, Classifier, HeuristicClassifier};
use crate::graph::TransferGraph;
use crate::node_scorer::NodeScorer;
use crate::path_finder::{search, Path, Termination};
use crate::progress::{Phase, ProgressReporter};
use crate::risk::{RiskAssessment, RiskContext, RiskScorer};

/// A validated analysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub source: Address,
    pub target: Address,
    pub max_hops: usize,
}

impl AnalysisRequest {
    /// Parses both addresses and checks the hop range. Nothing is fetched.
    pub fn new(source: &str, target: &str, max_hops: usize) -> Result<Self, TraceError> {
        let request = Self {
            source: Address::parse(source)?,
            target: Address::parse(target)?,
            max_hops,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if !(MIN_HOPS..=MAX_HOPS).contains(&self.max_hops) {
            return Err(TraceError::InvalidRequest(format!(
                "max_hops must be between {MIN_HOPS} and {MAX_HOPS}, got {}",
                self.max_hops
            )));
        }
        if self.source == self.target {
            return Err(TraceError::InvalidRequest(
                "source and target must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedPath {
    #[serde(flatten)]
    pub path: Path,
    pub risk: RiskAssessment,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeReport {
    pub page_rank: f64,
    pub core_number: usize,
    pub community_id: Option<usize>,
}

/// A high-PageRank node with its annotations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyAddress {
    pub address: Address,
    pub page_rank: f64,
    pub classification: Option<Classification>,
    pub blacklist: Option<BlacklistStatus>,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub source: Address,
    pub target: Address,
    pub max_hops: usize,
    /// Fewest hops first, then larger total amount, then discovery order.
    pub paths: Vec<AnalyzedPath>,
    pub graph_statistics: GraphStatistics,
    pub node_scores: BTreeMap<Address, NodeReport>,
    pub communities: Vec<Community>,
    pub key_addresses: Vec<KeyAddress>,
    pub termination: Termination,
    /// Empty when the run completed within every budget.
    pub degradations: Vec<Degradation>,
    pub partial: bool,
    pub elapsed_ms: u64,
}

impl AnalysisResult {
    pub fn is_complete(&self) -> bool {
        self.degradations.is_empty()
    }
}

/// Runs analyses against a ledger and blacklist.
pub struct Analyzer {
    ledger: Arc<dyn LedgerClient>,
    blacklist: Arc<dyn BlacklistClient>,
    classifier: Arc<dyn Classifier>,
    config: TraceConfig,
    exchanges: ExchangeRegistry,
    registry: RiskRegistry,
}

impl Analyzer {
    pub fn new(ledger: Arc<dyn LedgerClient>, blacklist: Arc<dyn BlacklistClient>, config: TraceConfig) -> Self {
        Self {
            ledger,
            blacklist,
            classifier: Arc::new(HeuristicClassifier),
            config,
            exchanges: ExchangeRegistry::new(),
            registry: RiskRegistry::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_exchanges(mut self, exchanges: ExchangeRegistry) -> Self {
        self.exchanges = exchanges;
        self
    }

    pub fn with_registry(mut self, registry: RiskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Runs one analysis.
    ///
    /// Fails only on an invalid request or configuration, or when an endpoint
    /// cannot be resolved. Everything else degrades the result.
    #[tracing::instrument(skip_all, fields(source = %request.source, target = %request.target, max_hops = request.max_hops))]
    pub async fn run(
        &self,
        request: &AnalysisRequest,
        progress: &mut ProgressReporter,
    ) -> Result<AnalysisResult, TraceError> {
        request.validate()?;
        self.config.validate()?;
        let started = Instant::now();
        let deadline = started + self.config.deadline_for(request.max_hops);

        let mut builder = GraphBuilder::new(self.ledger.as_ref(), &self.config, &self.exchanges);
        let (source, target) = builder
            .resolve_endpoints(&request.source, &request.target, deadline)
            .await?;
        progress.report(Phase::Resolving, builder.graph().node_count(), 0, 0);

        let outcome = search(&mut builder, source, target, request.max_hops, deadline, progress).await;
        let (mut graph, report) = builder.finish();

        let scores = NodeScorer::new(&self.config).score(&graph);
        progress.report(
            Phase::Scoring,
            graph.node_count(),
            outcome.depth_reached,
            outcome.paths.len(),
        );

        let key_nodes = scores.top_by_page_rank(self.config.key_address_count);
        let mut to_annotate: BTreeSet<NodeIndex> = key_nodes.iter().copied().collect();
        for path in &outcome.paths {
            to_annotate.extend(path.addresses.iter().filter_map(|a| graph.index_of(a)));
        }
        let annotation_cut = self.annotate(&mut graph, &to_annotate, deadline).await;

        let communities = CommunityDetector::new(self.config.label_propagation_max_iterations).detect(&graph);
        let scorer = RiskScorer::new(&self.config);
        let ctx = RiskContext {
            graph: &graph,
            communities: &communities,
            registry: &self.registry,
        };
        let paths: Vec<AnalyzedPath> = outcome
            .paths
            .into_iter()
            .map(|path| {
                let risk = scorer.assess(&path, &ctx);
                AnalyzedPath { path, risk }
            })
            .collect();
        progress.report(Phase::Assessing, graph.node_count(), outcome.depth_reached, paths.len());

        let node_scores = scores
            .iter()
            .map(|(ix, s)| {
                (
                    graph.address(ix).clone(),
                    NodeReport {
                        page_rank: s.page_rank,
                        core_number: s.core_number,
                        community_id: communities.id_of(ix),
                    },
                )
            })
            .collect();
        let key_addresses = key_nodes
            .iter()
            .map(|&ix| {
                let node = graph.node(ix);
                KeyAddress {
                    address: node.address.clone(),
                    page_rank: scores.get(ix).map_or(0.0, |s| s.page_rank),
                    classification: node.classification,
                    blacklist: node.blacklist,
                    exchange: node.exchange.clone(),
                }
            })
            .collect();

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut degradations = Vec::new();
        if !report.failed.is_empty() {
            degradations.push(Degradation::PartialData {
                failed: report.failed.clone(),
            });
        }
        if report.address_budget_exhausted {
            degradations.push(Degradation::BudgetExhausted {
                budget: Budget::Addresses,
                limit: self.config.max_addresses_to_explore,
            });
        }
        if report.statistics.truncated_neighbors > 0 {
            degradations.push(Degradation::BudgetExhausted {
                budget: Budget::Neighbors,
                limit: self.config.max_neighbors_to_expand,
            });
        }
        if report.statistics.dropped_transfers > 0 {
            degradations.push(Degradation::BudgetExhausted {
                budget: Budget::Connections,
                limit: self.config.max_connections_per_address,
            });
        }
        if outcome.termination == Termination::PathLimit || outcome.paths_dropped > 0 {
            degradations.push(Degradation::BudgetExhausted {
                budget: Budget::Paths,
                limit: self.config.max_paths,
            });
        }
        if outcome.termination == Termination::Deadline || annotation_cut {
            degradations.push(Degradation::DeadlineExceeded { after_ms: elapsed_ms });
        }

        let partial = !degradations.is_empty();
        progress.report(Phase::Finished, graph.node_count(), outcome.depth_reached, paths.len());
        tracing::info!(
            paths = paths.len(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            partial,
            elapsed_ms,
            "analysis complete"
        );

        Ok(AnalysisResult {
            source: request.source.clone(),
            target: request.target.clone(),
            max_hops: request.max_hops,
            paths,
            graph_statistics: report.statistics,
            node_scores,
            communities: communities.communities,
            key_addresses,
            termination: outcome.termination,
            degradations,
            partial,
            elapsed_ms,
        })
    }

    /// Classifies `nodes` and checks them against the blacklist. Lookups run
    /// concurrently up to `fetch_concurrency` and are applied as they arrive.
    /// Returns true when the deadline cut the blacklist checks short;
    /// unchecked nodes keep no status.
    async fn annotate(&self, graph: &mut TransferGraph, nodes: &BTreeSet<NodeIndex>, deadline: Instant) -> bool {
        for &ix in nodes {
            let classification = self.classifier.classify(graph.address(ix), &graph.activity(ix));
            graph.set_classification(ix, classification);
        }

        let targets: Vec<(NodeIndex, Address)> = nodes.iter().map(|&ix| (ix, graph.address(ix).clone())).collect();
        let blacklist = self.blacklist.as_ref();
        let lookups = stream::iter(targets.into_iter().map(|(ix, address)| async move {
            (ix, blacklist.status(&address).await)
        }))
        .buffer_unordered(self.config.fetch_concurrency.max(1));
        let mut lookups = std::pin::pin!(lookups);

        let (mut checked, mut listed) = (0usize, 0usize);
        loop {
            match tokio::time::timeout_at(deadline, lookups.next()).await {
                Ok(Some((ix, status))) => {
                    checked += 1;
                    listed += usize::from(status.is_listed());
                    graph.set_blacklist(ix, status);
                }
                Ok(None) => {
                    tracing::debug!(checked, listed, "blacklist checks complete");
                    return false;
                }
                Err(_) => {
                    tracing::warn!(
                        checked,
                        pending = nodes.len() - checked,
                        "deadline reached before blacklist checks finished"
                    );
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use trace_data::{Amount, ClientError, MemoryBlacklist, MemoryLedger, Transfer};

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

    fn analyzer(ledger: MemoryLedger, listed: &[Address]) -> Analyzer {
        Analyzer::new(
            Arc::new(ledger),
            Arc::new(MemoryBlacklist::new(listed.iter().cloned())),
            TraceConfig::default(),
        )
    }

    #[test]
    fn request_validation() {
        let (a, b) = (addr(1).to_string(), addr(2).to_string());
        assert!(AnalysisRequest::new(&a, &b, 3).is_ok());
        assert!(matches!(
            AnalysisRequest::new("Xnot-an-address", &b, 3),
            Err(TraceError::InvalidAddress(_))
        ));
        assert!(matches!(AnalysisRequest::new(&a, &b, 0), Err(TraceError::InvalidRequest(_))));
        assert!(matches!(AnalysisRequest::new(&a, &b, 6), Err(TraceError::InvalidRequest(_))));
        assert!(matches!(AnalysisRequest::new(&a, &a, 2), Err(TraceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn two_hop_path_with_progress_feed() {
        let ledger = MemoryLedger::from_transfers([transfer("a", 1, 3, 500), transfer("b", 3, 2, 400)]);
        let request = AnalysisRequest::new(&addr(1).to_string(), &addr(2).to_string(), 2).unwrap();
        let (mut progress, mut rx) = ProgressReporter::channel(64);

        let result = analyzer(ledger, &[]).run(&request, &mut progress).await.unwrap();

        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.paths[0].path.addresses, vec![addr(1), addr(3), addr(2)]);
        assert!(!result.partial);
        assert_eq!(result.node_scores.len(), 3);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(events.last().map(|e| e.phase), Some(Phase::Finished));
    }

    #[tokio::test]
    async fn blacklisted_intermediary_is_annotated_and_scored() {
        let ledger = MemoryLedger::from_transfers([transfer("a", 1, 3, 500), transfer("b", 3, 2, 400)]);
        let request = AnalysisRequest::new(&addr(1).to_string(), &addr(2).to_string(), 2).unwrap();

        let result = analyzer(ledger, &[addr(3)])
            .run(&request, &mut ProgressReporter::disabled())
            .await
            .unwrap();

        let risk = &result.paths[0].risk;
        assert!(risk.score >= 50.0);
        assert!(risk.unverified.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_endpoint_is_fatal() {
        let ledger = MemoryLedger::from_transfers([transfer("a", 1, 3, 500)]);
        let request = AnalysisRequest::new(&addr(1).to_string(), &addr(2).to_string(), 2).unwrap();
        let err = analyzer(ledger, &[])
            .run(&request, &mut ProgressReporter::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failed_intermediary_marks_result_partial() {
        let ledger = MemoryLedger::from_transfers([
            transfer("a", 1, 3, 500),
            transfer("b", 3, 4, 400),
            transfer("c", 9, 2, 400),
        ])
        .fail_with(addr(3), ClientError::Unavailable("boom".to_string()));
        let request = AnalysisRequest::new(&addr(1).to_string(), &addr(2).to_string(), 3).unwrap();

        let result = analyzer(ledger, &[])
            .run(&request, &mut ProgressReporter::disabled())
            .await
            .unwrap();

        assert!(result.paths.is_empty());
        assert!(result.partial);
        assert!(result
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::PartialData { failed } if failed == &vec![addr(3)])));
    }
}

//! Analysis configuration.
//!
//! One immutable [`TraceConfig`] is built by the caller and passed by
//! reference into every component. Nothing in this crate reads ambient state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use trace_data::Amount;

use crate::error::TraceError;

/// Inclusive hop-count range accepted by an analysis request.
pub const MIN_HOPS: usize = 1;
pub const MAX_HOPS: usize = 5;

/// Budgets, thresholds and algorithm parameters for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Hard cap on graph nodes.
    pub max_addresses_to_explore: usize,
    /// Cap on edges touching any single node; excess transfers are dropped.
    pub max_connections_per_address: usize,
    /// Counterparties kept per expansion, largest amount first.
    pub max_neighbors_to_expand: usize,
    /// History fetched per node.
    pub max_transactions_per_address: usize,
    /// Transfers below this amount are invisible to the graph.
    pub min_transaction_amount: Amount,
    /// Nodes observed with more transfers than this are pruned.
    pub max_node_connections: usize,
    pub max_paths: usize,
    /// In-flight ledger fetches.
    pub fetch_concurrency: usize,
    /// Run deadline is this times the requested hop count.
    pub deadline_per_hop_secs: u64,

    pub pagerank_damping: f64,
    pub pagerank_max_iterations: usize,
    pub pagerank_tolerance: f64,
    /// Weight PageRank edges by aggregate transferred amount.
    pub pagerank_weighted: bool,

    pub label_propagation_max_iterations: usize,
    /// Top PageRank nodes classified and blacklist-checked besides path nodes.
    pub key_address_count: usize,

    pub risk: RiskWeights,
    pub thresholds: RiskThresholds,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_addresses_to_explore: 200,
            max_connections_per_address: 30,
            max_neighbors_to_expand: 30,
            max_transactions_per_address: 200,
            min_transaction_amount: Amount::from_usdt(10),
            max_node_connections: 500,
            max_paths: 20,
            fetch_concurrency: 4,
            deadline_per_hop_secs: 60,
            pagerank_damping: 0.85,
            pagerank_max_iterations: 100,
            pagerank_tolerance: 1e-9,
            pagerank_weighted: true,
            label_propagation_max_iterations: 20,
            key_address_count: 15,
            risk: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

impl TraceConfig {
    /// Wall-clock budget for a run of `max_hops` hops.
    pub fn deadline_for(&self, max_hops: usize) -> Duration {
        Duration::from_secs(self.deadline_per_hop_secs.saturating_mul(max_hops as u64))
    }

    /// Rejects configurations under which no run could make progress.
    pub fn validate(&self) -> Result<(), TraceError> {
        let zero_budgets = [
            ("max_addresses_to_explore", self.max_addresses_to_explore),
            ("max_connections_per_address", self.max_connections_per_address),
            ("max_neighbors_to_expand", self.max_neighbors_to_expand),
            ("max_transactions_per_address", self.max_transactions_per_address),
            ("max_paths", self.max_paths),
            ("fetch_concurrency", self.fetch_concurrency),
        ];
        if let Some((name, _)) = zero_budgets.iter().find(|(_, v)| *v == 0) {
            return Err(TraceError::InvalidRequest(format!("{name} must be positive")));
        }
        if self.max_addresses_to_explore < 2 {
            return Err(TraceError::InvalidRequest(
                "max_addresses_to_explore must hold both endpoints".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.pagerank_damping) {
            return Err(TraceError::InvalidRequest(format!(
                "pagerank_damping must be in [0, 1), got {}",
                self.pagerank_damping
            )));
        }
        Ok(())
    }
}

/// Maximum points each risk factor can award.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub blacklist: f64,
    pub sanctions: f64,
    pub mixer: f64,
    pub known_scam: f64,
    pub unregulated_exchange: f64,
    pub velocity_anomaly: f64,
    pub structuring: f64,
    pub blacklist_proximity: f64,
    pub high_connectivity: f64,
    pub path_complexity: f64,
    pub volume_anomaly: f64,
    pub timing_anomaly: f64,
    pub exchange_presence: f64,
    pub community_risk: f64,
    pub hot_wallet: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            blacklist: 50.0,
            sanctions: 45.0,
            mixer: 40.0,
            known_scam: 35.0,
            unregulated_exchange: 30.0,
            velocity_anomaly: 25.0,
            structuring: 22.0,
            blacklist_proximity: 20.0,
            high_connectivity: 18.0,
            path_complexity: 15.0,
            volume_anomaly: 12.0,
            timing_anomaly: 10.0,
            exchange_presence: 8.0,
            community_risk: 7.0,
            hot_wallet: 5.0,
        }
    }
}

/// Level cut-offs and factor trigger points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low_medium: f64,

    /// Sliding window for the velocity factor.
    pub velocity_window_secs: i64,
    /// Transfers within one window that trigger the velocity factor.
    pub velocity_trigger: usize,
    /// Transfers within one window that award the full velocity cap.
    pub velocity_saturation: usize,

    /// Just-under-threshold bands, in whole USDT, as `[low, high)` pairs.
    pub structuring_bands: Vec<(u64, u64)>,
    pub structuring_min_count: usize,

    pub complexity_min_hops: usize,

    /// Largest single transfer, in whole USDT, that triggers the volume factor.
    pub volume_trigger_usdt: u64,
    pub volume_saturation_usdt: u64,

    /// An intermediary forwarding funds faster than this is a rapid pass-through.
    pub rapid_pass_through_secs: i64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 70.0,
            high: 50.0,
            medium: 30.0,
            low_medium: 15.0,
            velocity_window_secs: 3600,
            velocity_trigger: 10,
            velocity_saturation: 60,
            structuring_bands: vec![(9_000, 10_000), (90_000, 100_000)],
            structuring_min_count: 3,
            complexity_min_hops: 4,
            volume_trigger_usdt: 100_000,
            volume_saturation_usdt: 1_000_000,
            rapid_pass_through_secs: 600,
        }
    }
}

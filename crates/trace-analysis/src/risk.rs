//! Per-path composite risk scoring.
//!
//! A fixed, ordered list of independent factors is evaluated against a path
//! and the annotated graph. Most factors are binary and award their full cap
//! when triggered. Velocity, volume and timing scale: half the cap at the
//! trigger point, rising linearly to the full cap at saturation. The total is
//! clamped to `[0, 100]` and every fired factor keeps its evidence.

use std::collections::HashSet;

use serde::Serialize;
use trace_data::registry::is_mixer_name;
use trace_data::{Address, Amount, BlacklistStatus, RiskRegistry, Transfer};

use crate::community::{CommunityIndex, CommunityRisk};
use crate::config::{RiskThresholds, RiskWeights, TraceConfig};
use crate::features::WalletLabel;
use crate::graph::{NodeInfo, NodeState, TransferGraph};
use crate::path_finder::Path;

/// Risk factors in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    Blacklist,
    Sanctions,
    Mixer,
    KnownScam,
    UnregulatedExchange,
    VelocityAnomaly,
    Structuring,
    BlacklistProximity,
    HighConnectivity,
    PathComplexity,
    VolumeAnomaly,
    TimingAnomaly,
    ExchangePresence,
    CommunityRisk,
    HotWallet,
}

impl RiskFactor {
    pub const ALL: [RiskFactor; 15] = [
        RiskFactor::Blacklist,
        RiskFactor::Sanctions,
        RiskFactor::Mixer,
        RiskFactor::KnownScam,
        RiskFactor::UnregulatedExchange,
        RiskFactor::VelocityAnomaly,
        RiskFactor::Structuring,
        RiskFactor::BlacklistProximity,
        RiskFactor::HighConnectivity,
        RiskFactor::PathComplexity,
        RiskFactor::VolumeAnomaly,
        RiskFactor::TimingAnomaly,
        RiskFactor::ExchangePresence,
        RiskFactor::CommunityRisk,
        RiskFactor::HotWallet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RiskFactor::Blacklist => "blacklist",
            RiskFactor::Sanctions => "sanctions",
            RiskFactor::Mixer => "mixer",
            RiskFactor::KnownScam => "known_scam",
            RiskFactor::UnregulatedExchange => "unregulated_exchange",
            RiskFactor::VelocityAnomaly => "velocity_anomaly",
            RiskFactor::Structuring => "structuring",
            RiskFactor::BlacklistProximity => "blacklist_proximity",
            RiskFactor::HighConnectivity => "high_connectivity",
            RiskFactor::PathComplexity => "path_complexity",
            RiskFactor::VolumeAnomaly => "volume_anomaly",
            RiskFactor::TimingAnomaly => "timing_anomaly",
            RiskFactor::ExchangePresence => "exchange_presence",
            RiskFactor::CommunityRisk => "community_risk",
            RiskFactor::HotWallet => "hot_wallet",
        }
    }

    pub fn cap(self, weights: &RiskWeights) -> f64 {
        match self {
            RiskFactor::Blacklist => weights.blacklist,
            RiskFactor::Sanctions => weights.sanctions,
            RiskFactor::Mixer => weights.mixer,
            RiskFactor::KnownScam => weights.known_scam,
            RiskFactor::UnregulatedExchange => weights.unregulated_exchange,
            RiskFactor::VelocityAnomaly => weights.velocity_anomaly,
            RiskFactor::Structuring => weights.structuring,
            RiskFactor::BlacklistProximity => weights.blacklist_proximity,
            RiskFactor::HighConnectivity => weights.high_connectivity,
            RiskFactor::PathComplexity => weights.path_complexity,
            RiskFactor::VolumeAnomaly => weights.volume_anomaly,
            RiskFactor::TimingAnomaly => weights.timing_anomaly,
            RiskFactor::ExchangePresence => weights.exchange_presence,
            RiskFactor::CommunityRisk => weights.community_risk,
            RiskFactor::HotWallet => weights.hot_wallet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    LowMedium,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.critical {
            RiskLevel::Critical
        } else if score >= thresholds.high {
            RiskLevel::High
        } else if score >= thresholds.medium {
            RiskLevel::Medium
        } else if score >= thresholds.low_medium {
            RiskLevel::LowMedium
        } else {
            RiskLevel::Low
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            RiskLevel::Critical => {
                "CRITICAL RISK: do not proceed. Addresses on this path are blacklisted or show severe risk indicators."
            }
            RiskLevel::High => {
                "HIGH RISK: additional due diligence is strongly recommended before proceeding. Multiple risk factors detected."
            }
            RiskLevel::Medium => {
                "MEDIUM RISK: proceed with caution and review the transfer details carefully."
            }
            RiskLevel::LowMedium => "LOW-MEDIUM RISK: generally safe, but monitor for unusual patterns.",
            RiskLevel::Low => "LOW RISK: the path appears low risk. Standard monitoring recommended.",
        }
    }
}

/// One factor that fired, with what triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiredFactor {
    #[serde(rename = "name")]
    pub factor: RiskFactor,
    pub points: f64,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// In `[0, 100]`, two decimals.
    pub score: f64,
    pub level: RiskLevel,
    /// In evaluation order.
    pub factors: Vec<FiredFactor>,
    pub recommendation: String,
    /// Path addresses whose blacklist status could not be confirmed.
    pub unverified: Vec<Address>,
}

impl RiskAssessment {
    pub fn factor(&self, factor: RiskFactor) -> Option<&FiredFactor> {
        self.factors.iter().find(|f| f.factor == factor)
    }
}

/// Everything a path is judged against.
#[derive(Clone, Copy)]
pub struct RiskContext<'a> {
    pub graph: &'a TransferGraph,
    pub communities: &'a CommunityIndex,
    pub registry: &'a RiskRegistry,
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    weights: RiskWeights,
    thresholds: RiskThresholds,
    max_node_connections: usize,
}

/// `cap` at half strength when `value` reaches `trigger`, full at `saturation`.
fn scaled(cap: f64, value: f64, trigger: f64, saturation: f64) -> f64 {
    if value < trigger {
        return 0.0;
    }
    if saturation <= trigger {
        return cap;
    }
    let fraction = ((value - trigger) / (saturation - trigger)).clamp(0.0, 1.0);
    cap * (0.5 + 0.5 * fraction)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

impl RiskScorer {
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            weights: config.risk.clone(),
            thresholds: config.thresholds.clone(),
            max_node_connections: config.max_node_connections,
        }
    }

    pub fn assess(&self, path: &Path, ctx: &RiskContext<'_>) -> RiskAssessment {
        let mut factors = Vec::new();
        for factor in RiskFactor::ALL {
            let cap = factor.cap(&self.weights);
            if cap <= 0.0 {
                continue;
            }
            if let Some((points, evidence)) = self.evaluate(factor, cap, path, ctx) {
                if points > 0.0 {
                    factors.push(FiredFactor {
                        factor,
                        points: round2(points.min(cap)),
                        evidence,
                    });
                }
            }
        }

        let total: f64 = factors.iter().map(|f| f.points).sum();
        let score = round2(total.clamp(0.0, 100.0));
        let level = RiskLevel::from_score(score, &self.thresholds);
        let unverified = path
            .addresses
            .iter()
            .filter(|a| {
                !matches!(
                    ctx.graph.node_by_address(a).and_then(|n| n.blacklist),
                    Some(BlacklistStatus::Listed | BlacklistStatus::Clear)
                )
            })
            .cloned()
            .collect();

        RiskAssessment {
            score,
            level,
            factors,
            recommendation: level.recommendation().to_string(),
            unverified,
        }
    }

    fn evaluate(&self, factor: RiskFactor, cap: f64, path: &Path, ctx: &RiskContext<'_>) -> Option<(f64, Vec<String>)> {
        let t = &self.thresholds;
        match factor {
            RiskFactor::Blacklist => full(cap, flagged(path, ctx, |a, n| {
                n.filter(|n| n.is_blacklisted()).map(|_| format!("{} is blacklisted", a.short()))
            })),
            RiskFactor::Sanctions => full(cap, flagged(path, ctx, |a, _| {
                ctx.registry.is_sanctioned(a).then(|| format!("{} is on a sanctions list", a.short()))
            })),
            RiskFactor::Mixer => full(cap, flagged(path, ctx, |a, n| mixer_evidence(ctx.registry, a, n))),
            RiskFactor::KnownScam => full(cap, flagged(path, ctx, |a, _| {
                ctx.registry.is_scam(a).then(|| format!("{} is a known scam address", a.short()))
            })),
            RiskFactor::UnregulatedExchange => full(cap, flagged(path, ctx, |a, _| {
                ctx.registry
                    .is_unregulated_exchange(a)
                    .then(|| format!("{} is an unregulated exchange", a.short()))
            })),
            RiskFactor::VelocityAnomaly => {
                let peak = peak_in_window(path, t.velocity_window_secs);
                let points = scaled(cap, peak as f64, t.velocity_trigger as f64, t.velocity_saturation as f64);
                (points > 0.0).then(|| {
                    (points, vec![format!("{peak} transfers within {}s", t.velocity_window_secs)])
                })
            }
            RiskFactor::Structuring => {
                let bands: Vec<(u64, u64)> = t
                    .structuring_bands
                    .iter()
                    .map(|&(lo, hi)| (Amount::from_usdt(lo).micros(), Amount::from_usdt(hi).micros()))
                    .collect();
                let hits: Vec<&Transfer> = path
                    .transfers()
                    .filter(|tr| bands.iter().any(|&(lo, hi)| (lo..hi).contains(&tr.amount.micros())))
                    .collect();
                (hits.len() >= t.structuring_min_count).then(|| {
                    let evidence = hits
                        .iter()
                        .map(|tr| format!("{} just under a reporting threshold ({})", tr.amount, tr.tx_id))
                        .collect();
                    (cap, evidence)
                })
            }
            RiskFactor::BlacklistProximity => full(cap, proximity_evidence(path, ctx)),
            RiskFactor::HighConnectivity => full(cap, flagged(path, ctx, |a, n| {
                n.filter(|n| n.state == NodeState::Pruned || n.observed_degree > self.max_node_connections)
                    .map(|n| format!("{} is highly connected ({} transfers observed)", a.short(), n.observed_degree))
            })),
            RiskFactor::PathComplexity => (path.hop_count() >= t.complexity_min_hops)
                .then(|| (cap, vec![format!("path spans {} hops", path.hop_count())])),
            RiskFactor::VolumeAnomaly => {
                let largest = path.transfers().map(|tr| tr.amount).max()?;
                let points = scaled(
                    cap,
                    largest.as_usdt(),
                    t.volume_trigger_usdt as f64,
                    t.volume_saturation_usdt as f64,
                );
                (points > 0.0).then(|| (points, vec![format!("largest transfer {largest}")]))
            }
            RiskFactor::TimingAnomaly => {
                let intermediaries = path.intermediaries().len();
                let rapid = rapid_pass_throughs(path, t.rapid_pass_through_secs);
                let points = scaled(cap, rapid.len() as f64, 1.0, intermediaries as f64);
                (points > 0.0).then(|| (points, rapid))
            }
            RiskFactor::ExchangePresence => full(cap, flagged(path, ctx, |a, n| {
                n.and_then(|n| n.exchange.as_ref())
                    .map(|name| format!("{} belongs to {name}", a.short()))
            })),
            RiskFactor::CommunityRisk => full(cap, flagged(path, ctx, |a, _| {
                let ix = ctx.graph.index_of(a)?;
                let community = ctx.communities.community_of(ix)?;
                (community.risk >= CommunityRisk::Medium)
                    .then(|| format!("{} is in {:?}-risk community \"{}\"", a.short(), community.risk, community.name))
            })),
            RiskFactor::HotWallet => full(cap, flagged(path, ctx, |a, n| {
                n.and_then(|n| n.classification)
                    .filter(|c| c.label == WalletLabel::Hot)
                    .map(|c| format!("{} classified hot ({:.0}% confidence)", a.short(), c.confidence * 100.0))
            })),
        }
    }
}

fn full(cap: f64, evidence: Vec<String>) -> Option<(f64, Vec<String>)> {
    (!evidence.is_empty()).then_some((cap, evidence))
}

/// Evidence from every path address `check` flags.
fn flagged<F>(path: &Path, ctx: &RiskContext<'_>, check: F) -> Vec<String>
where
    F: Fn(&Address, Option<&NodeInfo>) -> Option<String>,
{
    path.addresses
        .iter()
        .filter_map(|a| check(a, ctx.graph.node_by_address(a)))
        .collect()
}

fn mixer_evidence(registry: &RiskRegistry, address: &Address, node: Option<&NodeInfo>) -> Option<String> {
    if let Some(name) = registry.mixers.get(address) {
        return Some(match name {
            Some(name) => format!("{} is a registered mixer ({name})", address.short()),
            None => format!("{} is a registered mixer", address.short()),
        });
    }
    let name = node.and_then(|n| n.exchange.as_deref())?;
    is_mixer_name(name).then(|| format!("{} ({name}) matches a mixer pattern", address.short()))
}

fn proximity_evidence(path: &Path, ctx: &RiskContext<'_>) -> Vec<String> {
    let on_path: HashSet<&Address> = path.addresses.iter().collect();
    let mut evidence = Vec::new();
    for address in &path.addresses {
        let Some(ix) = ctx.graph.index_of(address) else {
            continue;
        };
        for n in ctx.graph.undirected_neighbors(ix) {
            let neighbor = ctx.graph.node(n);
            if neighbor.is_blacklisted() && !on_path.contains(&neighbor.address) {
                evidence.push(format!(
                    "{} transacts directly with blacklisted {}",
                    address.short(),
                    neighbor.address.short()
                ));
            }
        }
    }
    evidence
}

/// Largest number of path transfers falling within any `window_secs` span.
fn peak_in_window(path: &Path, window_secs: i64) -> usize {
    let mut times: Vec<i64> = path.transfers().map(|t| t.timestamp.timestamp()).collect();
    times.sort_unstable();
    let mut peak = 0;
    let mut start = 0;
    for end in 0..times.len() {
        while times[end] - times[start] >= window_secs {
            start += 1;
        }
        peak = peak.max(end - start + 1);
    }
    peak
}

/// Intermediaries that sent funds on within `max_secs` of receiving them.
fn rapid_pass_throughs(path: &Path, max_secs: i64) -> Vec<String> {
    let mut evidence = Vec::new();
    for (k, address) in path.addresses.iter().enumerate().skip(1) {
        if k + 1 >= path.addresses.len() {
            break;
        }
        let incoming = &path.hops[k - 1].transfers;
        let outgoing = &path.hops[k].transfers;
        let fastest = incoming
            .iter()
            .flat_map(|i| outgoing.iter().map(move |o| (o.timestamp - i.timestamp).num_seconds()))
            .filter(|gap| (0..max_secs).contains(gap))
            .min();
        if let Some(gap) = fastest {
            evidence.push(format!("{} forwarded funds {gap}s after receiving them", address.short()));
        }
    }
    evidence
}

//! Community detection by synchronous label propagation, plus naming.
//!
//! Every node starts with its own label. Each pass, every node adopts the
//! most common label among its undirected neighbors and itself, computed
//! from the previous pass's labels; ties go to the lowest label. Passes
//! repeat until nothing changes or the iteration cap is hit.
//!
//! Names come from an ordered rule table evaluated over already-computed
//! node flags: the first rule that applies names the community.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::NodeIndex;
use serde::Serialize;
use trace_data::Address;

use crate::features::WalletLabel;
use crate::graph::TransferGraph;

/// Final label per node plus how propagation went.
#[derive(Debug, Clone)]
pub struct Propagation {
    /// Label of each node, indexed by graph position.
    pub labels: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

/// One synchronous propagation pass over `labels`. Returns the new labels and
/// whether any changed.
pub fn propagation_pass(graph: &TransferGraph, labels: &[usize]) -> (Vec<usize>, bool) {
    let mut next = Vec::with_capacity(labels.len());
    let mut changed = false;
    for ix in graph.node_indices() {
        let mut votes: BTreeMap<usize, usize> = BTreeMap::new();
        *votes.entry(labels[ix.index()]).or_default() += 1;
        for n in graph.undirected_neighbors(ix) {
            *votes.entry(labels[n.index()]).or_default() += 1;
        }
        // BTreeMap iterates labels ascending, so the first maximum is the lowest label.
        let mut best = labels[ix.index()];
        let mut best_count = 0;
        for (&label, &count) in &votes {
            if count > best_count {
                best = label;
                best_count = count;
            }
        }
        changed |= best != labels[ix.index()];
        next.push(best);
    }
    (next, changed)
}

pub fn label_propagation(graph: &TransferGraph, max_iterations: usize) -> Propagation {
    let mut labels: Vec<usize> = (0..graph.node_count()).collect();
    let mut iterations = 0;
    let mut converged = false;
    while iterations < max_iterations {
        iterations += 1;
        let (next, changed) = propagation_pass(graph, &labels);
        labels = next;
        if !changed {
            converged = true;
            break;
        }
    }
    Propagation {
        labels,
        iterations,
        converged,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityKind {
    Blocked,
    Exchange,
    HighActivity,
    LowActivity,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityRisk {
    Low,
    Medium,
    High,
}

/// Risk-relevant member flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityTag {
    ContainsBlacklisted,
    ContainsExchange,
    HotWallets,
    ColdWallets,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Community {
    pub id: usize,
    /// Sorted.
    pub members: Vec<Address>,
    pub name: String,
    pub kind: CommunityKind,
    pub tags: BTreeSet<CommunityTag>,
    pub characteristics: Vec<String>,
    pub risk: CommunityRisk,
}

impl Community {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Member flag counts a naming rule looks at.
#[derive(Debug, Clone, Default)]
pub struct MemberProfile {
    pub total: usize,
    pub blacklisted: usize,
    /// Distinct exchange names among members, first-seen order.
    pub exchange_names: Vec<String>,
    pub exchanges: usize,
    pub hot: usize,
    pub cold: usize,
    /// 1-based position after ordering by size.
    pub rank: usize,
}

impl MemberProfile {
    fn build(graph: &TransferGraph, members: &[NodeIndex], rank: usize) -> Self {
        let mut profile = MemberProfile {
            total: members.len(),
            rank,
            ..Self::default()
        };
        for &ix in members {
            let node = graph.node(ix);
            if node.is_blacklisted() {
                profile.blacklisted += 1;
            }
            if let Some(name) = &node.exchange {
                profile.exchanges += 1;
                if !profile.exchange_names.contains(name) {
                    profile.exchange_names.push(name.clone());
                }
            }
            match node.classification.map(|c| c.label) {
                Some(WalletLabel::Hot) => profile.hot += 1,
                Some(WalletLabel::Cold) => profile.cold += 1,
                _ => {}
            }
        }
        profile
    }

    fn majority(&self, count: usize) -> bool {
        count * 2 > self.total
    }
}

/// One entry of the naming table.
pub struct NamingRule {
    pub kind: CommunityKind,
    pub applies: fn(&MemberProfile) -> bool,
    pub name: fn(&MemberProfile) -> String,
}

fn mostly_blacklisted(p: &MemberProfile) -> bool {
    p.majority(p.blacklisted)
}

fn blocked_name(p: &MemberProfile) -> String {
    if p.blacklisted == p.total {
        "Blocked Addresses".to_string()
    } else {
        format!("Blocked Addresses ({}/{} blocked)", p.blacklisted, p.total)
    }
}

fn mostly_exchanges(p: &MemberProfile) -> bool {
    p.majority(p.exchanges)
}

fn exchange_name(p: &MemberProfile) -> String {
    match p.exchange_names.as_slice() {
        [single] => format!("{single} Community"),
        [first, second, ..] => format!("Exchange Community ({first}, {second})"),
        [] => "Exchange Community".to_string(),
    }
}

fn mostly_hot(p: &MemberProfile) -> bool {
    p.majority(p.hot)
}

fn mostly_cold(p: &MemberProfile) -> bool {
    p.majority(p.cold)
}

fn high_activity_name(_: &MemberProfile) -> String {
    "High Activity Community".to_string()
}

fn low_activity_name(_: &MemberProfile) -> String {
    "Low Activity Community".to_string()
}

fn always(_: &MemberProfile) -> bool {
    true
}

fn generic_name(p: &MemberProfile) -> String {
    match p.total {
        1 => "Single Address".to_string(),
        2..=3 => "Small Community".to_string(),
        _ => format!("Community #{}", p.rank),
    }
}

/// Evaluated top to bottom; the last rule always applies.
pub static NAMING_RULES: &[NamingRule] = &[
    NamingRule {
        kind: CommunityKind::Blocked,
        applies: mostly_blacklisted,
        name: blocked_name,
    },
    NamingRule {
        kind: CommunityKind::Exchange,
        applies: mostly_exchanges,
        name: exchange_name,
    },
    NamingRule {
        kind: CommunityKind::HighActivity,
        applies: mostly_hot,
        name: high_activity_name,
    },
    NamingRule {
        kind: CommunityKind::LowActivity,
        applies: mostly_cold,
        name: low_activity_name,
    },
    NamingRule {
        kind: CommunityKind::Regular,
        applies: always,
        name: generic_name,
    },
];

fn describe(profile: &MemberProfile) -> (BTreeSet<CommunityTag>, Vec<String>, CommunityRisk) {
    let mut tags = BTreeSet::new();
    let mut characteristics = Vec::new();
    if profile.blacklisted > 0 {
        tags.insert(CommunityTag::ContainsBlacklisted);
        characteristics.push(format!("{} blocked address(es)", profile.blacklisted));
    }
    if profile.exchanges > 0 {
        tags.insert(CommunityTag::ContainsExchange);
        characteristics.push(format!("{} exchange address(es)", profile.exchanges));
    }
    if profile.majority(profile.hot) {
        tags.insert(CommunityTag::HotWallets);
        characteristics.push(format!("{} hot wallet(s)", profile.hot));
    }
    if profile.majority(profile.cold) {
        tags.insert(CommunityTag::ColdWallets);
        characteristics.push(format!("{} cold wallet(s)", profile.cold));
    }

    let risk = if profile.total > 0 && profile.blacklisted * 2 >= profile.total {
        CommunityRisk::High
    } else if profile.blacklisted > 0 {
        CommunityRisk::Medium
    } else {
        CommunityRisk::Low
    };
    (tags, characteristics, risk)
}

/// Communities plus each node's membership.
#[derive(Debug, Clone, Default)]
pub struct CommunityIndex {
    /// Largest first; ties by lowest member position.
    pub communities: Vec<Community>,
    /// Community id of each node, indexed by graph position.
    membership: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

impl CommunityIndex {
    pub fn community_of(&self, ix: NodeIndex) -> Option<&Community> {
        self.membership
            .get(ix.index())
            .and_then(|&id| self.communities.get(id))
    }

    pub fn id_of(&self, ix: NodeIndex) -> Option<usize> {
        self.membership.get(ix.index()).copied()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommunityDetector {
    pub max_iterations: usize,
}

impl CommunityDetector {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    pub fn detect(&self, graph: &TransferGraph) -> CommunityIndex {
        let propagation = label_propagation(graph, self.max_iterations);

        let mut groups: HashMap<usize, Vec<NodeIndex>> = HashMap::new();
        for ix in graph.node_indices() {
            groups.entry(propagation.labels[ix.index()]).or_default().push(ix);
        }
        let mut groups: Vec<Vec<NodeIndex>> = groups.into_values().collect();
        // Members are pushed in index order, so the first is the smallest.
        groups.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));

        let mut membership = vec![0; graph.node_count()];
        let communities: Vec<Community> = groups
            .iter()
            .enumerate()
            .map(|(id, members)| {
                for ix in members {
                    membership[ix.index()] = id;
                }
                let profile = MemberProfile::build(graph, members, id + 1);
                let rule = NAMING_RULES
                    .iter()
                    .find(|r| (r.applies)(&profile))
                    .unwrap_or(&NAMING_RULES[NAMING_RULES.len() - 1]);
                let (tags, characteristics, risk) = describe(&profile);
                let mut addresses: Vec<Address> = members.iter().map(|&ix| graph.address(ix).clone()).collect();
                addresses.sort();
                Community {
                    id,
                    members: addresses,
                    name: (rule.name)(&profile),
                    kind: rule.kind,
                    tags,
                    characteristics,
                    risk,
                }
            })
            .collect();

        tracing::debug!(
            communities = communities.len(),
            iterations = propagation.iterations,
            converged = propagation.converged,
            "detected communities"
        );
        CommunityIndex {
            communities,
            membership,
            iterations: propagation.iterations,
            converged: propagation.converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use trace_data::{Amount, BlacklistStatus, Transfer};

    fn addr(n: u32) -> Address {
        Address::parse(&format!("T{n:0>33}")).unwrap()
    }

    fn transfer(from: u32, to: u32) -> Transfer {
        Transfer {
            tx_id: format!("{from}->{to}"),
            from: addr(from),
            to: addr(to),
            amount: Amount::from_usdt(100),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn two_triangles() -> TransferGraph {
        TransferGraph::from_transfers(&[
            transfer(1, 2),
            transfer(2, 3),
            transfer(3, 1),
            transfer(4, 5),
            transfer(5, 6),
            transfer(6, 4),
        ])
    }

    #[test]
    fn separates_disconnected_clusters() {
        let index = CommunityDetector::new(20).detect(&two_triangles());
        assert_eq!(index.communities.len(), 2);
        assert!(index.converged);
        assert_eq!(index.communities[0].members, vec![addr(1), addr(2), addr(3)]);
        assert_eq!(index.communities[0].name, "Small Community");
    }

    #[test]
    fn converged_labels_are_stable() {
        let g = two_triangles();
        let propagation = label_propagation(&g, 20);
        assert!(propagation.converged);
        let (again, changed) = propagation_pass(&g, &propagation.labels);
        assert!(!changed);
        assert_eq!(again, propagation.labels);
    }

    #[test]
    fn blacklisted_majority_names_blocked() {
        let mut g = two_triangles();
        for n in [1, 2] {
            let ix = g.index_of(&addr(n)).unwrap();
            g.set_blacklist(ix, BlacklistStatus::Listed);
        }
        let index = CommunityDetector::new(20).detect(&g);
        let blocked = index.community_of(g.index_of(&addr(1)).unwrap()).unwrap();
        assert_eq!(blocked.kind, CommunityKind::Blocked);
        assert_eq!(blocked.risk, CommunityRisk::High);
        assert!(blocked.tags.contains(&CommunityTag::ContainsBlacklisted));
    }

    #[test]
    fn exchange_majority_takes_exchange_name() {
        let mut g = two_triangles();
        for n in [4, 5] {
            let ix = g.index_of(&addr(n)).unwrap();
            g.set_exchange(ix, "Binance");
        }
        let index = CommunityDetector::new(20).detect(&g);
        let community = index.community_of(g.index_of(&addr(6)).unwrap()).unwrap();
        assert_eq!(community.kind, CommunityKind::Exchange);
        assert_eq!(community.name, "Binance Community");
        assert_eq!(community.risk, CommunityRisk::Low);
    }

    #[test]
    fn single_blacklisted_member_is_medium_risk() {
        let mut g = TransferGraph::from_transfers(&[transfer(1, 2), transfer(2, 3), transfer(3, 1)]);
        let ix = g.index_of(&addr(3)).unwrap();
        g.set_blacklist(ix, BlacklistStatus::Listed);
        let index = CommunityDetector::new(20).detect(&g);
        assert_eq!(index.communities[0].risk, CommunityRisk::Medium);
        assert_eq!(index.communities[0].kind, CommunityKind::Regular);
    }
}

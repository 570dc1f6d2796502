//! Per-address activity features and wallet classification.
//!
//! The core never trains a model: it consumes a [`Classification`] through
//! the [`Classifier`] capability. [`HeuristicClassifier`] is the built-in
//! rule-based implementation driven by [`AddressActivity`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use trace_data::{Address, Amount, Transfer};

/// Activity summary of one address, derived from the transfers we hold for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressActivity {
    pub in_count: usize,
    pub out_count: usize,
    /// Distinct senders.
    pub in_counterparties: usize,
    /// Distinct recipients.
    pub out_counterparties: usize,
    pub in_avg_usdt: f64,
    pub out_avg_usdt: f64,
    /// Smallest gap between consecutive transfers, in minutes. Zero with fewer than two.
    pub min_gap_minutes: f64,
    pub total_volume: Amount,
    pub transfers_per_day: f64,
    /// Received minus sent, in USDT.
    pub net_flow_usdt: f64,
}

impl AddressActivity {
    /// Summarizes `transfers` from the point of view of `address`.
    ///
    /// Transfers not touching `address` are ignored.
    pub fn from_transfers<'a>(
        address: &Address,
        transfers: impl IntoIterator<Item = &'a Transfer>,
    ) -> Self {
        let mut activity = Self::default();
        let mut senders = HashSet::new();
        let mut recipients = HashSet::new();
        let mut in_total = Amount::ZERO;
        let mut out_total = Amount::ZERO;
        let mut timestamps = Vec::new();

        for t in transfers {
            if &t.to == address {
                activity.in_count += 1;
                senders.insert(&t.from);
                in_total = in_total + t.amount;
            }
            if &t.from == address {
                activity.out_count += 1;
                recipients.insert(&t.to);
                out_total = out_total + t.amount;
            }
            if &t.to == address || &t.from == address {
                timestamps.push(t.timestamp.timestamp());
            }
        }

        activity.in_counterparties = senders.len();
        activity.out_counterparties = recipients.len();
        activity.in_avg_usdt = average(in_total, activity.in_count);
        activity.out_avg_usdt = average(out_total, activity.out_count);
        activity.total_volume = in_total + out_total;
        activity.net_flow_usdt = in_total.as_usdt() - out_total.as_usdt();

        timestamps.sort_unstable();
        if timestamps.len() > 1 {
            activity.min_gap_minutes = timestamps
                .windows(2)
                .map(|w| (w[1] - w[0]) as f64 / 60.0)
                .fold(f64::INFINITY, f64::min);
            let span_days = (timestamps[timestamps.len() - 1] - timestamps[0]) as f64 / 86_400.0;
            activity.transfers_per_day = timestamps.len() as f64 / span_days.max(1.0);
        }

        activity
    }

    pub fn total_count(&self) -> usize {
        self.in_count + self.out_count
    }
}

fn average(total: Amount, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_usdt() / count as f64
    }
}

/// Closed set of wallet labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletLabel {
    Hot,
    Cold,
    Common,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: WalletLabel,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl Classification {
    pub const UNKNOWN: Classification = Classification {
        label: WalletLabel::Unknown,
        confidence: 0.0,
    };
}

/// Wallet classification capability.
pub trait Classifier: Send + Sync {
    fn classify(&self, address: &Address, activity: &AddressActivity) -> Classification;
}

/// Rule-based hot/cold/common scoring.
///
/// Each label accumulates points from activity indicators; the highest total
/// wins (hot, then cold, then common on ties) and confidence is its share of
/// all points.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn classify(&self, _address: &Address, activity: &AddressActivity) -> Classification {
        let total = activity.total_count();
        if total == 0 {
            return Classification::UNKNOWN;
        }
        let busiest_side = activity.in_counterparties.max(activity.out_counterparties);
        let frequency = activity.transfers_per_day;

        let mut hot = 0u32;
        hot += match total {
            n if n > 1000 => 3,
            n if n > 100 => 2,
            n if n > 10 => 1,
            _ => 0,
        };
        hot += match busiest_side {
            n if n > 50 => 3,
            n if n > 10 => 2,
            _ => 0,
        };
        if frequency > 10.0 {
            hot += 2;
        } else if frequency > 1.0 {
            hot += 1;
        }
        if activity.total_volume > Amount::from_usdt(1_000_000) {
            hot += 2;
        }

        let mut cold = 0u32;
        if total < 10 && frequency < 0.1 {
            cold += 3;
        } else if total < 50 {
            cold += 1;
        }
        // More than a week between transfers.
        if activity.min_gap_minutes > 10_080.0 {
            cold += 2;
        }

        let common = if hot < 3 && cold < 2 { 5 } else { 0 };

        let scores = [
            (WalletLabel::Hot, hot),
            (WalletLabel::Cold, cold),
            (WalletLabel::Common, common),
        ];
        let (label, best) = scores
            .iter()
            .copied()
            .fold((WalletLabel::Unknown, 0), |acc, (label, score)| {
                if score > acc.1 {
                    (label, score)
                } else {
                    acc
                }
            });
        let sum: u32 = scores.iter().map(|(_, s)| s).sum();
        if best == 0 {
            return Classification::UNKNOWN;
        }

        Classification {
            label,
            confidence: f64::from(best) / f64::from(sum.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn addr(n: u32) -> Address {
        Address::parse(&format!("T{n:0>33}")).unwrap()
    }

    fn transfer(from: u32, to: u32, usdt: u64, ts: i64) -> Transfer {
        Transfer {
            tx_id: format!("{from}-{to}-{ts}"),
            from: addr(from),
            to: addr(to),
            amount: Amount::from_usdt(usdt),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
        }
    }

    #[test]
    fn activity_counts_both_sides() {
        let transfers = vec![
            transfer(2, 1, 100, 0),
            transfer(3, 1, 300, 600),
            transfer(1, 4, 50, 1800),
            transfer(5, 6, 999, 10),
        ];
        let a = AddressActivity::from_transfers(&addr(1), &transfers);
        assert_eq!(a.in_count, 2);
        assert_eq!(a.out_count, 1);
        assert_eq!(a.in_counterparties, 2);
        assert_eq!(a.in_avg_usdt, 200.0);
        assert_eq!(a.min_gap_minutes, 10.0);
        assert_eq!(a.total_volume, Amount::from_usdt(450));
        assert_eq!(a.net_flow_usdt, 350.0);
    }

    #[test]
    fn busy_address_is_hot() {
        // 120 distinct senders within one day.
        let transfers: Vec<_> = (0..120).map(|i| transfer(100 + i, 1, 20_000, i as i64 * 60)).collect();
        let activity = AddressActivity::from_transfers(&addr(1), &transfers);
        let c = HeuristicClassifier.classify(&addr(1), &activity);
        assert_eq!(c.label, WalletLabel::Hot);
        assert!(c.confidence > 0.5);
    }

    #[test]
    fn dormant_address_is_cold() {
        let week = 7 * 86_400;
        let transfers = vec![transfer(2, 1, 5_000, 0), transfer(1, 3, 5_000, 3 * week)];
        let activity = AddressActivity::from_transfers(&addr(1), &transfers);
        let c = HeuristicClassifier.classify(&addr(1), &activity);
        assert_eq!(c.label, WalletLabel::Cold);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn no_activity_is_unknown() {
        let c = HeuristicClassifier.classify(&addr(1), &AddressActivity::default());
        assert_eq!(c, Classification::UNKNOWN);
    }
}

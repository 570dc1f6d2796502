//! Best-effort progress feed.
//!
//! Events carry a strictly increasing sequence number. Sending never blocks:
//! when the consumer lags and the channel is full, the event is dropped.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Resolving,
    Searching,
    Scoring,
    Assessing,
    /// Terminal event; nothing follows it.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub phase: Phase,
    pub nodes_explored: usize,
    /// Combined depth of both search frontiers.
    pub current_hop: usize,
    pub paths_found: usize,
}

/// Sending half of the progress feed.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    seq: u64,
}

impl ProgressReporter {
    /// A reporter plus the receiver a caller drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx), seq: 0 }, rx)
    }

    /// A reporter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None, seq: 0 }
    }

    pub fn report(&mut self, phase: Phase, nodes_explored: usize, current_hop: usize, paths_found: usize) {
        self.seq += 1;
        let Some(tx) = &self.tx else {
            return;
        };
        let event = ProgressEvent {
            seq: self.seq,
            phase,
            nodes_explored,
            current_hop,
            paths_found,
        };
        if tx.try_send(event).is_err() {
            tracing::trace!(seq = self.seq, "progress event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_without_blocking() {
        let (mut reporter, mut rx) = ProgressReporter::channel(1);
        reporter.report(Phase::Resolving, 2, 0, 0);
        reporter.report(Phase::Searching, 5, 1, 0);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert!(rx.try_recv().is_err());

        reporter.report(Phase::Finished, 5, 1, 1);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.seq, 3);
        assert_eq!(last.phase, Phase::Finished);
    }

    #[test]
    fn disabled_reporter_is_silent() {
        let mut reporter = ProgressReporter::disabled();
        reporter.report(Phase::Scoring, 1, 1, 1);
    }
}

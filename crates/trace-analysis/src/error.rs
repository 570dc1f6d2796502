//! Request-level failures and non-fatal degradations.

use serde::Serialize;
use thiserror::Error;
use trace_data::{Address, AddressError};

/// Hard failures. Everything else degrades to a partial result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    /// Out-of-range hop count, identical endpoints or an unusable config.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An endpoint has no observable history or could not be fetched at all.
    #[error("endpoint {address} not found: {reason}")]
    NotFound { address: Address, reason: String },
}

/// Which budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Addresses,
    Paths,
    /// Counterparties kept per expansion.
    Neighbors,
    /// Edges kept per address.
    Connections,
}

/// A condition that cut the run short without failing it.
///
/// A result with no degradations is complete within its budgets: an empty
/// path list then means no connection exists in the explored subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Some node expansions failed or stayed rate limited.
    PartialData { failed: Vec<Address> },
    BudgetExhausted { budget: Budget, limit: usize },
    DeadlineExceeded { after_ms: u64 },
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degradation::PartialData { failed } => {
                write!(f, "partial data: {} address(es) could not be fetched", failed.len())
            }
            Degradation::BudgetExhausted { budget, limit } => {
                write!(f, "{budget:?} budget of {limit} exhausted")
            }
            Degradation::DeadlineExceeded { after_ms } => {
                write!(f, "deadline exceeded after {after_ms}ms")
            }
        }
    }
}

//! Shared test helpers and utilities.
//!
//! Factory functions for addresses, transfers and in-memory ledgers with
//! sensible defaults.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::DateTime;
use trace_analysis::{Analyzer, TraceConfig};
use trace_data::{Address, Amount, MemoryBlacklist, MemoryLedger, Transfer};

/// Base timestamp for generated transfers (2023-11-14T22:13:20Z).
pub const BASE_TS: i64 = 1_700_000_000;

/// A valid, deterministic address for `n`.
///
/// # Example
/// ```ignore
/// assert_eq!(addr(7).as_str().len(), 34);
/// ```
pub fn addr(n: u32) -> Address {
    Address::parse(&format!("T{n:0>33}")).expect("generated address is valid")
}

/// A transfer of whole `usdt` from `from` to `to`, one day after the base time.
pub fn transfer(from: u32, to: u32, usdt: u64) -> Transfer {
    transfer_at(from, to, usdt, 86_400)
}

/// A transfer `offset_secs` after the base time.
///
/// The transaction id encodes all arguments, so distinct calls give distinct transfers.
pub fn transfer_at(from: u32, to: u32, usdt: u64, offset_secs: i64) -> Transfer {
    Transfer {
        tx_id: format!("{from:x}{to:x}{usdt:x}{offset_secs:x}"),
        from: addr(from),
        to: addr(to),
        amount: Amount::from_usdt(usdt),
        timestamp: DateTime::from_timestamp(BASE_TS + offset_secs, 0).expect("timestamp in range"),
    }
}

/// A ledger holding `edges` as `(from, to, usdt)` transfers.
pub fn ledger(edges: &[(u32, u32, u64)]) -> MemoryLedger {
    MemoryLedger::from_transfers(edges.iter().map(|&(from, to, usdt)| transfer(from, to, usdt)))
}

/// A hub `hub` with `fan` outgoing transfers to fresh addresses starting at `first`.
pub fn fan_out(hub: u32, first: u32, fan: u32) -> Vec<Transfer> {
    (0..fan).map(|i| transfer_at(hub, first + i, 50, i64::from(i) * 60)).collect()
}

/// A blacklist with nothing on it.
pub fn clear_blacklist() -> MemoryBlacklist {
    MemoryBlacklist::new(Vec::<Address>::new())
}

/// An analyzer over `ledger` with `listed` addresses on the blacklist.
pub fn analyzer(ledger: MemoryLedger, listed: &[Address], config: TraceConfig) -> Analyzer {
    Analyzer::new(
        Arc::new(ledger),
        Arc::new(MemoryBlacklist::new(listed.iter().cloned())),
        config,
    )
}

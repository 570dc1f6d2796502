//! Ledger-facing data layer for USDT transfer tracing on Tron.
//!
//! Provides the [`LedgerClient`] and [`BlacklistClient`] capabilities, their
//! TronGrid/TronScan HTTP implementations, a rate-limit aware retry wrapper,
//! an in-memory ledger for offline replay, and known-address registries.

pub mod client;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod trongrid;
pub mod types;

pub use client::{BlacklistClient, ClientError, LedgerClient};
pub use memory::{LedgerFixture, MemoryBlacklist, MemoryLedger};
pub use registry::{ExchangeRegistry, RiskRegistry};
pub use retry::RetryingLedger;
pub use trongrid::{TronGridClient, TronScanClient};
pub use types::{
    AccountInfo, Address, AddressError, Amount, BlacklistStatus, Direction, Transfer, TransferPage,
};

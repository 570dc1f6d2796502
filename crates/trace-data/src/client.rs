//! Capabilities the analysis engine consumes from the outside world.
//!
//! The engine never talks HTTP itself: it drives a [`LedgerClient`] for
//! transfer history and a [`BlacklistClient`] for list membership. Concrete
//! implementations live in [`crate::trongrid`] and [`crate::memory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AccountInfo, Address, BlacklistStatus, Direction, TransferPage};

/// Failure modes every ledger-facing capability must distinguish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The caller should back off and retry.
    #[error("rate limited by upstream API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// The address has no observable history.
    #[error("no history found for {0}")]
    NotFound(Address),
    /// Anything else; fail fast and mark the data as partial.
    #[error("upstream API unavailable: {0}")]
    Unavailable(String),
}

impl ClientError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::RateLimited { .. })
    }
}

/// Paginated access to asset-transfer history.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetches one page of transfers touching `address`.
    ///
    /// `cursor` is the `next_cursor` of the previous page, or `None` for the first page.
    async fn fetch_transfers(
        &self,
        address: &Address,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<TransferPage, ClientError>;

    async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError>;
}

/// Best-effort blacklist lookups.
#[async_trait]
pub trait BlacklistClient: Send + Sync {
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, ClientError>;

    /// Lookup that never fails: errors degrade to [`BlacklistStatus::Unknown`].
    async fn status(&self, address: &Address) -> BlacklistStatus {
        match self.is_blacklisted(address).await {
            Ok(true) => BlacklistStatus::Listed,
            Ok(false) => BlacklistStatus::Clear,
            Err(e) => {
                tracing::debug!(address = %address, error = %e, "blacklist lookup failed");
                BlacklistStatus::Unknown
            }
        }
    }
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Arc<T> {
    async fn fetch_transfers(
        &self,
        address: &Address,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<TransferPage, ClientError> {
        (**self).fetch_transfers(address, direction, cursor).await
    }

    async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError> {
        (**self).fetch_account_info(address).await
    }
}

#[async_trait]
impl<T: BlacklistClient + ?Sized> BlacklistClient for Arc<T> {
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, ClientError> {
        (**self).is_blacklisted(address).await
    }
}

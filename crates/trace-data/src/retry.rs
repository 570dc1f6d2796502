//! Bounded-concurrency, retry-with-backoff wrapper for any [`LedgerClient`].
//!
//! - Limits in-flight calls with a `tokio::sync::Semaphore`
//! - Retries `RateLimited` answers with exponential backoff (500ms, 1s, ...)
//!   or the server-provided retry-after, whichever is given
//! - Never retries `NotFound` or `Unavailable`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::client::{ClientError, LedgerClient};
use crate::types::{AccountInfo, Address, Direction, TransferPage};

/// Default number of attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on any single wait, including server-provided retry-after.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Rate-limit aware wrapper around a ledger client.
pub struct RetryingLedger<L> {
    inner: L,
    permits: Arc<Semaphore>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl<L: LedgerClient> RetryingLedger<L> {
    /// Wraps `inner`, allowing at most `concurrency` in-flight requests.
    pub fn new(inner: L, concurrency: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.base_backoff * 2_u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    /// Runs `call` under a permit, retrying rate-limited answers.
    ///
    /// The permit is released while backing off so waiting callers do not
    /// starve the rest of the pool.
    async fn with_retry<T, F, Fut>(&self, label: &'static str, address: &Address, call: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| ClientError::Unavailable("ledger client shut down".to_string()))?;
                call().await
            };

            match result {
                Err(ClientError::RateLimited { retry_after }) if attempt + 1 < self.max_attempts => {
                    let backoff = self.backoff_for(attempt, retry_after);
                    tracing::debug!(
                        call = label,
                        address = %address,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        tracing::warn!(
                            call = label,
                            address = %address,
                            attempts = self.max_attempts,
                            "still rate limited after all retries"
                        );
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl<L: LedgerClient> LedgerClient for RetryingLedger<L> {
    async fn fetch_transfers(
        &self,
        address: &Address,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<TransferPage, ClientError> {
        self.with_retry("fetch_transfers", address, || {
            self.inner.fetch_transfers(address, direction, cursor)
        })
        .await
    }

    async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError> {
        self.with_retry("fetch_account_info", address, || {
            self.inner.fetch_account_info(address)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `RateLimited` for the first `fail_first` calls.
    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        terminal: Option<ClientError>,
    }

    impl Flaky {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                terminal: None,
            }
        }
    }

    #[async_trait]
    impl LedgerClient for Flaky {
        async fn fetch_transfers(
            &self,
            _address: &Address,
            _direction: Direction,
            _cursor: Option<&str>,
        ) -> Result<TransferPage, ClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.terminal {
                return Err(err.clone());
            }
            if n < self.fail_first {
                return Err(ClientError::RateLimited { retry_after: None });
            }
            Ok(TransferPage::default())
        }

        async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError> {
            Err(ClientError::NotFound(address.clone()))
        }
    }

    fn addr() -> Address {
        Address::parse("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7").unwrap()
    }

    #[tokio::test]
    async fn retries_rate_limited_until_success() {
        let ledger =
            RetryingLedger::new(Flaky::new(2), 2).with_backoff(3, Duration::from_millis(1));
        let page = ledger
            .fetch_transfers(&addr(), Direction::Both, None)
            .await
            .expect("third attempt succeeds");
        assert!(page.transfers.is_empty());
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let ledger =
            RetryingLedger::new(Flaky::new(10), 1).with_backoff(3, Duration::from_millis(1));
        let err = ledger
            .fetch_transfers(&addr(), Direction::Both, None)
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_unavailable() {
        let mut flaky = Flaky::new(0);
        flaky.terminal = Some(ClientError::Unavailable("boom".into()));
        let ledger = RetryingLedger::new(flaky, 1).with_backoff(5, Duration::from_millis(1));
        let err = ledger
            .fetch_transfers(&addr(), Direction::Both, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unavailable(_)));
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let ledger = RetryingLedger::new(Flaky::new(0), 1);
        assert_eq!(ledger.backoff_for(0, None), Duration::from_millis(500));
        assert_eq!(ledger.backoff_for(1, None), Duration::from_millis(1000));
        assert_eq!(ledger.backoff_for(0, Some(Duration::from_secs(90))), MAX_BACKOFF);
    }
}

//! In-memory ledger and blacklist, used for offline fixture replay and tests.
//!
//! Fixture files are JSON:
//!
//! ```json
//! {
//!   "transfers": [
//!     {"tx_id": "ab12", "from": "T...", "to": "T...", "amount": 25000000,
//!      "timestamp": "2024-03-01T12:00:00Z"}
//!   ],
//!   "blacklisted": ["T..."]
//! }
//! ```
//!
//! `amount` is in micro-USDT.

use std::collections::{HashMap, HashSet};
use std::path::Path as FsPath;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::client::{BlacklistClient, ClientError, LedgerClient};
use crate::types::{AccountInfo, Address, Direction, Transfer, TransferPage};

/// Default page size for replayed history.
const DEFAULT_PAGE_SIZE: usize = 200;

/// On-disk fixture format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerFixture {
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub blacklisted: Vec<Address>,
}

impl LedgerFixture {
    pub fn load(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read ledger fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse ledger fixture {}", path.display()))
    }
}

/// Ledger backed by a fixed set of transfers.
///
/// History is served newest first; the cursor is the offset of the next page.
#[derive(Debug)]
pub struct MemoryLedger {
    by_address: HashMap<Address, Vec<Transfer>>,
    failures: HashMap<Address, ClientError>,
    page_size: usize,
    latency: Option<Duration>,
    slow: HashMap<Address, Duration>,
    fetches: DashMap<Address, usize>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            by_address: HashMap::new(),
            failures: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            latency: None,
            slow: HashMap::new(),
            fetches: DashMap::new(),
        }
    }

    pub fn from_transfers(transfers: impl IntoIterator<Item = Transfer>) -> Self {
        let mut ledger = Self::new();
        for transfer in transfers {
            ledger.push(transfer);
        }
        ledger
    }

    pub fn from_fixture(fixture: &LedgerFixture) -> Self {
        Self::from_transfers(fixture.transfers.iter().cloned())
    }

    /// Records `transfer` under both of its endpoints.
    pub fn push(&mut self, transfer: Transfer) {
        if !transfer.is_self_transfer() {
            insert_newest_first(self.by_address.entry(transfer.to.clone()).or_default(), transfer.clone());
        }
        insert_newest_first(self.by_address.entry(transfer.from.clone()).or_default(), transfer);
    }

    /// Makes every fetch for `address` fail with `error`.
    pub fn fail_with(mut self, address: Address, error: ClientError) -> Self {
        self.failures.insert(address, error);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delays every fetch, for exercising deadlines.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delays fetches for `address` only, on top of any global latency.
    pub fn with_latency_for(mut self, address: Address, latency: Duration) -> Self {
        self.slow.insert(address, latency);
        self
    }

    /// Number of `fetch_transfers` calls made for `address` so far.
    pub fn fetch_count(&self, address: &Address) -> usize {
        self.fetches.get(address).map(|n| *n).unwrap_or(0)
    }

    pub fn address_count(&self) -> usize {
        self.by_address.len()
    }

    fn check_failure(&self, address: &Address) -> Result<(), ClientError> {
        match self.failures.get(address) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn insert_newest_first(history: &mut Vec<Transfer>, transfer: Transfer) {
    let at = history.partition_point(|t| t.timestamp >= transfer.timestamp);
    history.insert(at, transfer);
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn fetch_transfers(
        &self,
        address: &Address,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<TransferPage, ClientError> {
        *self.fetches.entry(address.clone()).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(latency) = self.slow.get(address) {
            tokio::time::sleep(*latency).await;
        }
        self.check_failure(address)?;

        let history = self
            .by_address
            .get(address)
            .ok_or_else(|| ClientError::NotFound(address.clone()))?;

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ClientError::Unavailable(format!("bad cursor {c:?}")))?,
            None => 0,
        };

        let mut matching = history.iter().filter(|t| direction.matches(t, address)).skip(offset);
        let transfers: Vec<Transfer> = matching.by_ref().take(self.page_size).cloned().collect();
        let next_cursor = matching
            .next()
            .map(|_| (offset + transfers.len()).to_string());

        Ok(TransferPage {
            transfers,
            next_cursor,
        })
    }

    async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError> {
        self.check_failure(address)?;
        let history = self
            .by_address
            .get(address)
            .ok_or_else(|| ClientError::NotFound(address.clone()))?;
        Ok(AccountInfo {
            address: address.clone(),
            balance_sun: 0,
            created_at: history.last().map(|t| t.timestamp),
            latest_operation_at: history.first().map(|t| t.timestamp),
        })
    }
}

/// Blacklist backed by a fixed set.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlacklist {
    listed: HashSet<Address>,
    failing: HashSet<Address>,
    slow: HashMap<Address, Duration>,
}

impl MemoryBlacklist {
    pub fn new(listed: impl IntoIterator<Item = Address>) -> Self {
        Self {
            listed: listed.into_iter().collect(),
            failing: HashSet::new(),
            slow: HashMap::new(),
        }
    }

    pub fn from_fixture(fixture: &LedgerFixture) -> Self {
        Self::new(fixture.blacklisted.iter().cloned())
    }

    /// Makes lookups for `address` fail, so its status becomes unknown.
    pub fn failing(mut self, address: Address) -> Self {
        self.failing.insert(address);
        self
    }

    /// Delays lookups for `address` by `latency`.
    pub fn with_latency_for(mut self, address: Address, latency: Duration) -> Self {
        self.slow.insert(address, latency);
        self
    }
}

#[async_trait]
impl BlacklistClient for MemoryBlacklist {
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, ClientError> {
        if let Some(latency) = self.slow.get(address) {
            tokio::time::sleep(*latency).await;
        }
        if self.failing.contains(address) {
            return Err(ClientError::Unavailable("blacklist lookup failed".to_string()));
        }
        Ok(self.listed.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, BlacklistStatus};
    use chrono::DateTime;
    use std::io::Write;

    fn addr(n: u32) -> Address {
        Address::parse(&format!("T{n:0>33}")).unwrap()
    }

    fn transfer(id: &str, from: u32, to: u32, usdt: u64, ts: i64) -> Transfer {
        Transfer {
            tx_id: id.to_string(),
            from: addr(from),
            to: addr(to),
            amount: Amount::from_usdt(usdt),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn serves_history_newest_first_in_pages() {
        let ledger = MemoryLedger::from_transfers(vec![
            transfer("t1", 1, 2, 10, 100),
            transfer("t2", 1, 3, 20, 300),
            transfer("t3", 4, 1, 30, 200),
        ])
        .with_page_size(2);

        let first = ledger.fetch_transfers(&addr(1), Direction::Both, None).await.unwrap();
        let ids: Vec<_> = first.transfers.iter().map(|t| t.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = ledger
            .fetch_transfers(&addr(1), Direction::Both, first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.transfers[0].tx_id, "t1");
        assert!(second.next_cursor.is_none());
        assert_eq!(ledger.fetch_count(&addr(1)), 2);
    }

    #[tokio::test]
    async fn default_ledger_serves_full_pages() {
        let mut ledger = MemoryLedger::default();
        ledger.push(transfer("t1", 1, 2, 10, 100));
        ledger.push(transfer("t2", 1, 3, 10, 200));

        let page = ledger.fetch_transfers(&addr(1), Direction::Both, None).await.unwrap();
        assert_eq!(page.transfers.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn direction_filters_history() {
        let ledger = MemoryLedger::from_transfers(vec![
            transfer("out", 1, 2, 10, 100),
            transfer("in", 3, 1, 10, 200),
        ]);
        let incoming = ledger.fetch_transfers(&addr(1), Direction::Incoming, None).await.unwrap();
        assert_eq!(incoming.transfers.len(), 1);
        assert_eq!(incoming.transfers[0].tx_id, "in");
    }

    #[tokio::test]
    async fn unknown_address_is_not_found() {
        let ledger = MemoryLedger::from_transfers(vec![transfer("t", 1, 2, 10, 100)]);
        let err = ledger.fetch_transfers(&addr(9), Direction::Both, None).await.unwrap_err();
        assert_eq!(err, ClientError::NotFound(addr(9)));
    }

    #[tokio::test]
    async fn injected_failure_is_returned() {
        let ledger = MemoryLedger::from_transfers(vec![transfer("t", 1, 2, 10, 100)])
            .fail_with(addr(2), ClientError::Unavailable("down".into()));
        let err = ledger.fetch_transfers(&addr(2), Direction::Both, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Unavailable(_)));
    }

    #[tokio::test]
    async fn account_info_spans_history() {
        let ledger = MemoryLedger::from_transfers(vec![
            transfer("a", 1, 2, 10, 100),
            transfer("b", 2, 1, 10, 500),
        ]);
        let info = ledger.fetch_account_info(&addr(1)).await.unwrap();
        assert_eq!(info.created_at.unwrap().timestamp(), 100);
        assert_eq!(info.latest_operation_at.unwrap().timestamp(), 500);
    }

    #[tokio::test]
    async fn blacklist_status_degrades_to_unknown() {
        let blacklist = MemoryBlacklist::new([addr(1)]).failing(addr(2));
        assert_eq!(blacklist.status(&addr(1)).await, BlacklistStatus::Listed);
        assert_eq!(blacklist.status(&addr(2)).await, BlacklistStatus::Unknown);
        assert_eq!(blacklist.status(&addr(3)).await, BlacklistStatus::Clear);
    }

    #[test]
    fn fixture_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = format!(
            r#"{{"transfers":[{{"tx_id":"x","from":"{}","to":"{}","amount":15000000,"timestamp":"2024-03-01T12:00:00Z"}}],"blacklisted":["{}"]}}"#,
            addr(1),
            addr(2),
            addr(2)
        );
        file.write_all(json.as_bytes()).unwrap();

        let fixture = LedgerFixture::load(file.path()).unwrap();
        assert_eq!(fixture.transfers.len(), 1);
        assert_eq!(fixture.transfers[0].amount, Amount::from_usdt(15));
        assert_eq!(MemoryLedger::from_fixture(&fixture).address_count(), 2);
    }
}

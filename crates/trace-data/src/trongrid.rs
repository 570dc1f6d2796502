//! # TronGrid / TronScan HTTP clients
//!
//! [`TronGridClient`] pulls USDT (TRC-20) transfer history from the TronGrid
//! v1 accounts API; [`TronScanClient`] answers blacklist lookups from the
//! TronScan security endpoint.
//!
//! ## Rate Limits
//!
//! TronGrid answers HTTP 429 when the per-key quota is exceeded. That is
//! surfaced as [`ClientError::RateLimited`] carrying the `Retry-After` header,
//! and retried by [`crate::retry::RetryingLedger`]. Neither client sleeps on
//! its own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use eyre::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{BlacklistClient, ClientError, LedgerClient};
use crate::types::{AccountInfo, Address, Amount, Direction, Transfer, TransferPage};

/// TronGrid public API base URL.
pub const TRONGRID_BASE_URL: &str = "https://api.trongrid.io";

/// TronScan API base URL.
pub const TRONSCAN_BASE_URL: &str = "https://apilist.tronscanapi.com/api";

/// USDT TRC-20 contract address.
pub const USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

/// Maximum page size accepted by the TRC-20 history endpoint.
pub const MAX_PAGE_SIZE: usize = 200;

const API_KEY_HEADER: &str = "TRON-PRO-API-KEY";

#[derive(Debug, Deserialize)]
struct Trc20Response {
    #[serde(default)]
    data: Vec<Trc20Record>,
    #[serde(default)]
    meta: Option<Trc20Meta>,
}

#[derive(Debug, Deserialize)]
struct Trc20Meta {
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Trc20Record {
    #[serde(default)]
    transaction_id: String,
    #[serde(default)]
    block_timestamp: i64,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    data: Vec<AccountRecord>,
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    #[serde(default)]
    balance: u64,
    create_time: Option<i64>,
    latest_opration_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SecurityResponse {
    #[serde(default)]
    is_black_list: bool,
    #[serde(default)]
    has_fraud_transaction: bool,
}

/// Converts one TronGrid record, skipping malformed addresses or values.
fn parse_record(record: &Trc20Record) -> Option<Transfer> {
    let from = Address::parse(&record.from).ok()?;
    let to = Address::parse(&record.to).ok()?;
    let micros = record.value.trim().parse::<u64>().ok()?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(record.block_timestamp)?;

    Some(Transfer {
        tx_id: record.transaction_id.clone(),
        from,
        to,
        amount: Amount::from_micros(micros),
        timestamp,
    })
}

/// Maps an unsuccessful HTTP status to the client error taxonomy.
fn status_error(status: StatusCode, headers: &HeaderMap, address: &Address) -> ClientError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            ClientError::RateLimited { retry_after }
        }
        StatusCode::NOT_FOUND => ClientError::NotFound(address.clone()),
        other => ClientError::Unavailable(format!("HTTP {}", other.as_u16())),
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .wrap_err("failed to build HTTP client")
}

/// TronGrid ledger client for USDT transfers.
#[derive(Clone)]
pub struct TronGridClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    contract: String,
    page_size: usize,
}

impl TronGridClient {
    /// Creates a client against `base_url` with an optional API key.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(Duration::from_secs(30))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            contract: USDT_CONTRACT.to_string(),
            page_size: MAX_PAGE_SIZE,
        })
    }

    /// Page size per request, capped at [`MAX_PAGE_SIZE`].
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }
}

#[async_trait]
impl LedgerClient for TronGridClient {
    #[tracing::instrument(skip_all, fields(address = %address, direction = ?direction))]
    async fn fetch_transfers(
        &self,
        address: &Address,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<TransferPage, ClientError> {
        let url = format!("{}/v1/accounts/{}/transactions/trc20", self.base_url, address);
        let limit = self.page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("contract_address", self.contract.as_str()),
            ("limit", limit.as_str()),
            ("only_confirmed", "true"),
        ];
        match direction {
            Direction::Outgoing => query.push(("only_from", "true")),
            Direction::Incoming => query.push(("only_to", "true")),
            Direction::Both => {}
        }
        if let Some(fingerprint) = cursor {
            query.push(("fingerprint", fingerprint));
        }

        let response = self
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let err = status_error(status, response.headers(), address);
            warn!(status = status.as_u16(), error = %err, "TronGrid request failed");
            return Err(err);
        }

        let body: Trc20Response = response
            .json()
            .await
            .map_err(|e| ClientError::Unavailable(format!("malformed TronGrid response: {e}")))?;

        let raw_count = body.data.len();
        let transfers: Vec<Transfer> = body.data.iter().filter_map(parse_record).collect();
        let next_cursor = body
            .meta
            .and_then(|m| m.fingerprint)
            .filter(|f| !f.is_empty() && raw_count > 0);

        debug!(
            raw = raw_count,
            parsed = transfers.len(),
            has_more = next_cursor.is_some(),
            "fetched transfer page"
        );

        Ok(TransferPage {
            transfers,
            next_cursor,
        })
    }

    #[tracing::instrument(skip_all, fields(address = %address))]
    async fn fetch_account_info(&self, address: &Address) -> Result<AccountInfo, ClientError> {
        let url = format!("{}/v1/accounts/{}", self.base_url, address);
        let response = self
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.headers(), address));
        }

        let body: AccountResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Unavailable(format!("malformed account response: {e}")))?;

        let record = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::NotFound(address.clone()))?;

        Ok(AccountInfo {
            address: address.clone(),
            balance_sun: record.balance,
            created_at: record.create_time.and_then(DateTime::from_timestamp_millis),
            latest_operation_at: record
                .latest_opration_time
                .and_then(DateTime::from_timestamp_millis),
        })
    }
}

/// TronScan blacklist client with a per-process answer cache.
pub struct TronScanClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache: DashMap<Address, bool>,
}

impl TronScanClient {
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(Duration::from_secs(15))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            cache: DashMap::new(),
        })
    }

    /// Number of cached answers.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl BlacklistClient for TronScanClient {
    #[tracing::instrument(skip_all, fields(address = %address))]
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, ClientError> {
        if let Some(hit) = self.cache.get(address) {
            return Ok(*hit);
        }

        let url = format!("{}/security/account/data", self.base_url);
        let mut request = self.http.get(&url).query(&[("address", address.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.headers(), address));
        }

        let body: SecurityResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Unavailable(format!("malformed TronScan response: {e}")))?;

        if body.has_fraud_transaction && !body.is_black_list {
            debug!(address = %address, "address has fraud transactions but is not listed");
        }

        self.cache.insert(address.clone(), body.is_black_list);
        Ok(body.is_black_list)
    }
}

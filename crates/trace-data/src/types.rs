//! Core ledger types shared by the clients and the analysis engine.
//!
//! Addresses are Tron base58 strings; amounts are USDT (TRC-20, 6 decimals)
//! kept as integer micro-units so that ordering and summation stay exact.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of every Tron base58 address.
pub const ADDRESS_LEN: usize = 34;

/// Leading character of every Tron mainnet address.
pub const ADDRESS_PREFIX: char = 'T';

/// Micro-units per whole USDT.
pub const MICROS_PER_USDT: u64 = 1_000_000;

/// Rejected address input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address {0:?}: expected {ADDRESS_LEN} alphanumeric characters starting with '{ADDRESS_PREFIX}'")]
pub struct AddressError(pub String);

/// A validated Tron address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parses and validates an address, trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let valid = trimmed.len() == ADDRESS_LEN
            && trimmed.starts_with(ADDRESS_PREFIX)
            && trimmed.chars().all(|c| c.is_ascii_alphanumeric());
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(AddressError(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters followed by an ellipsis, for log lines and evidence.
    pub fn short(&self) -> String {
        format!("{}...", &self.0[..12])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// USDT amount in micro-units (6 decimals).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Whole-USDT constructor, saturating on overflow.
    pub const fn from_usdt(whole: u64) -> Self {
        Self(whole.saturating_mul(MICROS_PER_USDT))
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub fn as_usdt(self) -> f64 {
        self.0 as f64 / MICROS_PER_USDT as f64
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Formats with exactly 6 decimal places, e.g. `"1250.500000 USDT"`.
impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_USDT;
        let fractional = self.0 % MICROS_PER_USDT;
        write!(f, "{whole}.{fractional:06} USDT")
    }
}

/// One USDT transfer event between two addresses.
///
/// Several transfers may exist between the same ordered pair; each is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Ledger transaction id (hex).
    pub tx_id: String,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Transfer {
    /// The other side of this transfer relative to `address`, if `address` takes part.
    pub fn counterparty(&self, address: &Address) -> Option<&Address> {
        if &self.from == address {
            Some(&self.to)
        } else if &self.to == address {
            Some(&self.from)
        } else {
            None
        }
    }

    pub fn is_self_transfer(&self) -> bool {
        self.from == self.to
    }
}

/// Which side of an address's history to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Transfers sent by the address.
    Outgoing,
    /// Transfers received by the address.
    Incoming,
    Both,
}

impl Direction {
    pub fn matches(self, transfer: &Transfer, address: &Address) -> bool {
        match self {
            Direction::Outgoing => &transfer.from == address,
            Direction::Incoming => &transfer.to == address,
            Direction::Both => &transfer.from == address || &transfer.to == address,
        }
    }
}

/// One page of transfer history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPage {
    pub transfers: Vec<Transfer>,
    /// Opaque pagination cursor; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Basic account metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: Address,
    /// TRX balance in sun.
    pub balance_sun: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub latest_operation_at: Option<DateTime<Utc>>,
}

/// Outcome of a blacklist lookup.
///
/// `Unknown` preserves the fact that the lookup failed; it scores as not listed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistStatus {
    Listed,
    Clear,
    Unknown,
}

impl BlacklistStatus {
    pub fn is_listed(self) -> bool {
        matches!(self, BlacklistStatus::Listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";

    #[test]
    fn parses_valid_address() {
        let addr = Address::parse(VALID).expect("valid address");
        assert_eq!(addr.as_str(), VALID);
        assert_eq!(addr.short(), "TLa2f6VPqDgR...");
    }

    #[test]
    fn trims_whitespace() {
        let addr = Address::parse(&format!("  {VALID}\n")).expect("trimmed");
        assert_eq!(addr.as_str(), VALID);
    }

    #[test]
    fn rejects_wrong_prefix_and_length() {
        assert!(Address::parse("0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D").is_err());
        assert!(Address::parse("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU").is_err());
        assert!(Address::parse("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYj-7").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn address_deserialization_validates() {
        let ok: Result<Address, _> = serde_json::from_str(&format!("\"{VALID}\""));
        assert!(ok.is_ok());
        let bad: Result<Address, _> = serde_json::from_str("\"not-an-address\"");
        assert!(bad.is_err());
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(Amount::from_usdt(1).to_string(), "1.000000 USDT");
        assert_eq!(Amount::from_micros(123).to_string(), "0.000123 USDT");
        assert_eq!(Amount::from_micros(1_250_500_000).to_string(), "1250.500000 USDT");
    }

    #[test]
    fn amount_sum_saturates() {
        let total: Amount = [Amount(u64::MAX), Amount(5)].iter().sum();
        assert_eq!(total, Amount(u64::MAX));
        assert_eq!(Amount::from_usdt(10).as_usdt(), 10.0);
    }

    #[test]
    fn direction_matching() {
        let a = Address::parse(VALID).unwrap();
        let b = Address::parse("TNPeeaaFB7K9cmo4uQpcU32zGK8G1NYqeL").unwrap();
        let t = Transfer {
            tx_id: "aa".into(),
            from: a.clone(),
            to: b.clone(),
            amount: Amount::from_usdt(5),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        assert!(Direction::Outgoing.matches(&t, &a));
        assert!(!Direction::Incoming.matches(&t, &a));
        assert!(Direction::Incoming.matches(&t, &b));
        assert!(Direction::Both.matches(&t, &b));
        assert_eq!(t.counterparty(&a), Some(&b));
    }
}

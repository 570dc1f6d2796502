//! Known-address registries: exchanges and risk lists.
//!
//! Both are loaded from plain text files with one `ADDRESS[,Name]` entry per
//! line. Blank lines and `#` comments are ignored, as are lines that do not
//! start with a Tron address.

use std::collections::{HashMap, HashSet};
use std::path::Path as FsPath;

use eyre::{Result, WrapErr};

use crate::types::{Address, ADDRESS_PREFIX};

/// Substrings that mark an exchange or service name as a mixer.
pub const MIXER_KEYWORDS: &[&str] = &["tornado", "mixer", "tumbler", "blender"];

pub fn is_mixer_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    MIXER_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Parses registry text into `(address, optional name)` pairs.
fn parse_entries(text: &str) -> impl Iterator<Item = (Address, Option<String>)> + '_ {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || !line.starts_with(ADDRESS_PREFIX) {
            return None;
        }
        let mut parts = line.splitn(2, ',');
        let address = Address::parse(parts.next()?).ok()?;
        let name = parts
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Some((address, name))
    })
}

fn read(path: &FsPath) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read registry file {}", path.display()))
}

/// Known exchange hot wallets, by address.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRegistry {
    names: HashMap<Address, String>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let names = parse_entries(text)
            .map(|(address, name)| (address, name.unwrap_or_else(|| "Exchange".to_string())))
            .collect();
        Self { names }
    }

    pub fn load(path: impl AsRef<FsPath>) -> Result<Self> {
        let registry = Self::parse(&read(path.as_ref())?);
        tracing::info!(path = %path.as_ref().display(), exchanges = registry.len(), "loaded exchange registry");
        Ok(registry)
    }

    pub fn insert(&mut self, address: Address, name: impl Into<String>) {
        self.names.insert(address, name.into());
    }

    pub fn name_of(&self, address: &Address) -> Option<&str> {
        self.names.get(address).map(String::as_str)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.names.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Addresses on compliance risk lists.
#[derive(Debug, Clone, Default)]
pub struct RiskRegistry {
    pub sanctioned: HashSet<Address>,
    /// Mixer addresses mapped to the service name, when known.
    pub mixers: HashMap<Address, Option<String>>,
    pub scams: HashSet<Address>,
    pub unregulated_exchanges: HashSet<Address>,
}

impl RiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `sanctioned.txt`, `mixers.txt`, `scams.txt` and
    /// `unregulated.txt` from `dir`. Missing files leave the list empty.
    pub fn load_dir(dir: impl AsRef<FsPath>) -> Result<Self> {
        let dir = dir.as_ref();
        let load = |file: &str| -> Result<Option<String>> {
            let path = dir.join(file);
            if path.exists() {
                read(&path).map(Some)
            } else {
                tracing::debug!(path = %path.display(), "risk list not present");
                Ok(None)
            }
        };

        let mut registry = Self::new();
        if let Some(text) = load("sanctioned.txt")? {
            registry.sanctioned = parse_entries(&text).map(|(a, _)| a).collect();
        }
        if let Some(text) = load("mixers.txt")? {
            registry.mixers = parse_entries(&text).collect();
        }
        if let Some(text) = load("scams.txt")? {
            registry.scams = parse_entries(&text).map(|(a, _)| a).collect();
        }
        if let Some(text) = load("unregulated.txt")? {
            registry.unregulated_exchanges = parse_entries(&text).map(|(a, _)| a).collect();
        }

        tracing::info!(
            dir = %dir.display(),
            sanctioned = registry.sanctioned.len(),
            mixers = registry.mixers.len(),
            scams = registry.scams.len(),
            unregulated = registry.unregulated_exchanges.len(),
            "loaded risk registry"
        );
        Ok(registry)
    }

    pub fn is_sanctioned(&self, address: &Address) -> bool {
        self.sanctioned.contains(address)
    }

    pub fn is_mixer(&self, address: &Address) -> bool {
        self.mixers.contains_key(address)
    }

    pub fn is_scam(&self, address: &Address) -> bool {
        self.scams.contains(address)
    }

    pub fn is_unregulated_exchange(&self, address: &Address) -> bool {
        self.unregulated_exchanges.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINANCE: &str = "TNPeeaaFB7K9cmo4uQpcU32zGK8G1NYqeL";
    const OTHER: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";

    #[test]
    fn parses_names_comments_and_junk() {
        let text = format!(
            "# exchanges\n\n{BINANCE},Binance\n{OTHER}\n0xdeadbeef,Ethereum\nTshort,Bad\n"
        );
        let registry = ExchangeRegistry::parse(&text);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name_of(&Address::parse(BINANCE).unwrap()), Some("Binance"));
        assert_eq!(registry.name_of(&Address::parse(OTHER).unwrap()), Some("Exchange"));
    }

    #[test]
    fn mixer_keywords_match_case_insensitively() {
        assert!(is_mixer_name("Tornado Cash"));
        assert!(is_mixer_name("USDT Tumbler v2"));
        assert!(!is_mixer_name("Binance"));
    }

    #[test]
    fn load_dir_reads_present_lists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sanctioned.txt"), format!("{OTHER}\n")).unwrap();
        std::fs::write(dir.path().join("mixers.txt"), format!("{BINANCE},Blender\n")).unwrap();

        let registry = RiskRegistry::load_dir(dir.path()).unwrap();
        assert!(registry.is_sanctioned(&Address::parse(OTHER).unwrap()));
        assert!(registry.is_mixer(&Address::parse(BINANCE).unwrap()));
        assert!(registry.scams.is_empty());
        assert!(registry.unregulated_exchanges.is_empty());
    }

    #[test]
    fn missing_exchange_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExchangeRegistry::load(dir.path().join("nope.txt")).is_err());
    }
}

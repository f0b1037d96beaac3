//! Assets and raw daily market observations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Short key used for storage and reports, e.g. `btc`.
    pub symbol: String,
    pub name: String,
    /// Identifier understood by the data source, e.g. `bitcoin`.
    pub provider_id: String,
}

impl Asset {
    pub fn new(
        symbol: impl Into<String>,
        name: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into().to_ascii_lowercase(),
            name: name.into(),
            provider_id: provider_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketDataPoint {
    pub ts_ms_utc: i64,
    pub price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid asset entry '{0}', expected symbol:name:provider_id")]
    InvalidEntry(String),
    #[error("invalid asset symbol '{0}', expected [a-z0-9_-]+")]
    InvalidSymbol(String),
}

/// Explicit symbol lookup handed to the orchestrator and entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRegistry {
    assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedAssets {
    pub assets: Vec<Asset>,
    pub unknown: Vec<String>,
}

impl Default for AssetRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (symbol, name, provider_id) in [
            ("btc", "Bitcoin", "bitcoin"),
            ("eth", "Ethereum", "ethereum"),
            ("sol", "Solana", "solana"),
            ("ada", "Cardano", "cardano"),
            ("dot", "Polkadot", "polkadot"),
        ] {
            registry.insert(Asset::new(symbol, name, provider_id));
        }
        registry
    }
}

impl AssetRegistry {
    pub fn empty() -> Self {
        Self {
            assets: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, asset: Asset) {
        self.assets.insert(asset.symbol.clone(), asset);
    }

    pub fn get(&self, symbol: &str) -> Option<&Asset> {
        self.assets.get(&symbol.trim().to_ascii_lowercase())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.assets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Maps requested symbols to known assets, preserving request order and
    /// dropping repeats.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> ResolvedAssets {
        let mut out = ResolvedAssets::default();
        for raw in requested {
            let raw = raw.as_ref();
            match self.get(raw) {
                Some(asset) => {
                    if !out.assets.iter().any(|known| known.symbol == asset.symbol) {
                        out.assets.push(asset.clone());
                    }
                }
                None => out.unknown.push(raw.to_string()),
            }
        }
        out
    }

    /// Adds entries of the form `sym:Name:provider-id,sym2:Name2:id2`.
    pub fn extend_from_spec(&mut self, spec: &str) -> Result<(), RegistryError> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [symbol, name, provider_id] = parts.as_slice() else {
                return Err(RegistryError::InvalidEntry(entry.to_string()));
            };
            if name.is_empty() || provider_id.is_empty() {
                return Err(RegistryError::InvalidEntry(entry.to_string()));
            }
            if !is_valid_symbol(symbol) {
                return Err(RegistryError::InvalidSymbol(symbol.to_string()));
            }
            self.insert(Asset::new(*symbol, *name, *provider_id));
        }
        Ok(())
    }
}

pub(crate) fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_five_assets() {
        let registry = AssetRegistry::default();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("BTC").unwrap().provider_id, "bitcoin");
        assert_eq!(registry.get(" dot ").unwrap().name, "Polkadot");
    }

    #[test]
    fn resolve_splits_known_and_unknown_and_dedups() {
        let registry = AssetRegistry::default();
        let resolved = registry.resolve(&["ETH", "doge", "eth", "sol"]);
        let symbols: Vec<&str> = resolved.assets.iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["eth", "sol"]);
        assert_eq!(resolved.unknown, vec!["doge".to_string()]);
    }

    #[test]
    fn extend_from_spec_adds_and_validates_entries() {
        let mut registry = AssetRegistry::empty();
        registry
            .extend_from_spec("link:Chainlink:chainlink, avax:Avalanche:avalanche-2")
            .unwrap();
        assert_eq!(registry.symbols(), vec!["avax", "link"]);

        let err = registry.extend_from_spec("bad-entry").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidEntry(_)));

        let err = registry.extend_from_spec("../x:Name:id").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSymbol(_)));
    }
}

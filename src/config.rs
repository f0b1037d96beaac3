//! Environment-driven application settings.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::coingecko::CoinGeckoConfig;
use crate::market::{AssetRegistry, RegistryError};

pub const DEFAULT_HISTORY_DAYS: u32 = 365;
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TRENDLAB_ASSETS: {0}")]
    Assets(#[from] RegistryError),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub report_dir: PathBuf,
    /// `None` disables the prediction ledger.
    pub ledger_path: Option<PathBuf>,
    pub coingecko: CoinGeckoConfig,
    pub registry: AssetRegistry,
    pub api_addr: SocketAddr,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            ledger_path: Some(data_dir.join("predictions.sqlite")),
            data_dir,
            report_dir: PathBuf::from("reports"),
            coingecko: CoinGeckoConfig::default(),
            registry: AssetRegistry::default(),
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

impl AppConfig {
    /// Reads `TRENDLAB_*` variables over the defaults. Unset or blank
    /// variables keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = non_empty_var("TRENDLAB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.ledger_path = Some(config.data_dir.join("predictions.sqlite"));
        }
        if let Some(dir) = non_empty_var("TRENDLAB_REPORT_DIR") {
            config.report_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty_var("TRENDLAB_LEDGER_PATH") {
            config.ledger_path = match path.to_ascii_lowercase().as_str() {
                "off" | "none" | "disabled" => None,
                _ => Some(PathBuf::from(path)),
            };
        }
        if let Some(spec) = non_empty_var("TRENDLAB_ASSETS") {
            config.registry.extend_from_spec(&spec)?;
        }
        if let Some(url) = non_empty_var("TRENDLAB_COINGECKO_BASE_URL") {
            config.coingecko.base_url = url;
        }
        if let Some(raw) = non_empty_var("TRENDLAB_HTTP_TIMEOUT_MS") {
            config.coingecko.http_timeout_ms = parse_value("TRENDLAB_HTTP_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = non_empty_var("TRENDLAB_MAX_RETRIES") {
            config.coingecko.max_retries = parse_value("TRENDLAB_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = non_empty_var("TRENDLAB_API_ADDR") {
            config.api_addr = parse_value("TRENDLAB_API_ADDR", &raw)?;
        }

        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}

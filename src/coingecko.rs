//! Daily market history from the CoinGecko `market_chart` endpoint.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::market::{Asset, MarketDataPoint};

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Source of daily history for one asset, oldest first.
pub trait MarketDataProvider: Send {
    fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<MarketDataPoint>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinGeckoConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub rate_limit_wait_ms: u64,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            http_timeout_ms: 30_000,
            max_retries: 5,
            retry_backoff_ms: 1_000,
            rate_limit_wait_ms: 60_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("malformed market_chart payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("history request needs at least one day")]
    InvalidDays,
    #[error("provider returned no observations for {asset}")]
    EmptySeries { asset: String },
}

impl FetchError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub trait HttpFetcher: Send {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .send()
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

pub struct CoinGeckoProvider {
    cfg: CoinGeckoConfig,
    fetcher: Box<dyn HttpFetcher>,
}

impl CoinGeckoProvider {
    pub fn new(cfg: CoinGeckoConfig) -> Result<Self, FetchError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self::with_fetcher(cfg, Box::new(fetcher)))
    }

    pub fn with_fetcher(cfg: CoinGeckoConfig, fetcher: Box<dyn HttpFetcher>) -> Self {
        Self { cfg, fetcher }
    }

    pub fn market_chart_url(&self, asset: &Asset, days: u32) -> String {
        format!(
            "{}/coins/{}/market_chart?vs_currency=usd&days={days}&interval=daily",
            self.cfg.base_url.trim_end_matches('/'),
            asset.provider_id
        )
    }
}

impl MarketDataProvider for CoinGeckoProvider {
    fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<MarketDataPoint>, FetchError> {
        if days == 0 {
            return Err(FetchError::InvalidDays);
        }
        let url = self.market_chart_url(asset, days);
        info!(
            component = "coingecko",
            event = "coingecko.fetch.start",
            asset = %asset.symbol,
            provider_id = %asset.provider_id,
            days
        );

        let body = retry(&self.cfg, &url, || self.fetcher.get_bytes(&url))?;
        let points = parse_market_chart(&url, &body)?;
        if points.is_empty() {
            return Err(FetchError::EmptySeries {
                asset: asset.symbol.clone(),
            });
        }

        info!(
            component = "coingecko",
            event = "coingecko.fetch.finish",
            asset = %asset.symbol,
            points = points.len(),
            first_ts_ms_utc = points.first().map(|p| p.ts_ms_utc),
            last_ts_ms_utc = points.last().map(|p| p.ts_ms_utc)
        );
        Ok(points)
    }
}

/// `[timestamp_ms, value]` pairs; CoinGecko occasionally sends `null` values.
type ChartPair = (f64, Option<f64>);

#[derive(Debug, Deserialize)]
struct MarketChartPayload {
    #[serde(default)]
    prices: Vec<ChartPair>,
    #[serde(default)]
    market_caps: Vec<ChartPair>,
    #[serde(default)]
    total_volumes: Vec<ChartPair>,
}

/// Aligns the three series by position. Missing caps or volumes read as 0.0;
/// points without a usable price are dropped. Output is sorted with one
/// point per timestamp (first occurrence wins).
pub fn parse_market_chart(url: &str, body: &[u8]) -> Result<Vec<MarketDataPoint>, FetchError> {
    let payload: MarketChartPayload =
        serde_json::from_slice(body).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })?;

    let value_at = |series: &[ChartPair], idx: usize| {
        series
            .get(idx)
            .and_then(|(_, value)| *value)
            .filter(|value| value.is_finite())
            .unwrap_or(0.0)
    };

    let mut points: Vec<MarketDataPoint> = payload
        .prices
        .iter()
        .enumerate()
        .filter_map(|(idx, (ts, price))| {
            let price = (*price)?;
            if !ts.is_finite() || !price.is_finite() {
                return None;
            }
            Some(MarketDataPoint {
                ts_ms_utc: *ts as i64,
                price,
                market_cap: value_at(&payload.market_caps, idx),
                total_volume: value_at(&payload.total_volumes, idx),
            })
        })
        .collect();

    points.sort_by_key(|point| point.ts_ms_utc);
    points.dedup_by_key(|point| point.ts_ms_utc);
    Ok(points)
}

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay_ms(cfg: &CoinGeckoConfig, attempt: u32, err: &FetchError) -> u64 {
    if err.is_rate_limited() {
        return cfg.rate_limit_wait_ms;
    }
    let shift = attempt.saturating_sub(1).min(10);
    cfg.retry_backoff_ms.saturating_mul(1u64 << shift)
}

fn retry<T>(
    cfg: &CoinGeckoConfig,
    url: &str,
    mut f: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries || !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let wait_ms = retry_delay_ms(cfg, attempt, &err);
                warn!(
                    component = "coingecko",
                    event = "coingecko.fetch.retry",
                    url,
                    attempt,
                    max_retries = cfg.max_retries,
                    wait_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(wait_ms));
            }
        }
    }
}

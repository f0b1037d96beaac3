//! Rule-of-thumb market context from the most recent enriched row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::EnrichedRow;
use crate::market::Asset;

/// Daily 30-day volatility above this reads as a high-volatility market.
pub const HIGH_VOLATILITY_THRESHOLD: f64 = 0.05;
/// Minimum distance of RSI from 50 for a trending regime.
pub const TRENDING_RSI_DISTANCE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolatilityState {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Trending,
    Ranging,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

impl VolatilityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Low => "LOW",
        }
    }
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trending => "TRENDING",
            Self::Ranging => "RANGING",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsightError {
    #[error("no enriched rows available")]
    NoRows,
    #[error("latest row has no value for {0}")]
    MissingFeature(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInsight {
    pub asset: String,
    pub as_of_ts_ms_utc: i64,
    pub trend: Trend,
    pub volatility_state: VolatilityState,
    pub regime: Regime,
    pub drawdown_pct: f64,
    pub summary: String,
}

fn required(value: Option<f64>, name: &'static str) -> Result<f64, InsightError> {
    value.ok_or(InsightError::MissingFeature(name))
}

pub fn derive_insight(asset: &Asset, rows: &[EnrichedRow]) -> Result<MarketInsight, InsightError> {
    let latest = rows
        .iter()
        .max_by_key(|row| row.ts_ms_utc)
        .ok_or(InsightError::NoRows)?;

    let sma_50 = required(latest.sma_50, "sma_50")?;
    let sma_200 = required(latest.sma_200, "sma_200")?;
    let vol_30d = required(latest.vol_30d, "vol_30d")?;
    let rsi_14 = required(latest.rsi_14, "rsi_14")?;
    let drawdown = required(latest.drawdown, "drawdown")?;

    let trend = if sma_50 > sma_200 { Trend::Up } else { Trend::Down };
    let volatility_state = if vol_30d > HIGH_VOLATILITY_THRESHOLD {
        VolatilityState::High
    } else {
        VolatilityState::Low
    };
    let regime = if (rsi_14 - 50.0).abs() > TRENDING_RSI_DISTANCE {
        Regime::Trending
    } else {
        Regime::Ranging
    };

    let summary = format!(
        "Price ${:.2}. Volatility is {} ({:.1}%). RSI at {:.1} suggests {} behavior.",
        latest.price,
        volatility_state.as_str(),
        vol_30d * 100.0,
        rsi_14,
        regime.as_str().to_ascii_lowercase()
    );

    Ok(MarketInsight {
        asset: asset.symbol.clone(),
        as_of_ts_ms_utc: latest.ts_ms_utc,
        trend,
        volatility_state,
        regime,
        drawdown_pct: drawdown,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sma_50: f64, sma_200: f64, vol_30d: f64, rsi_14: f64) -> EnrichedRow {
        EnrichedRow {
            ts_ms_utc: 1_704_067_200_000,
            price: 42_123.456,
            market_cap: 8.0e11,
            total_volume: 2.0e10,
            log_ret: Some(0.01),
            vol_7d: Some(0.02),
            vol_30d: Some(vol_30d),
            rsi_14: Some(rsi_14),
            sma_50: Some(sma_50),
            sma_200: Some(sma_200),
            trend_signal: Some(if sma_50 > sma_200 { 1.0 } else { 0.0 }),
            drawdown: Some(-0.12),
            vol_change_5d: Some(0.1),
            target_next_day_up: None,
        }
    }

    #[test]
    fn classifies_trend_volatility_and_regime() {
        let asset = Asset::new("btc", "Bitcoin", "bitcoin");
        let insight = derive_insight(&asset, &[row(110.0, 100.0, 0.062, 72.0)]).unwrap();
        assert_eq!(insight.trend, Trend::Up);
        assert_eq!(insight.volatility_state, VolatilityState::High);
        assert_eq!(insight.regime, Regime::Trending);
        assert_eq!(insight.drawdown_pct, -0.12);
        assert_eq!(
            insight.summary,
            "Price $42123.46. Volatility is HIGH (6.2%). RSI at 72.0 suggests trending behavior."
        );
    }

    #[test]
    fn boundary_values_fall_to_the_quiet_side() {
        let asset = Asset::new("eth", "Ethereum", "ethereum");
        let insight = derive_insight(&asset, &[row(100.0, 100.0, 0.05, 60.0)]).unwrap();
        assert_eq!(insight.trend, Trend::Down);
        assert_eq!(insight.volatility_state, VolatilityState::Low);
        assert_eq!(insight.regime, Regime::Ranging);
    }

    #[test]
    fn missing_long_average_is_reported() {
        let asset = Asset::new("sol", "Solana", "solana");
        let mut latest = row(1.0, 1.0, 0.01, 50.0);
        latest.sma_200 = None;
        assert_eq!(
            derive_insight(&asset, &[latest]).unwrap_err(),
            InsightError::MissingFeature("sma_200")
        );
        assert_eq!(derive_insight(&asset, &[]).unwrap_err(), InsightError::NoRows);
    }
}

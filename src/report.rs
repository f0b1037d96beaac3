//! Markdown and JSON run reports.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::insights::MarketInsight;
use crate::signal::Prediction;
use crate::storage::{write_atomic, StorageError};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Write(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    generated_at: String,
    predictions: &'a [Prediction],
    insights: &'a [MarketInsight],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportGenerator {
    report_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Writes both formats under one timestamp stem.
    pub fn write_reports(
        &self,
        insights: &[MarketInsight],
        predictions: &[Prediction],
    ) -> Result<ReportPaths, ReportError> {
        let generated_at = Utc::now();
        let paths = ReportPaths {
            markdown: self.generate_markdown(insights, predictions, generated_at)?,
            json: self.generate_json(insights, predictions, generated_at)?,
        };
        info!(
            component = "report",
            event = "report.written",
            markdown = %paths.markdown.display(),
            json = %paths.json.display(),
            predictions = predictions.len(),
            insights = insights.len()
        );
        Ok(paths)
    }

    pub fn generate_markdown(
        &self,
        insights: &[MarketInsight],
        predictions: &[Prediction],
        generated_at: DateTime<Utc>,
    ) -> Result<PathBuf, ReportError> {
        let path = self.report_path(generated_at, "md");
        fs::create_dir_all(&self.report_dir)?;
        write_atomic(&path, render_markdown(insights, predictions, generated_at).as_bytes())?;
        Ok(path)
    }

    pub fn generate_json(
        &self,
        insights: &[MarketInsight],
        predictions: &[Prediction],
        generated_at: DateTime<Utc>,
    ) -> Result<PathBuf, ReportError> {
        let path = self.report_path(generated_at, "json");
        fs::create_dir_all(&self.report_dir)?;
        let document = ReportDocument {
            generated_at: generated_at.to_rfc3339(),
            predictions,
            insights,
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&document)?)?;
        Ok(path)
    }

    /// Stamped to the millisecond.
    fn report_path(&self, generated_at: DateTime<Utc>, extension: &str) -> PathBuf {
        self.report_dir.join(format!(
            "report_{}.{extension}",
            generated_at.format("%Y%m%d_%H%M%S_%3f")
        ))
    }
}

fn day_label(ts_ms_utc: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts_ms_utc.to_string())
}

pub fn render_markdown(
    insights: &[MarketInsight],
    predictions: &[Prediction],
    generated_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# TrendLab Market Report\n");
    let _ = writeln!(
        out,
        "Generated: {}\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let _ = writeln!(out, "## Predictions (next day)\n");
    if predictions.is_empty() {
        let _ = writeln!(out, "_No predictions were produced._\n");
    } else {
        let _ = writeln!(
            out,
            "| Asset | As of | Model | P(up) | Signal | Confidence | CV accuracy | CV precision | CV AUC | CV log-loss |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|---|---|");
        for p in predictions {
            let m = p.supporting_metrics();
            let _ = writeln!(
                out,
                "| {} | {} | {} | {:.3} | {} | {:.2} | {:.3} | {:.3} | {:.3} | {:.3} |",
                p.asset().to_ascii_uppercase(),
                day_label(p.as_of_ts_ms_utc()),
                p.model_name(),
                p.probability_up(),
                p.signal(),
                p.confidence_score(),
                m.accuracy,
                m.precision,
                m.auc,
                m.log_loss
            );
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Market Insights\n");
    if insights.is_empty() {
        let _ = writeln!(out, "_No insights were produced._");
    }
    for insight in insights {
        let _ = writeln!(
            out,
            "### {} ({})\n",
            insight.asset.to_ascii_uppercase(),
            day_label(insight.as_of_ts_ms_utc)
        );
        let _ = writeln!(out, "- Trend: {}", insight.trend.as_str());
        let _ = writeln!(out, "- Volatility: {}", insight.volatility_state.as_str());
        let _ = writeln!(out, "- Regime: {}", insight.regime.as_str());
        let _ = writeln!(out, "- Drawdown: {:.1}%\n", insight.drawdown_pct * 100.0);
        let _ = writeln!(out, "{}\n", insight.summary);
    }

    out
}

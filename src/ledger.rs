//! Append-only SQLite history of issued predictions.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::signal::Prediction;
use crate::validation::Metrics;

pub const DEFAULT_RECENT_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics encoding error: {0}")]
    Metrics(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub recorded_at_ms_utc: i64,
    pub prediction: Prediction,
}

pub struct PredictionLedger {
    conn: Connection,
}

impl PredictionLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at_ms INTEGER NOT NULL,
                asset TEXT NOT NULL,
                as_of_ts_ms_utc INTEGER NOT NULL,
                model_name TEXT NOT NULL,
                horizon_days INTEGER NOT NULL,
                probability_up REAL NOT NULL,
                signal TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                metrics_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_asset
                ON predictions (asset, as_of_ts_ms_utc);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn append(&self, prediction: &Prediction) -> Result<i64, LedgerError> {
        let metrics_json = serde_json::to_string(prediction.supporting_metrics())?;
        self.conn.execute(
            "
            INSERT INTO predictions (
                recorded_at_ms,
                asset,
                as_of_ts_ms_utc,
                model_name,
                horizon_days,
                probability_up,
                signal,
                confidence_score,
                metrics_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                Utc::now().timestamp_millis(),
                prediction.asset(),
                prediction.as_of_ts_ms_utc(),
                prediction.model_name(),
                prediction.horizon_days(),
                prediction.probability_up(),
                prediction.signal().as_str(),
                prediction.confidence_score(),
                metrics_json,
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        debug!(
            component = "ledger",
            event = "ledger.append",
            id,
            asset = prediction.asset()
        );
        Ok(id)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, recorded_at_ms, asset, as_of_ts_ms_utc, model_name,
                   probability_up, metrics_json
            FROM predictions
            ORDER BY id DESC
            LIMIT ?1
            ",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raw = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;

        raw.into_iter()
            .map(
                |(id, recorded_at_ms_utc, asset, as_of, model_name, probability_up, metrics_json)|
                 -> Result<LedgerEntry, LedgerError> {
                    let metrics: Metrics = serde_json::from_str(&metrics_json)?;
                    Ok(LedgerEntry {
                        id,
                        recorded_at_ms_utc,
                        prediction: Prediction::new(asset, as_of, model_name, probability_up, metrics),
                    })
                },
            )
            .collect()
    }

    pub fn count(&self) -> Result<u64, LedgerError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM predictions", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use tempfile::tempdir;

    #[test]
    fn appends_and_reads_back_newest_first() {
        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::open(&dir.path().join("nested/ledger.sqlite")).unwrap();

        let metrics = Metrics {
            accuracy: 0.55,
            precision: 0.6,
            auc: 0.58,
            log_loss: 0.69,
        };
        ledger
            .append(&Prediction::new("btc", 1_000, "logistic", 0.61, metrics))
            .unwrap();
        ledger
            .append(&Prediction::new("eth", 2_000, "boosting", 0.40, metrics))
            .unwrap();
        assert_eq!(ledger.count().unwrap(), 2);

        let recent = ledger.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].prediction.asset(), "eth");
        assert_eq!(recent[0].prediction.signal(), Signal::Bearish);
        assert_eq!(recent[1].prediction.supporting_metrics(), &metrics);

        assert_eq!(ledger.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn reopening_keeps_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let ledger = PredictionLedger::open(&path).unwrap();
            ledger
                .append(&Prediction::new("sol", 5, "logistic", 0.5, Metrics::default()))
                .unwrap();
        }
        let ledger = PredictionLedger::open(&path).unwrap();
        assert_eq!(ledger.count().unwrap(), 1);
    }
}

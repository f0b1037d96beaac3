//! Per-asset orchestration: fetch, features, train and infer, insights, report.

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::coingecko::{CoinGeckoProvider, FetchError, MarketDataProvider};
use crate::config::AppConfig;
use crate::features::{compute_features, create_dataset};
use crate::insights::{derive_insight, InsightError, MarketInsight};
use crate::ledger::{LedgerError, PredictionLedger};
use crate::market::Asset;
use crate::model::{ModelEngine, ModelError, ModelVariant};
use crate::report::{ReportError, ReportGenerator, ReportPaths};
use crate::signal::{infer_latest, InferenceError, Prediction};
use crate::storage::{ArrowSeriesStore, SeriesStore, StorageError};
use crate::validation::TimeSeriesSplit;

/// Failure confined to one asset. None of these stop the other assets.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("data unavailable: {0}")]
    Fetch(#[from] FetchError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("insufficient history: none of {rows} rows is fully defined")]
    InsufficientHistory { rows: usize },
    #[error("training failed: {0}")]
    Model(#[from] ModelError),
    #[error("inference blocked: {0}")]
    Inference(#[from] InferenceError),
    #[error("insight unavailable: {0}")]
    Insight(#[from] InsightError),
}

impl AssetError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "data_unavailable",
            Self::Storage(_) => "storage",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::Model(_) => "model",
            Self::Inference(_) => "inference_blocked",
            Self::Insight(_) => "insight",
        }
    }
}

/// Run-level failures: setup and report writing.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data source setup failed: {0}")]
    Provider(#[from] FetchError),
    #[error("prediction ledger failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("report generation failed: {0}")]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Features,
    Inference,
    Insights,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Features => "features",
            Self::Inference => "inference",
            Self::Insights => "insights",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedAsset {
    pub asset: String,
    pub stage: Stage,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport<T> {
    pub completed: Vec<T>,
    pub skipped: Vec<SkippedAsset>,
}

impl<T> Default for StageReport<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    NoValidAssets,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NoValidAssets => 1,
            Self::PartialSuccess => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub assets: Vec<String>,
    pub predictions: Vec<Prediction>,
    pub insights: Vec<MarketInsight>,
    pub skipped: Vec<SkippedAsset>,
    pub reports: Option<ReportPaths>,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        if self.assets.is_empty() {
            RunStatus::NoValidAssets
        } else if self.skipped.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::PartialSuccess
        }
    }
}

pub struct PipelineService {
    provider: Box<dyn MarketDataProvider>,
    store: Box<dyn SeriesStore>,
    reporter: ReportGenerator,
    ledger: Option<PredictionLedger>,
    splitter: TimeSeriesSplit,
}

impl PipelineService {
    pub fn new(
        provider: Box<dyn MarketDataProvider>,
        store: Box<dyn SeriesStore>,
        reporter: ReportGenerator,
    ) -> Self {
        Self {
            provider,
            store,
            reporter,
            ledger: None,
            splitter: TimeSeriesSplit::default(),
        }
    }

    /// CoinGecko source, Arrow store and report directory from `cfg`, plus the
    /// ledger when one is configured.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, PipelineError> {
        let provider = CoinGeckoProvider::new(cfg.coingecko.clone())?;
        let service = Self::new(
            Box::new(provider),
            Box::new(ArrowSeriesStore::new(&cfg.data_dir)),
            ReportGenerator::new(&cfg.report_dir),
        );
        match &cfg.ledger_path {
            Some(path) => Ok(service.with_ledger(PredictionLedger::open(path)?)),
            None => Ok(service),
        }
    }

    pub fn with_ledger(mut self, ledger: PredictionLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_splitter(mut self, splitter: TimeSeriesSplit) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn ledger(&self) -> Option<&PredictionLedger> {
        self.ledger.as_ref()
    }

    pub fn fetch_data(&self, assets: &[Asset], days: u32) -> StageReport<Asset> {
        run_stage(Stage::Fetch, assets, |asset| {
            let series = self.provider.fetch_history(asset, days)?;
            self.store.save_raw(&asset.symbol, &series)?;
            Ok(asset.clone())
        })
    }

    pub fn build_features(&self, assets: &[Asset]) -> StageReport<Asset> {
        run_stage(Stage::Features, assets, |asset| {
            let raw = self.store.load_raw(&asset.symbol)?;
            let rows = compute_features(&raw);
            self.store.save_features(&asset.symbol, &rows)?;
            Ok(asset.clone())
        })
    }

    pub fn run_inference(&self, assets: &[Asset], variant: ModelVariant) -> StageReport<Prediction> {
        run_stage(Stage::Inference, assets, |asset| {
            let prediction = self.infer_asset(asset, variant)?;
            if let Some(ledger) = &self.ledger {
                if let Err(err) = ledger.append(&prediction) {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.ledger.append_failed",
                        asset = %asset.symbol,
                        error = %err
                    );
                }
            }
            Ok(prediction)
        })
    }

    fn infer_asset(&self, asset: &Asset, variant: ModelVariant) -> Result<Prediction, AssetError> {
        let rows = self.store.load_features(&asset.symbol)?;
        let dataset = create_dataset(&rows);
        if dataset.is_empty() {
            return Err(AssetError::InsufficientHistory { rows: rows.len() });
        }

        let mut engine = ModelEngine::new(variant).with_splitter(self.splitter);
        let metrics = engine.train_dataset(&dataset)?;
        Ok(infer_latest(&engine, &rows, asset, metrics)?)
    }

    pub fn generate_insights(&self, assets: &[Asset]) -> StageReport<MarketInsight> {
        run_stage(Stage::Insights, assets, |asset| {
            let rows = self.store.load_features(&asset.symbol)?;
            Ok(derive_insight(asset, &rows)?)
        })
    }

    /// Every stage in order. An asset that fails a stage is not carried into
    /// the following ones; insights only need built features.
    pub fn run_full_pipeline(
        &self,
        assets: &[Asset],
        days: u32,
        variant: ModelVariant,
    ) -> Result<RunSummary, PipelineError> {
        let symbols: Vec<String> = assets.iter().map(|asset| asset.symbol.clone()).collect();
        info!(
            component = "pipeline",
            event = "pipeline.run.start",
            assets = ?symbols,
            days,
            model = variant.as_str()
        );

        if assets.is_empty() {
            warn!(
                component = "pipeline",
                event = "pipeline.run.no_assets",
                "no valid assets to process"
            );
            return Ok(RunSummary {
                assets: symbols,
                predictions: Vec::new(),
                insights: Vec::new(),
                skipped: Vec::new(),
                reports: None,
            });
        }

        let mut skipped = Vec::new();

        let fetched = self.fetch_data(assets, days);
        skipped.extend(fetched.skipped);

        let built = self.build_features(&fetched.completed);
        skipped.extend(built.skipped);

        let inferred = self.run_inference(&built.completed, variant);
        skipped.extend(inferred.skipped);

        let insights = self.generate_insights(&built.completed);
        skipped.extend(insights.skipped);

        let reports = self
            .reporter
            .write_reports(&insights.completed, &inferred.completed)?;

        let summary = RunSummary {
            assets: symbols,
            predictions: inferred.completed,
            insights: insights.completed,
            skipped,
            reports: Some(reports),
        };

        info!(
            component = "pipeline",
            event = "pipeline.run.finish",
            status = ?summary.status(),
            predictions = summary.predictions.len(),
            insights = summary.insights.len(),
            skipped = summary.skipped.len()
        );
        Ok(summary)
    }
}

fn run_stage<T>(
    stage: Stage,
    assets: &[Asset],
    mut step: impl FnMut(&Asset) -> Result<T, AssetError>,
) -> StageReport<T> {
    let mut report = StageReport::default();
    for asset in assets {
        match step(asset) {
            Ok(value) => report.completed.push(value),
            Err(err) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.asset.skipped",
                    asset = %asset.symbol,
                    stage = stage.as_str(),
                    kind = err.kind(),
                    error = %err
                );
                report.skipped.push(SkippedAsset {
                    asset: asset.symbol.clone(),
                    stage,
                    kind: err.kind(),
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

//! TrendLab core crate.
//!
//! Daily crypto market history in, next-day direction signals out:
//! - look-ahead-free indicator engine and dataset builder
//! - walk-forward trained classifiers (logistic regression, gradient boosting)
//! - per-asset orchestration with Arrow IPC persistence, SQLite ledger and reports

mod api;
mod classifiers;
mod coingecko;
mod config;
mod features;
mod insights;
mod ledger;
mod market;
mod model;
mod observability;
mod pipeline;
mod report;
mod signal;
mod storage;
mod validation;

pub use api::{
    api_router, ApiState, LedgerPredictionSource, PipelineLauncher, PredictionSource,
    RunLauncher, RunPlan, RunRequest, MAX_RECENT_LIMIT,
};
pub use classifiers::{
    to_matrix, BoostingConfig, GradientBoosting, LogisticConfig, LogisticRegression,
    StandardScaler,
};
pub use coingecko::{
    parse_market_chart, retry_delay_ms, CoinGeckoConfig, CoinGeckoProvider, FetchError,
    HttpFetcher, MarketDataProvider, ReqwestBlockingFetcher, DEFAULT_BASE_URL,
};
pub use config::{AppConfig, ConfigError, DEFAULT_API_ADDR, DEFAULT_HISTORY_DAYS};
pub use features::{
    assert_schema_compatible, build_feature_schema, compute_features, create_dataset,
    latest_feature_vector, EnrichedRow, FeatureColumn, FeatureDType, FeatureError, FeatureSchema,
    TrainingDataset, DRAWDOWN_WINDOW, FEATURE_COLUMNS, FEATURE_SCHEMA_VERSION, LABEL_COLUMN,
    RSI_FLAT_VALUE, RSI_PERIOD, SMA_FAST_WINDOW, SMA_SLOW_WINDOW, VOLUME_CHANGE_LAG,
    VOL_LONG_WINDOW, VOL_SHORT_WINDOW,
};
pub use insights::{
    derive_insight, InsightError, MarketInsight, Regime, Trend, VolatilityState,
    HIGH_VOLATILITY_THRESHOLD, TRENDING_RSI_DISTANCE,
};
pub use ledger::{LedgerEntry, LedgerError, PredictionLedger, DEFAULT_RECENT_LIMIT};
pub use market::{Asset, AssetRegistry, MarketDataPoint, RegistryError, ResolvedAssets};
pub use model::{
    evaluate_walk_forward, CrossValidation, FittedClassifier, FittedPipeline, FoldReport,
    ModelEngine, ModelError, ModelVariant,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_config_loaded, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    AssetError, PipelineError, PipelineService, RunStatus, RunSummary, SkippedAsset, Stage,
    StageReport,
};
pub use report::{render_markdown, ReportError, ReportGenerator, ReportPaths};
pub use signal::{
    confidence_score, infer_latest, InferenceError, Prediction, Signal, BEARISH_THRESHOLD,
    BULLISH_THRESHOLD, HORIZON_DAYS,
};
pub use storage::{ArrowSeriesStore, SeriesStore, StorageError};
pub use validation::{
    accuracy, fold_metrics, log_loss, precision, roc_auc, Fold, FoldMetrics, Metrics,
    TimeSeriesSplit, DEFAULT_N_SPLITS,
};

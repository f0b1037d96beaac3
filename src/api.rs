//! HTTP surface: health checks, run triggering and prediction history.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DEFAULT_HISTORY_DAYS};
use crate::ledger::{LedgerEntry, LedgerError, PredictionLedger, DEFAULT_RECENT_LIMIT};
use crate::market::{Asset, AssetRegistry};
use crate::model::ModelVariant;
use crate::pipeline::PipelineService;
use crate::signal::HORIZON_DAYS;

pub const MAX_RECENT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub assets: Vec<String>,
    pub days: u32,
    pub horizon: u32,
    pub model: String,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            assets: vec!["btc".to_string(), "eth".to_string()],
            days: DEFAULT_HISTORY_DAYS,
            horizon: HORIZON_DAYS,
            model: ModelVariant::default().as_str().to_string(),
        }
    }
}

/// A validated run, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub assets: Vec<Asset>,
    pub days: u32,
    pub variant: ModelVariant,
}

/// Starts a run without waiting for it.
pub trait RunLauncher: Send + Sync + 'static {
    fn launch(&self, plan: RunPlan);
}

pub trait PredictionSource: Send + Sync + 'static {
    fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Runs the full pipeline on the blocking pool, one service per run.
pub struct PipelineLauncher {
    config: AppConfig,
}

impl PipelineLauncher {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

impl RunLauncher for PipelineLauncher {
    fn launch(&self, plan: RunPlan) {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let service = match PipelineService::from_config(&config) {
                Ok(service) => service,
                Err(err) => {
                    error!(
                        component = "api",
                        event = "api.run.setup_failed",
                        error = %err
                    );
                    return;
                }
            };
            match service.run_full_pipeline(&plan.assets, plan.days, plan.variant) {
                Ok(summary) => info!(
                    component = "api",
                    event = "api.run.complete",
                    status = ?summary.status(),
                    predictions = summary.predictions.len(),
                    skipped = summary.skipped.len()
                ),
                Err(err) => error!(
                    component = "api",
                    event = "api.run.failed",
                    error = %err
                ),
            }
        });
    }
}

pub struct LedgerPredictionSource {
    path: PathBuf,
}

impl LedgerPredictionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PredictionSource for LedgerPredictionSource {
    fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        PredictionLedger::open(&self.path)?.recent(limit)
    }
}

#[derive(Clone)]
pub struct ApiState {
    registry: Arc<AssetRegistry>,
    launcher: Arc<dyn RunLauncher>,
    predictions: Option<Arc<dyn PredictionSource>>,
}

impl ApiState {
    pub fn new(registry: AssetRegistry, launcher: Arc<dyn RunLauncher>) -> Self {
        Self {
            registry: Arc::new(registry),
            launcher,
            predictions: None,
        }
    }

    pub fn with_predictions(mut self, source: Arc<dyn PredictionSource>) -> Self {
        self.predictions = Some(source);
        self
    }

    /// Launcher and ledger reader backed by `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let state = Self::new(
            config.registry.clone(),
            Arc::new(PipelineLauncher::new(config.clone())),
        );
        match &config.ledger_path {
            Some(path) => state.with_predictions(Arc::new(LedgerPredictionSource::new(path))),
            None => state,
        }
    }
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/live", get(get_live))
        .route("/run", post(post_run))
        .route("/predictions", get(get_predictions))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn get_live() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn post_run(State(state): State<ApiState>, Json(request): Json<RunRequest>) -> Response {
    let variant = match ModelVariant::parse(&request.model) {
        Ok(variant) => variant,
        Err(err) => {
            warn!(
                component = "api",
                event = "api.run.rejected",
                reason = "unknown_model",
                model = %request.model
            );
            return error_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    };
    if request.horizon != HORIZON_DAYS {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("only a {HORIZON_DAYS}-day horizon is supported"),
        );
    }
    if request.days == 0 {
        return error_response(StatusCode::BAD_REQUEST, "days must be at least 1");
    }

    let resolved = state.registry.resolve(&request.assets);
    for unknown in &resolved.unknown {
        warn!(
            component = "api",
            event = "api.run.unknown_asset",
            asset = %unknown
        );
    }
    if resolved.assets.is_empty() {
        warn!(
            component = "api",
            event = "api.run.rejected",
            reason = "no_valid_assets",
            requested = ?request.assets
        );
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "no valid assets supplied",
                "unknown": resolved.unknown,
                "supported": state.registry.symbols(),
            })),
        )
            .into_response();
    }

    let symbols: Vec<String> = resolved
        .assets
        .iter()
        .map(|asset| asset.symbol.clone())
        .collect();
    info!(
        component = "api",
        event = "api.run.accepted",
        assets = ?symbols,
        days = request.days,
        model = variant.as_str()
    );
    state.launcher.launch(RunPlan {
        assets: resolved.assets,
        days: request.days,
        variant,
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "processing",
            "message": "Pipeline run triggered",
            "config": request,
            "assets": symbols,
            "unknown": resolved.unknown,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct PredictionsQuery {
    limit: Option<usize>,
}

async fn get_predictions(
    State(state): State<ApiState>,
    Query(query): Query<PredictionsQuery>,
) -> Response {
    let Some(source) = state.predictions.clone() else {
        return error_response(StatusCode::NOT_FOUND, "prediction ledger is disabled");
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    match tokio::task::spawn_blocking(move || source.recent(limit)).await {
        Ok(Ok(entries)) => Json(json!({ "predictions": entries })).into_response(),
        Ok(Err(err)) => {
            error!(
                component = "api",
                event = "api.predictions.failed",
                error = %err
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

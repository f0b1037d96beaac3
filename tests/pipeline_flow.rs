use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use trendlab::{
    Asset, AssetRegistry, ArrowSeriesStore, FetchError, MarketDataPoint, MarketDataProvider,
    ModelVariant, PipelineService, PredictionLedger, ReportGenerator, RunStatus, SeriesStore,
    Signal, Stage,
};

const START_TS_MS: i64 = 1_672_531_200_000;
const DAY_MS: i64 = 86_400_000;

fn wavy_series(days: usize, phase: f64) -> Vec<MarketDataPoint> {
    (0..days)
        .map(|i| {
            let t = i as f64;
            let price = 100.0 + 0.04 * t + 5.0 * (t * 0.31 + phase).sin() + 2.0 * (t * 1.77).cos();
            MarketDataPoint {
                ts_ms_utc: START_TS_MS + i as i64 * DAY_MS,
                price,
                market_cap: price * 1.0e7,
                total_volume: 5.0e8 + (i % 9) as f64 * 2.0e7,
            }
        })
        .collect()
}

/// Serves canned histories keyed by provider id; unknown ids answer 404.
#[derive(Clone, Default)]
struct CannedProvider {
    series: HashMap<String, Vec<MarketDataPoint>>,
    calls: Arc<Mutex<Vec<(String, u32)>>>,
}

impl CannedProvider {
    fn with(mut self, provider_id: &str, series: Vec<MarketDataPoint>) -> Self {
        self.series.insert(provider_id.to_string(), series);
        self
    }
}

impl MarketDataProvider for CannedProvider {
    fn fetch_history(&self, asset: &Asset, days: u32) -> Result<Vec<MarketDataPoint>, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((asset.provider_id.clone(), days));
        self.series
            .get(&asset.provider_id)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: format!("mock://{}", asset.provider_id),
                status: 404,
            })
    }
}

fn assets(symbols: &[&str]) -> Vec<Asset> {
    let resolved = AssetRegistry::default().resolve(symbols);
    assert!(resolved.unknown.is_empty());
    resolved.assets
}

fn service(provider: CannedProvider, root: &std::path::Path) -> PipelineService {
    PipelineService::new(
        Box::new(provider),
        Box::new(ArrowSeriesStore::new(root.join("data"))),
        ReportGenerator::new(root.join("reports")),
    )
}

#[test]
fn full_run_predicts_every_asset_and_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    let provider = CannedProvider::default()
        .with("bitcoin", wavy_series(320, 0.0))
        .with("ethereum", wavy_series(330, 1.3));
    let calls = Arc::clone(&provider.calls);
    let ledger = PredictionLedger::open(&dir.path().join("data/predictions.sqlite")).unwrap();
    let service = service(provider, dir.path()).with_ledger(ledger);

    let summary = service
        .run_full_pipeline(&assets(&["btc", "eth"]), 320, ModelVariant::Logistic)
        .unwrap();

    assert_eq!(summary.status(), RunStatus::Success);
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.predictions.len(), 2);
    assert_eq!(summary.insights.len(), 2);
    assert_eq!(
        *calls.lock().unwrap(),
        vec![("bitcoin".to_string(), 320), ("ethereum".to_string(), 320)]
    );

    for prediction in &summary.predictions {
        let p = prediction.probability_up();
        assert!((0.0..=1.0).contains(&p));
        assert_eq!(prediction.signal(), Signal::from_probability(p));
        assert_eq!(prediction.horizon_days(), 1);
        assert_eq!(prediction.model_name(), "logistic");
    }
    let btc = &summary.predictions[0];
    assert_eq!(btc.asset(), "btc");
    assert_eq!(btc.as_of_ts_ms_utc(), START_TS_MS + 319 * DAY_MS);

    let reports = summary.reports.as_ref().unwrap();
    let markdown = fs::read_to_string(&reports.markdown).unwrap();
    assert!(markdown.contains("| BTC |"));
    assert!(markdown.contains("| ETH |"));
    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(&reports.json).unwrap()).unwrap();
    assert_eq!(json["predictions"].as_array().unwrap().len(), 2);
    assert_eq!(json["insights"].as_array().unwrap().len(), 2);

    let ledger = service.ledger().unwrap();
    assert_eq!(ledger.count().unwrap(), 2);
    let recent = ledger.recent(10).unwrap();
    assert_eq!(recent[0].prediction.asset(), "eth");
    assert_eq!(recent[1].prediction.asset(), "btc");
    assert_eq!(recent[1].prediction.probability_up(), btc.probability_up());
    assert_eq!(recent[1].prediction.signal(), btc.signal());
}

#[test]
fn stage_outputs_land_in_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let provider = CannedProvider::default().with("bitcoin", wavy_series(240, 0.5));
    let service = service(provider, dir.path());
    let btc = assets(&["btc"]);

    let fetched = service.fetch_data(&btc, 240);
    assert_eq!(fetched.completed, btc);
    let built = service.build_features(&fetched.completed);
    assert!(built.skipped.is_empty());

    let store = ArrowSeriesStore::new(dir.path().join("data"));
    assert_eq!(store.load_raw("btc").unwrap().len(), 240);
    let rows = store.load_features("btc").unwrap();
    assert_eq!(rows.len(), 240);
    assert!(rows[239].sma_200.is_some());
    assert!(store.schema_path("btc").exists());
}

#[test]
fn failing_assets_are_skipped_and_the_rest_complete() {
    let dir = tempfile::tempdir().unwrap();
    let provider = CannedProvider::default()
        .with("bitcoin", wavy_series(320, 0.2))
        .with("solana", wavy_series(60, 0.7));
    let service = service(provider, dir.path());

    let summary = service
        .run_full_pipeline(&assets(&["btc", "sol", "ada"]), 365, ModelVariant::Boosting)
        .unwrap();

    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    assert_eq!(summary.status().exit_code(), 2);
    assert_eq!(summary.predictions.len(), 1);
    assert_eq!(summary.predictions[0].asset(), "btc");
    assert_eq!(summary.predictions[0].model_name(), "boosting");
    assert_eq!(summary.insights.len(), 1);

    let ada = summary.skipped.iter().find(|s| s.asset == "ada").unwrap();
    assert_eq!(ada.stage, Stage::Fetch);
    assert_eq!(ada.kind, "data_unavailable");
    assert_eq!(
        summary.skipped.iter().filter(|s| s.asset == "ada").count(),
        1
    );

    let sol: Vec<_> = summary.skipped.iter().filter(|s| s.asset == "sol").collect();
    assert_eq!(sol[0].stage, Stage::Inference);
    assert_eq!(sol[0].kind, "insufficient_history");
    assert_eq!(sol[1].stage, Stage::Insights);
    assert!(sol[1].reason.contains("sma_200"));

    assert!(summary.reports.is_some());
}

#[test]
fn undefined_latest_feature_blocks_inference_for_that_asset_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut eth = wavy_series(320, 1.3);
    // vol_change_5d on the last row divides by this volume.
    eth[314].total_volume = 0.0;
    let provider = CannedProvider::default()
        .with("bitcoin", wavy_series(320, 0.0))
        .with("ethereum", eth);
    let service = service(provider, dir.path());

    let summary = service
        .run_full_pipeline(&assets(&["btc", "eth"]), 320, ModelVariant::Logistic)
        .unwrap();

    let store = ArrowSeriesStore::new(dir.path().join("data"));
    let rows = store.load_features("eth").unwrap();
    assert_eq!(rows.len(), 320);
    assert_eq!(rows[319].vol_change_5d, None);

    let blocked: Vec<_> = summary
        .skipped
        .iter()
        .filter(|s| s.asset == "eth" && s.stage == Stage::Inference)
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].kind, "inference_blocked");
    assert!(blocked[0].reason.contains("vol_change_5d"));

    assert_eq!(summary.status(), RunStatus::PartialSuccess);
    assert_eq!(summary.predictions.len(), 1);
    assert_eq!(summary.predictions[0].asset(), "btc");
    assert!(summary.reports.is_some());
}

#[test]
fn inference_without_stored_features_is_a_storage_skip() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(CannedProvider::default(), dir.path());

    let report = service.run_inference(&assets(&["eth"]), ModelVariant::Logistic);
    assert!(report.completed.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].kind, "storage");
}

#[test]
fn empty_selection_reports_no_valid_assets_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let service = service(CannedProvider::default(), dir.path());

    let summary = service
        .run_full_pipeline(&[], 365, ModelVariant::Logistic)
        .unwrap();

    assert_eq!(summary.status(), RunStatus::NoValidAssets);
    assert_eq!(summary.status().exit_code(), 1);
    assert!(summary.reports.is_none());
    assert!(!dir.path().join("reports").exists());
}

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, warn};

use trendlab::{
    init_logging, log_app_start, log_config_loaded, logging_config_from_env, AppConfig, Asset,
    ModelVariant, PipelineService, Prediction, PredictionLedger, RunStatus, SkippedAsset,
    StageReport, DEFAULT_HISTORY_DAYS,
};

#[derive(Parser)]
#[command(
    name = "trendlab",
    author,
    version,
    about = "Crypto market intelligence and next-day prediction pipeline",
    long_about = None
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AssetArgs {
    /// Asset symbols (comma separated), e.g. btc,eth,sol
    #[arg(short, long, value_delimiter = ',', default_value = "btc,eth")]
    assets: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch historical market data from CoinGecko
    Fetch {
        #[command(flatten)]
        assets: AssetArgs,

        /// Days of history to fetch
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_DAYS)]
        days: u32,
    },
    /// Compute technical indicators from stored raw data
    BuildFeatures {
        #[command(flatten)]
        assets: AssetArgs,
    },
    /// Train models on stored features and print next-day signals
    Train {
        #[command(flatten)]
        assets: AssetArgs,

        /// Model type: logistic or boosting
        #[arg(short, long, default_value = "logistic")]
        model: String,
    },
    /// Run the full pipeline end-to-end and write reports
    Run {
        #[command(flatten)]
        assets: AssetArgs,

        /// Days of history to fetch
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_DAYS)]
        days: u32,

        /// Model type: logistic or boosting
        #[arg(short, long, default_value = "logistic")]
        model: String,
    },
    /// Show recent predictions from the ledger
    Predictions {
        /// Number of entries, newest first
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging_cfg = logging_config_from_env();
    if cli.verbose {
        logging_cfg = logging_cfg.verbose();
    }
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    log_app_start("trendlab_cli", &logging_cfg);

    match run(cli.command) {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(err) => {
            error!(component = "trendlab_cli", event = "app.error", error = %err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    log_config_loaded("trendlab_cli", &config);

    match command {
        Commands::Fetch { assets, days } => {
            let Some(assets) = resolve_assets(&config, &assets) else {
                return Ok(RunStatus::NoValidAssets);
            };
            let service = PipelineService::from_config(&config)?;
            let report = service.fetch_data(&assets, days);
            println!("Fetched data for: {}", symbols(&report.completed));
            Ok(stage_status(&report))
        }
        Commands::BuildFeatures { assets } => {
            let Some(assets) = resolve_assets(&config, &assets) else {
                return Ok(RunStatus::NoValidAssets);
            };
            let service = PipelineService::from_config(&config)?;
            let report = service.build_features(&assets);
            println!("Feature engineering complete for: {}", symbols(&report.completed));
            Ok(stage_status(&report))
        }
        Commands::Train { assets, model } => {
            let variant = ModelVariant::parse(&model)?;
            let Some(assets) = resolve_assets(&config, &assets) else {
                return Ok(RunStatus::NoValidAssets);
            };
            let service = PipelineService::from_config(&config)?;
            let report = service.run_inference(&assets, variant);
            for prediction in &report.completed {
                print_prediction(prediction);
            }
            Ok(stage_status(&report))
        }
        Commands::Run {
            assets,
            days,
            model,
        } => {
            let variant = ModelVariant::parse(&model)?;
            let Some(assets) = resolve_assets(&config, &assets) else {
                return Ok(RunStatus::NoValidAssets);
            };
            let service = PipelineService::from_config(&config)?;
            let summary = service.run_full_pipeline(&assets, days, variant)?;
            for prediction in &summary.predictions {
                print_prediction(prediction);
            }
            print_skipped(&summary.skipped);
            if let Some(reports) = &summary.reports {
                println!("Report generated: {}", reports.markdown.display());
            }
            Ok(summary.status())
        }
        Commands::Predictions { limit } => {
            let Some(path) = &config.ledger_path else {
                println!("Prediction ledger is disabled (TRENDLAB_LEDGER_PATH=off).");
                return Ok(RunStatus::Success);
            };
            let ledger = PredictionLedger::open(path)?;
            for entry in ledger.recent(limit)? {
                print_prediction(&entry.prediction);
            }
            Ok(RunStatus::Success)
        }
    }
}

fn resolve_assets(config: &AppConfig, args: &AssetArgs) -> Option<Vec<Asset>> {
    let resolved = config.registry.resolve(&args.assets);
    for unknown in &resolved.unknown {
        warn!(
            component = "trendlab_cli",
            event = "cli.unknown_asset",
            asset = %unknown
        );
    }
    if resolved.assets.is_empty() {
        println!(
            "No valid assets selected. Supported: {}",
            config.registry.symbols().join(", ")
        );
        return None;
    }
    Some(resolved.assets)
}

fn stage_status<T>(report: &StageReport<T>) -> RunStatus {
    print_skipped(&report.skipped);
    if report.skipped.is_empty() {
        RunStatus::Success
    } else {
        RunStatus::PartialSuccess
    }
}

fn symbols(assets: &[Asset]) -> String {
    if assets.is_empty() {
        return "none".to_string();
    }
    assets
        .iter()
        .map(|asset| asset.symbol.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_prediction(p: &Prediction) {
    println!(
        "{}: {} ({:.1}% prob) - Conf: {:.2}",
        p.asset().to_ascii_uppercase(),
        p.signal(),
        p.probability_up() * 100.0,
        p.confidence_score()
    );
}

fn print_skipped(skipped: &[SkippedAsset]) {
    for entry in skipped {
        println!(
            "Skipped {} at {}: {}",
            entry.asset.to_ascii_uppercase(),
            entry.stage.as_str(),
            entry.reason
        );
    }
}

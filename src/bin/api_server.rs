use trendlab::{
    api_router, init_logging, log_app_bind, log_app_start, log_config_loaded,
    logging_config_from_env, ApiState, AppConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("api_server", &logging_cfg);

    let config = AppConfig::from_env()?;
    log_config_loaded("api_server", &config);

    let app = api_router(ApiState::from_config(&config));
    let listener = tokio::net::TcpListener::bind(config.api_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

use anyhow::Context;

use gitgauge_infra::AppConfig;
use gitgauge_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gitgauge_observability::init(&LogConfig::from_env());

    let config = AppConfig::from_env().context("loading configuration")?;
    let services = gitgauge_api::app::services::build_services(&config).await?;
    let app = gitgauge_api::app::build_app(services.jobs.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    services.workers.shutdown().await;
    Ok(())
}

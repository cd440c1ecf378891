use std::sync::Arc;

use anyhow::Context;

use orderflow_api::app::{build_app, services};
use orderflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        mode = config.mode.as_str(),
        namespace = %config.namespace,
        topic = %config.base_topic,
        "starting orderflow"
    );

    let services = Arc::new(services::build_services(&config)?);
    let app = build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(config.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("http server failed")?;

    tokio::task::spawn_blocking(move || services.shutdown())
        .await
        .context("worker shutdown panicked")?;
    Ok(())
}

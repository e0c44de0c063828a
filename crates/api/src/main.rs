use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use vayva_api::app::{build_router, services};
use vayva_infra::config::AppConfig;

const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vayva_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let services = Arc::new(
        services::build_services(&config)
            .await
            .context("failed to initialise stores")?,
    );
    let _purge = services::spawn_idempotency_purge(services.clone(), PURGE_INTERVAL);
    let app = build_router(services, &config.jwt_secret);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

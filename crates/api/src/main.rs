use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use orderflow_infra::store::StoreBackend;
use orderflow_infra::{Collaborators, Infrastructure, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;

    let infra = Arc::new(
        Infrastructure::initialize(
            &settings,
            StoreBackend::Redis(settings.store.clone()),
            Collaborators::local(&settings.storage_root),
        )
        .await,
    );

    let app = orderflow_api::app::build_app(infra.clone(), settings.rate_limits);
    let listener = tokio::net::TcpListener::bind(settings.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.http_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    // Stop accepting requests first, then wind the infrastructure down.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(orderflow_api::shutdown::signal())
    .await
    .context("http server failed")?;

    infra.shutdown(settings.shutdown_grace).await;
    Ok(())
}

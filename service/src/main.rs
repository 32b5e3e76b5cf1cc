use anyhow::Context;
use signalcraft_service::build_router;
use signalcraft_service::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_addr = config.bind_addr;
    let router = build_router(config).context("failed to initialize storage")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(%bind_addr, "signalcraft service listening");
    axum::serve(listener, router)
        .await
        .context("server terminated unexpectedly")?;
    Ok(())
}

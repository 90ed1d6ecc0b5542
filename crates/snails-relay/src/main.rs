use tracing::info;
use tracing_subscriber::EnvFilter;

use snails_relay::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,snails_relay=debug")),
        )
        .init();

    info!("Starting SNAILS. relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    snails_relay::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    })
    .await
}

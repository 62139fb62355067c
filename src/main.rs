//! forgeloop - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the task API.

use forgeloop::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forgeloop=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, llm={}, max_iterations={}",
        config.llm.model,
        if config.llm.api_key.is_some() {
            "enabled"
        } else {
            "offline"
        },
        config.max_iterations
    );

    api::serve(config).await?;

    Ok(())
}

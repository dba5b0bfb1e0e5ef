use anyhow::{Context, Result};
use lectern::tts::CommandSynthesizer;
use lectern::Config;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!("Data directory: {:?}", config.data_dir);

    let synthesizer = Arc::new(CommandSynthesizer::new(
        config.tts_command.clone(),
        config.voices_dir.clone(),
    ));

    let bind = format!("{}:{}", config.host, config.port);
    let library = lectern::build(config, synthesizer)?;
    let app = lectern::api::router(library);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("could not bind {bind}"))?;
    tracing::info!("Listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

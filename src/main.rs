use std::sync::Arc;

use anyhow::Context;

use network_advisor::{
    server,
    utils::{setup_logging, LogConfig},
    AdvisorEngine, RawSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let raw = RawSettings::load().context("invalid configuration")?;
    setup_logging(LogConfig::with_level(&raw.log_level))?;

    let settings = raw.resolve();
    settings.validate().context("invalid configuration")?;

    tracing::info!(
        version = network_advisor::VERSION,
        settings = ?settings,
        "starting network-advisor"
    );

    let engine = AdvisorEngine::builder()
        .with_settings(settings)
        .build()
        .await
        .context("failed to initialize model")?;

    tracing::info!(
        device = %engine.device(),
        adapter = ?engine.adapter(),
        "model ready"
    );

    server::serve(Arc::new(engine)).await
}

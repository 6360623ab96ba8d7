//! Segmentation Prediction Service - Main Entry Point

use std::sync::Arc;

use anyhow::Context;
use api::{init_logging, run_server, Settings};
use inference_engine::TractLoader;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    init_logging(&settings.log);

    info!("=== Segserve v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Models from {} (*.{}), media at {}",
        settings.models.dir.display(),
        settings.models.extension,
        settings.media.root.display()
    );

    let loader = Arc::new(TractLoader::new(settings.tiling.patch_size));
    run_server(settings, loader).await.context("server error")?;

    Ok(())
}

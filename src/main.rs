// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

use anyhow::Result;
use vouchie_indexer::{
    IndexingApp, configuration::IndexerConfiguration, telemetry::setup_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = IndexerConfiguration::parse();
    setup_tracing(config.verbosity)?;

    let app = IndexingApp::build_app(&config).await?;

    // Run the indexing app.
    app.run().await?;

    Ok(())
}

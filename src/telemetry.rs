// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{filter::Targets, fmt, prelude::*};

/// Maps the verbosity flag of the CLI to a tracing level.
pub fn tracing_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn setup_tracing(verbosity: u8) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_line_number(false))
        .with(Targets::new().with_target("vouchie_indexer", tracing_level(verbosity)))
        .try_init()?;

    Ok(())
}

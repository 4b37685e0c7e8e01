// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

use crate::{
    CancellationToken, EventCollectorRunner, EventProcessor,
    api_rest::start_api_server,
    configuration::IndexerConfiguration,
    constants,
    contract::ContractDescriptionSource,
    error_codes,
    event_collector::CollectorSettings,
    event_processor::ProcessorSettings,
    metrics::MetricsHandle,
    model::canonical_address,
    storage::{DuckDBStorage, DuckDBStorageFactory, Storage},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::{signal::ctrl_c, sync::mpsc};
use tracing::{error, info, warn};

pub struct IndexingApp {
    pub config: IndexerConfiguration,
    pub storage: Arc<DuckDBStorage>,
    pub storage_for_api: Arc<DuckDBStorageFactory>,
    pub cancellation_token: CancellationToken,
    pub metrics: MetricsHandle,
    /// First block the collector fetches.
    pub start_block: u64,
}

impl IndexingApp {
    /// Builds a new instance of the indexing app using the configuration.
    pub async fn build_app(config: &IndexerConfiguration) -> Result<Self> {
        let cancellation_token = CancellationToken::default();

        // Instantiate the DB handlers, for the consumer task and the API server.
        let storage = DuckDBStorage::with_db(&config.database_path)?;
        let storage_for_api = Arc::new(DuckDBStorageFactory::from_storage(&storage)?);

        let contract = canonical_address(&config.contract_address);
        if let Err(e) = storage.bind_contract(&contract) {
            error!("{e}");
            std::process::exit(error_codes::ERROR_CODE_WRONG_INPUT_ARGUMENTS);
        }

        let start_block = Self::resume_block(&storage, config.start_block)?;

        let metrics = MetricsHandle::new(&config.metrics)
            .with_context(|| "Failed to set up the metrics registry")?;

        Ok(Self {
            config: config.clone(),
            storage: Arc::new(storage),
            storage_for_api,
            cancellation_token,
            metrics,
            start_block,
        })
    }

    /// Picks the block to start from: right after the checkpoint, or the configured one for a fresh database.
    fn resume_block(storage: &dyn Storage, configured_start_block: u64) -> Result<u64> {
        let last_block = storage.last_block()?;

        if last_block == 0 {
            info!("Starting the indexing from block {configured_start_block}");
            return Ok(configured_start_block);
        }

        if configured_start_block > last_block + 1 {
            warn!(
                "The database is synchronized up to block {last_block}, the start block {configured_start_block} is ignored"
            );
        }
        info!("Resuming the indexing from block {}", last_block + 1);
        Ok(last_block + 1)
    }

    /// Runs the indexing app.
    ///
    /// # Description
    ///
    /// Spawns the event processor, the collector, the API server and the metrics server, and waits until either
    /// a shutdown is requested or the indexing pipeline stops. A processor that gives up on an event ends the
    /// process with a distinct exit code, leaving the checkpoint at the last complete chunk.
    pub async fn run(&self) -> Result<()> {
        let contract = canonical_address(&self.config.contract_address);
        let (producer_buffer, consumer_buffer) = mpsc::channel(constants::DEFAULT_INDEXING_BUFFER);

        let event_collector_runner = EventCollectorRunner::new(
            &self.config.rpc_url,
            CollectorSettings {
                contract_address: self.config.contract_address,
                start_block: self.start_block,
                sync_mode: self.config.sync_mode.into(),
                block_range: self.config.block_range,
            },
            producer_buffer,
            self.cancellation_token.clone(),
            self.metrics.clone(),
        )?;

        let descriptions = Arc::new(ContractDescriptionSource::new(
            event_collector_runner.provider(),
            self.config.contract_address,
        ));

        let mut event_processor = EventProcessor::new(
            contract.clone(),
            self.storage.clone(),
            descriptions,
            consumer_buffer,
            self.cancellation_token.clone(),
            ProcessorSettings {
                missing_goal_policy: self.config.missing_goal_policy,
                max_event_retries: self.config.max_event_retries,
                retry_base_delay: Duration::from_millis(constants::DEFAULT_EVENT_RETRY_BASE_DELAY),
            },
            self.metrics.clone(),
        );

        info!(
            "Starting EventProcessor for contract {contract} (missing goals: {:?})",
            self.config.missing_goal_policy
        );
        let mut processor_handle = tokio::spawn(async move { event_processor.run().await });

        self.metrics
            .serve(self.config.metrics.clone())
            .await
            .with_context(|| "Failure in the metrics server")?;

        let api_server_address = format!(
            "{}:{}",
            self.config.api_server_address, self.config.api_server_port
        );
        start_api_server(
            api_server_address.as_str(),
            self.storage_for_api.clone(),
            self.cancellation_token.clone(),
        )
        .await
        .with_context(|| "Failure in the REST API server")?;

        info!("Starting the indexing of events");

        let mut collector_handle = tokio::spawn(event_collector_runner.run());

        // Spawn a task that handles Ctrl+C and signals the shutdown to every component.
        let ctrl_c_task = IndexingApp::spawn_ctrl_c_handler(self.cancellation_token.clone());

        tokio::select! {
            result = &mut processor_handle => {
                self.cancellation_token.graceful_shutdown();
                return Self::on_processor_exit(result);
            }
            result = &mut collector_handle => {
                match result {
                    Ok(Ok(())) => info!("Event collector stopped"),
                    Ok(Err(e)) => error!("Event collector stopped: {e:#}"),
                    Err(e) => error!("Event collector task failed: {e}"),
                }
                // The processor drains the chunks already sent and stops once the channel is empty.
                let result = processor_handle.await;
                self.cancellation_token.graceful_shutdown();
                Self::on_processor_exit(result)?;
                anyhow::bail!("The event collector stopped unexpectedly");
            }
            _ = ctrl_c_task => {
                // The processor stops between chunks, so the checkpoint stays consistent.
                let _ = processor_handle.await;
            }
        }

        info!("Shutdown complete");

        Ok(())
    }

    fn on_processor_exit(result: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Event processing failed, the indexer stops: {e:#}");
                std::process::exit(error_codes::ERROR_CODE_EVENT_PROCESSING_FAILED);
            }
            Err(e) => Err(anyhow::anyhow!("Event processor task failed: {e}")),
        }
    }

    fn spawn_ctrl_c_handler(cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            ctrl_c().await.ok();
            warn!("Received Ctrl+C, shutting down gracefully...");
            // Signal cancellation to every component.
            cancellation_token.graceful_shutdown();
        })
    }
}

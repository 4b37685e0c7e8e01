// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Library of the Vouchie indexer.
//!
//! The indexer follows the logs emitted by a VouchieVault contract and maintains three materialized
//! views on top of them: the goals, the activity feed and the per-user statistics.

pub mod api_rest;
pub mod cli;
pub mod configuration;
pub mod contract;
pub mod event_collector;
pub mod event_collector_runner;
pub use event_collector_runner::EventCollectorRunner;
pub mod event_processor;
pub use event_processor::EventProcessor;
pub mod handlers;
pub mod indexing_app;
pub use indexing_app::IndexingApp;
pub mod metrics;
pub mod model;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

/// Module with constants used throughout the application.
pub mod constants {
    /// Enables back pressure for the indexing buffer, as producers might overwhelm the buffer when the RPC server is powerful.
    pub const DEFAULT_INDEXING_BUFFER: usize = 10;
    /// Default interface for the API server.
    pub const DEFAULT_API_SERVER_ADDRESS: &str = "127.0.0.1";
    /// Default port for the API server.
    pub const DEFAULT_API_SERVER_PORT: u16 = 9720;
    /// Default poll interval in seconds when indexing the head of the chain.
    pub const DEFAULT_POLL_INTERVAL: u64 = 1;
    /// Default block range for the event collector. This range is used in the get_Logs call.
    pub const DEFAULT_BLOCK_RANGE: usize = 10;
    /// How many block ranges are requested in a single run of the collector.
    pub const CHUNK_MULTIPLIER: u64 = 5;
    /// Successful runs needed before restoring the default block range after throttling.
    pub const SUCCESSFUL_CHUNKS_THRESHOLD: u8 = 10;
    /// Maximum concurrent requests sent to the RPC server.
    pub const MAX_CONCURRENT_RPC_REQUESTS: usize = 4;
    /// Maximum number of retries for the RPC transport.
    pub const DEFAULT_BACKOFF_LAYER_MAX_RETRIES: u32 = 100;
    /// Backoff time in milliseconds for the RPC transport.
    pub const DEFAULT_BACKOFF_LAYER_BACKOFF_TIME: u64 = 2000;
    /// Compute units per second for the RPC transport.
    pub const DEFAULT_BACKOFF_LAYER_CUP_SIZE: u64 = 100;
    /// How many times a failing event is re-applied before the processor gives up.
    pub const DEFAULT_MAX_EVENT_RETRIES: u32 = 5;
    /// Base delay in milliseconds between attempts of a failing event. Doubles on every attempt.
    pub const DEFAULT_EVENT_RETRY_BASE_DELAY: u64 = 500;
    /// Path to the DuckDB database file.
    pub const DUCKDB_FILE_PATH: &str = "vouchie_indexer.duckdb";
    /// Schema version for the DuckDB database.
    pub const DUCKDB_SCHEMA_VERSION: &str = "0.1.0";
    /// Base table name for the DuckDB database.
    pub const DUCKDB_BASE_TABLE_NAME: &str = "vouchie_info";
    /// Default amount of rows returned by the listing endpoints.
    pub const DEFAULT_QUERY_LIMIT: usize = 20;
    /// Upper bound for the amount of rows returned by the listing endpoints.
    pub const MAX_QUERY_LIMIT: usize = 100;
    /// Default interface for the metrics server.
    pub const DEFAULT_METRICS_ADDRESS: &str = "127.0.0.1";
    /// Default port for the metrics server.
    pub const DEFAULT_METRICS_PORT: u16 = 5054;
}

/// Exit codes of the application.
pub mod error_codes {
    pub const ERROR_CODE_WRONG_INPUT_ARGUMENTS: i32 = 1;
    pub const ERROR_CODE_DATABASE_LOCKED: i32 = 2;
    pub const ERROR_CODE_FAILED_TO_LOAD_CONFIGURATION_FROM_FILE: i32 = 3;
    pub const ERROR_CODE_RPC_SYNCING: i32 = 4;
    pub const ERROR_CODE_EVENT_PROCESSING_FAILED: i32 = 5;
}

/// Module with definitions related to the storage of the indexed data.
pub mod storage {
    pub mod storage_api;
    pub use storage_api::{ApplyOutcome, Storage, StoreTx};
    pub mod storage_duckdb;
    pub use storage_duckdb::{DuckDBStorage, DuckDBStorageFactory};
    pub mod storage_query;
    pub use storage_query::{IndexerStatus, LeaderboardSort, StorageQuery};
}

/// Object that represents a chunk of logs coming from the eth_getLogs call.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub start_block: u64,
    pub end_block: u64,
    pub events: Vec<alloy::rpc::types::Log>,
}

pub type TxLogChunk = tokio::sync::mpsc::Sender<LogChunk>;
pub type RxLogChunk = tokio::sync::mpsc::Receiver<LogChunk>;
pub type RxCancellationToken = tokio::sync::broadcast::Receiver<()>;

/// Cancellation token for a graceful shutdown of the components of the indexer app.
#[derive(Clone)]
pub struct CancellationToken(tokio::sync::broadcast::Sender<()>);

impl Default for CancellationToken {
    fn default() -> Self {
        Self(tokio::sync::broadcast::Sender::new(1))
    }
}

impl CancellationToken {
    pub fn subscribe(&self) -> RxCancellationToken {
        self.0.subscribe()
    }

    pub fn graceful_shutdown(&self) {
        // No subscribers left means everything is already down.
        let _ = self.0.send(());
    }
}

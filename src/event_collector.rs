// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Module for the event collector.

use crate::{
    CancellationToken, LogChunk, TxLogChunk, constants::*, error_codes::ERROR_CODE_RPC_SYNCING,
    metrics::MetricsHandle,
};
use alloy::{
    eips::BlockNumberOrTag,
    primitives::Address,
    providers::Provider,
    rpc::types::{Filter, Log, SyncStatus},
};
use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

/// Error code returned by RPC servers when a get_logs request spans too many blocks or results.
const THROTTLE_ERROR_CODE: &str = "-32602";

/// What the collector indexes and how.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub contract_address: Address,
    /// First block to fetch.
    pub start_block: u64,
    /// Block tag that bounds the indexing, usually the finalized block.
    pub sync_mode: BlockNumberOrTag,
    pub block_range: usize,
}

/// Producer of [LogChunk]s for the logs of the VouchieVault contract.
///
/// # Description
///
/// The collector walks the chain from the start block up to the block given by the sync mode, requesting the logs
/// of the contract in block ranges. Several ranges are fetched concurrently, but the resulting chunks are always
/// sent in block order. Once the head is reached, the collector polls for new blocks.
#[derive(Clone)]
pub struct EventCollector {
    settings: CollectorSettings,
    contract_label: String,
    provider: Arc<dyn Provider + Send + Sync>,
    poll_interval: u64,
    producer_buffer: TxLogChunk,
    cancellation_token: CancellationToken,
    metrics: MetricsHandle,
    block_range_hint_regex: regex::Regex,
}

impl EventCollector {
    pub fn new(
        provider: Arc<dyn Provider + Send + Sync>,
        producer_buffer: TxLogChunk,
        settings: CollectorSettings,
        cancellation_token: CancellationToken,
        metrics: MetricsHandle,
    ) -> Result<Self> {
        // Regex to capture the last two integers (block numbers) from messages like:
        // "error code -32602: query exceeds max results 20000, retry with the range 22382105-22382515"
        let block_range_hint_regex = regex::Regex::new(r"(\d+)-(\d+)\s*$")?;

        Ok(Self {
            contract_label: settings.contract_address.to_string().to_ascii_lowercase(),
            settings,
            provider,
            poll_interval: DEFAULT_POLL_INTERVAL,
            producer_buffer,
            cancellation_token,
            metrics,
            block_range_hint_regex,
        })
    }

    /// Runs the collection until a shutdown is requested or the RPC server fails.
    pub async fn collect(&self) -> Result<()> {
        let mut shutdown = self.cancellation_token.subscribe();

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Event collector stopped by a shutdown request");
                Ok(())
            }
            result = self.collect_loop() => result,
        }
    }

    async fn collect_loop(&self) -> Result<()> {
        let contract_address = self.settings.contract_address;
        let default_block_range = self.settings.block_range.max(1) as u64;

        // The last block whose logs have been sent.
        let mut processed_to = self.settings.start_block.saturating_sub(1);
        // How many blocks per get_logs call.
        let mut chunk_length = default_block_range;
        // Counts how many successful runs have been processed since the last throttling.
        let mut successful_counter: u8 = 0;
        // Flag that indicates whether we are backfilling the database or following the head of the chain.
        let mut backfill_mode = true;

        loop {
            // A syncing node might serve inconsistent data that would end up in the database. A raw exit is
            // issued to stop all the running logic.
            if self.check_sync_status().await? {
                error!(
                    "The RPC server is syncing, resume indexing when the syncing process is complete"
                );
                std::process::exit(ERROR_CODE_RPC_SYNCING);
            }

            let head_block = match self.provider.get_block_by_number(self.settings.sync_mode).await {
                Ok(Some(block)) => block.header.number,
                Ok(None) => {
                    return Err(anyhow::anyhow!(
                        "The RPC server has no {} block",
                        self.settings.sync_mode
                    ));
                }
                Err(e) => {
                    error!("Failed to get the {} block from the RPC server: {e}", self.settings.sync_mode);
                    return Err(anyhow::anyhow!("RPC connection error: {e}"));
                }
            };
            self.metrics
                .record_chain_head_block(&self.contract_label, head_block);

            let Some((chunk_starts, step)) = plan_chunks(processed_to, head_block, chunk_length)
            else {
                // First time, we completed the backfill of the DB, let's inform the user.
                if backfill_mode {
                    info!("Backfill of the database completed, following the {} block", self.settings.sync_mode);
                }
                backfill_mode = false;
                sleep(Duration::from_secs(self.poll_interval)).await;
                continue;
            };

            let provider = self.provider.clone();

            // Fetch the prepared chunks of the chain history concurrently.
            // If an error is detected in the series, all the intermediate results are discarded, and the logic
            // proceeds to reduce the block range and retry the series.
            let fetched = stream::iter(chunk_starts.into_iter())
                .map(|chunk_start| {
                    let provider = provider.clone();

                    async move {
                        let chunk_end = std::cmp::min(chunk_start + chunk_length - 1, head_block);

                        debug!("Fetching logs for blocks [{chunk_start}-{chunk_end}]");

                        let filter = Filter::new()
                            .from_block(chunk_start)
                            .to_block(chunk_end)
                            .address(contract_address);

                        let mut events = provider.get_logs(&filter).await?;
                        fill_block_timestamps(provider.as_ref(), &mut events).await?;

                        Ok::<_, anyhow::Error>(LogChunk {
                            start_block: chunk_start,
                            end_block: chunk_end,
                            events,
                        })
                    }
                })
                .buffer_unordered(MAX_CONCURRENT_RPC_REQUESTS)
                .try_collect::<Vec<LogChunk>>()
                .await;

            let mut rpc_results = match fetched {
                Ok(results) => results,
                Err(e) => {
                    let err_msg = e.to_string();
                    debug!("Discarded block range: [{}-{step}]", processed_to + 1);

                    if !err_msg.contains(THROTTLE_ERROR_CODE) {
                        return Err(anyhow::anyhow!("Error received from the RPC server: {e}"));
                    }

                    let prev_chunk_length = chunk_length;
                    chunk_length =
                        throttled_block_range(&self.block_range_hint_regex, &err_msg, chunk_length);

                    if chunk_length == 0 {
                        return Err(anyhow::anyhow!(
                            "Block range reduced to zero, cannot continue the indexing."
                        ));
                    }

                    warn!(
                        "Throttled RPC server, reducing block range from {prev_chunk_length} to {chunk_length}"
                    );
                    successful_counter = 0;

                    continue;
                }
            };

            // No errors happened in the series of RPC requests. The chunks are handed to the consumer task in
            // block order, as the checkpoint follows the last chunk it receives.
            rpc_results.sort_by_key(|chunk| chunk.start_block);
            let total_events: usize = rpc_results.iter().map(|chunk| chunk.events.len()).sum();
            for chunk in rpc_results {
                self.producer_buffer.send(chunk).await?;
            }

            if total_events > 0 {
                info!(
                    "Collected {total_events} events for blocks [{}-{step}]",
                    processed_to + 1
                );
            }

            // If we reach the threshold of successful runs, we can restore the block range to the default value.
            if successful_counter == SUCCESSFUL_CHUNKS_THRESHOLD {
                chunk_length = default_block_range;
            }

            processed_to = step;
            successful_counter = successful_counter.saturating_add(1);
        }
    }

    async fn check_sync_status(&self) -> Result<bool> {
        let syncing = self.provider.syncing().await?;

        match syncing {
            SyncStatus::Info(_) => Ok(true),
            SyncStatus::None => Ok(false),
        }
    }
}

/// Splits the blocks after `processed_to` into the ranges of the next run.
///
/// # Description
///
/// A run covers up to [CHUNK_MULTIPLIER] ranges of `chunk_length` blocks, bounded by `head_block`. Returns the
/// first block of each range and the last block of the run, or `None` when there is nothing new to fetch.
pub fn plan_chunks(processed_to: u64, head_block: u64, chunk_length: u64) -> Option<(Vec<u64>, u64)> {
    let remaining = head_block.saturating_sub(processed_to);
    if remaining == 0 || chunk_length == 0 {
        return None;
    }

    let step = if remaining > CHUNK_MULTIPLIER * chunk_length {
        processed_to + CHUNK_MULTIPLIER * chunk_length
    } else {
        head_block
    };

    let chunk_starts = ((processed_to + 1)..=step)
        .step_by(chunk_length as usize)
        .collect::<Vec<u64>>();

    Some((chunk_starts, step))
}

/// Computes the block range to use after a throttling error.
///
/// Honors the `A-B` range hint some RPC servers append to the error, with a safety margin of 10%. Halves the
/// current range otherwise.
pub fn throttled_block_range(hint_regex: &regex::Regex, err_msg: &str, chunk_length: u64) -> u64 {
    let hinted = hint_regex.captures(err_msg).and_then(|captures| {
        let first: u64 = captures.get(1)?.as_str().parse().ok()?;
        let second: u64 = captures.get(2)?.as_str().parse().ok()?;
        let range = second.saturating_sub(first);
        Some(range - (range / 10))
    });

    hinted.unwrap_or(chunk_length >> 1)
}

/// Sets the block timestamp of the logs whose RPC server didn't include it, reading it from the block header.
async fn fill_block_timestamps(provider: &(dyn Provider + Send + Sync), logs: &mut [Log]) -> Result<()> {
    let mut timestamps: HashMap<u64, u64> = HashMap::new();

    for log in logs.iter_mut() {
        if log.block_timestamp.is_some() {
            continue;
        }
        let Some(block_number) = log.block_number else {
            continue;
        };

        let timestamp = match timestamps.get(&block_number) {
            Some(timestamp) => *timestamp,
            None => {
                let block = provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Block {block_number} not found"))?;
                timestamps.insert(block_number, block.header.timestamp);
                block.header.timestamp
            }
        };

        log.block_timestamp = Some(timestamp);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    //! Unit tests for the EventCollector.
    //!
    //! # Description
    //!
    //! The fetching loop needs a live RPC server; these tests cover the block range arithmetic it relies on.

    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn hint_regex() -> regex::Regex {
        regex::Regex::new(r"(\d+)-(\d+)\s*$").unwrap()
    }

    #[rstest]
    fn nothing_to_fetch_at_the_head() {
        assert_eq!(plan_chunks(100, 100, 10), None);
        assert_eq!(plan_chunks(120, 100, 10), None);
    }

    #[rstest]
    fn short_run_stops_at_the_head() {
        let (starts, step) = plan_chunks(100, 125, 10).unwrap();
        assert_eq!(starts, vec![101, 111, 121]);
        assert_eq!(step, 125);
    }

    #[rstest]
    fn long_run_is_bounded_by_the_multiplier() {
        let (starts, step) = plan_chunks(0, 1_000, 10).unwrap();
        assert_eq!(starts, vec![1, 11, 21, 31, 41]);
        assert_eq!(step, 50);
    }

    #[rstest]
    fn fresh_start_from_block_zero() {
        // start_block 0 means processed_to 0, so block 0 itself is never requested.
        let (starts, step) = plan_chunks(0, 3, 10).unwrap();
        assert_eq!(starts, vec![1]);
        assert_eq!(step, 3);
    }

    #[rstest]
    #[case::hinted(
        "error code -32602: query exceeds max results 20000, retry with the range 22382105-22382515",
        1_000,
        369
    )]
    #[case::no_hint("error code -32602: block range too large", 1_000, 500)]
    #[case::single_block("error code -32602: block range too large", 1, 0)]
    fn throttling_shrinks_the_range(
        hint_regex: regex::Regex,
        #[case] message: &str,
        #[case] current: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(throttled_block_range(&hint_regex, message, current), expected);
    }
}

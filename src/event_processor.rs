// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Module for the event processor.

use crate::{
    CancellationToken, LogChunk, RxCancellationToken, RxLogChunk,
    constants::*,
    contract::{ContractEvent, GoalDescriptionSource, IndexedEvent},
    handlers::{HandlerContext, MissingGoalPolicy},
    metrics::MetricsHandle,
    storage::{ApplyOutcome, Storage},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Tunables of the event processor.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub missing_goal_policy: MissingGoalPolicy,
    /// Attempts after the first one before giving up on an event.
    pub max_event_retries: u32,
    /// Delay before the first retry. Doubles on every attempt.
    pub retry_base_delay: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            missing_goal_policy: MissingGoalPolicy::default(),
            max_event_retries: DEFAULT_MAX_EVENT_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_EVENT_RETRY_BASE_DELAY),
        }
    }
}

/// Consumer of the chunks of logs produced by the event collector.
///
/// # Description
///
/// Chunks are processed one at a time, and the events of a chunk in chain order, so the views always reflect a
/// prefix of the contract history. Each event is committed on its own; the checkpoint moves to the end of a chunk
/// once all its events are committed. An event that keeps failing stops the processor, leaving the checkpoint at
/// the last complete chunk, so a restart delivers the failing event again.
pub struct EventProcessor<D: GoalDescriptionSource> {
    contract_address: String,
    storage: Arc<dyn Storage>,
    descriptions: Arc<D>,
    consumer_buffer: RxLogChunk,
    // Keeps the shutdown channel open for as long as the processor lives.
    _cancellation_token: CancellationToken,
    shutdown: RxCancellationToken,
    settings: ProcessorSettings,
    metrics: MetricsHandle,
}

impl<D: GoalDescriptionSource> EventProcessor<D> {
    pub fn new(
        contract_address: String,
        storage: Arc<dyn Storage>,
        descriptions: Arc<D>,
        consumer_buffer: RxLogChunk,
        cancellation_token: CancellationToken,
        settings: ProcessorSettings,
        metrics: MetricsHandle,
    ) -> Self {
        // Subscribing here means a shutdown requested before `run` is still observed.
        let shutdown = cancellation_token.subscribe();

        Self {
            contract_address,
            storage,
            descriptions,
            consumer_buffer,
            _cancellation_token: cancellation_token,
            shutdown,
            settings,
            metrics,
        }
    }

    /// Runs until the producers are gone, a shutdown is requested or an event can't be committed.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("Event processor stopped by a shutdown request");
                    break;
                }
                chunk = self.consumer_buffer.recv() => {
                    let Some(chunk) = chunk else {
                        info!("No more chunks to process");
                        break;
                    };
                    self.process_chunk(chunk).await?;
                }
            }
        }

        Ok(())
    }

    async fn process_chunk(&self, chunk: LogChunk) -> Result<()> {
        let LogChunk {
            start_block,
            end_block,
            mut events,
        } = chunk;

        debug!(
            "Processing {} logs of blocks [{start_block}-{end_block}]",
            events.len()
        );

        // Pending logs lack the position, those sort first and get dropped by the decoder.
        events.sort_by_key(|log| (log.block_number, log.log_index));

        for log in &events {
            let event = match IndexedEvent::from_log(log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    // A retry decodes the same bytes, so the log is counted and the chunk moves on.
                    error!(
                        "Skipping undecodable log {:?}-{:?}: {e}",
                        log.transaction_hash, log.log_index
                    );
                    self.metrics.record_degraded_event("decode_error");
                    continue;
                }
            };

            self.process_event(&event).await?;
        }

        self.storage
            .set_last_block(end_block)
            .with_context(|| format!("Failed to store the checkpoint at block {end_block}"))?;
        self.metrics
            .record_indexed_block(&self.contract_address, end_block);

        Ok(())
    }

    async fn process_event(&self, event: &IndexedEvent) -> Result<ApplyOutcome> {
        let context = HandlerContext {
            description: self.description_of(&event.event).await,
            missing_goal_policy: self.settings.missing_goal_policy,
        };
        let activity_type = event.event.activity_type();

        let mut attempt = 0;
        let outcome = loop {
            match self.storage.apply_event(event, &context) {
                Ok(outcome) => break outcome,
                Err(e) if attempt < self.settings.max_event_retries => {
                    let delay = self.settings.retry_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "Failed to apply {activity_type} event {}-{} (attempt {attempt}): {e:#}. Retrying in {delay:?}",
                        event.meta.transaction_hash, event.meta.log_index
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Giving up on {activity_type} event {}-{} of block {}",
                        event.meta.transaction_hash, event.meta.log_index, event.meta.block_number
                    )));
                }
            }
        };

        match outcome {
            ApplyOutcome::Applied => self.metrics.record_event_processed(activity_type),
            ApplyOutcome::DegradedMissingGoal => {
                self.metrics.record_event_processed(activity_type);
                self.metrics.record_degraded_event("missing_goal");
            }
            ApplyOutcome::Duplicate => self.metrics.record_duplicate_event(),
        }

        Ok(outcome)
    }

    /// Reads the description of a newly created goal. A failed lookup leaves the description empty.
    async fn description_of(&self, event: &ContractEvent) -> Option<String> {
        let ContractEvent::GoalCreated { goal_id, .. } = event else {
            return None;
        };

        match self.descriptions.goal_description(*goal_id).await {
            Ok(description) => Some(description),
            Err(e) => {
                warn!("Failed to read the description of goal {goal_id}, storing it empty: {e:#}");
                Some(String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contract::VouchieVault,
        metrics::MetricsConfig,
        model::ActivityType,
        storage::{DuckDBStorage, StorageQuery},
        test_utils::{EventBuilder, StaticDescriptions, fake_address, log_for, to_log},
    };
    use alloy::{
        primitives::{B256, Bytes, LogData},
        sol_types::SolEvent,
    };
    use pretty_assertions::assert_eq;
    use rstest::*;
    use tokio::sync::mpsc;

    const ALICE: &str = "0x000000000000000000000000000000000000000a";
    const BOB: &str = "0x000000000000000000000000000000000000000b";
    const T: u64 = 1_700_000_000;

    struct Harness {
        storage: Arc<DuckDBStorage>,
        producer: crate::TxLogChunk,
        token: CancellationToken,
        metrics: MetricsHandle,
        processor: EventProcessor<StaticDescriptions>,
    }

    fn harness(descriptions: StaticDescriptions, policy: MissingGoalPolicy) -> Harness {
        let storage = Arc::new(DuckDBStorage::with_db(":memory:").unwrap());
        let (producer, consumer) = mpsc::channel(DEFAULT_INDEXING_BUFFER);
        let token = CancellationToken::default();
        let metrics = MetricsHandle::new(&MetricsConfig {
            enabled: true,
            address: "127.0.0.1".to_string(),
            port: 0,
            allow_origin: None,
        })
        .unwrap();
        let processor = EventProcessor::new(
            fake_address(),
            storage.clone(),
            Arc::new(descriptions),
            consumer,
            token.clone(),
            ProcessorSettings {
                missing_goal_policy: policy,
                max_event_retries: 1,
                retry_base_delay: Duration::from_millis(1),
            },
            metrics.clone(),
        );

        Harness {
            storage,
            producer,
            token,
            metrics,
            processor,
        }
    }

    fn chunk(start_block: u64, end_block: u64, events: &[IndexedEvent]) -> LogChunk {
        LogChunk {
            start_block,
            end_block,
            events: events.iter().map(to_log).collect(),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn chunks_are_applied_in_chain_order_and_checkpointed() {
        let Harness {
            storage,
            producer,
            mut processor,
            ..
        } = harness(
            StaticDescriptions::default().with(1, "Run a marathon"),
            MissingGoalPolicy::Degrade,
        );

        let mut events = EventBuilder::new(T);
        let created = events.goal_created(1, ALICE, 100, T + 3_600, true);
        let resolved = events.goal_resolved(1, true);

        // The resolution arrives first within the chunk, the processor restores the chain order.
        producer
            .send(chunk(1, 10, &[resolved, created]))
            .await
            .unwrap();
        drop(producer);

        processor.run().await.unwrap();

        let goal = storage.get_goal(1).unwrap().unwrap();
        assert_eq!(goal.description, "Run a marathon");
        assert!(goal.resolved && goal.successful);

        let stats = storage.get_user_stats(ALICE).unwrap().unwrap();
        assert_eq!(stats.goals_completed, 1);
        assert_eq!(stats.current_streak, 1);
        assert_eq!(storage.last_block().unwrap(), 10);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_description_lookup_stores_an_empty_description() {
        let Harness {
            storage,
            producer,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Degrade);

        let mut events = EventBuilder::new(T);
        producer
            .send(chunk(1, 1, &[events.goal_created(7, BOB, 5, T + 60, false)]))
            .await
            .unwrap();
        drop(producer);

        processor.run().await.unwrap();

        let goal = storage.get_goal(7).unwrap().unwrap();
        assert_eq!(goal.description, "");

        let feed = storage.list_activities(10).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].goal_title.as_deref(), Some(""));
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_logs_are_skipped() {
        let Harness {
            storage,
            producer,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Degrade);

        let foreign = log_for(
            LogData::new_unchecked(vec![B256::repeat_byte(0x42)], Default::default()),
            3,
            0,
        );
        producer
            .send(LogChunk {
                start_block: 1,
                end_block: 5,
                events: vec![foreign],
            })
            .await
            .unwrap();
        drop(producer);

        processor.run().await.unwrap();

        assert!(storage.list_activities(10).unwrap().is_empty());
        assert_eq!(storage.last_block().unwrap(), 5);
    }

    #[rstest]
    #[tokio::test]
    async fn undecodable_logs_are_counted_and_skipped() {
        let Harness {
            storage,
            producer,
            metrics,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Degrade);

        // Known topic, but the indexed arguments and the payload are missing.
        let truncated = log_for(
            LogData::new_unchecked(vec![VouchieVault::GoalCreated::SIGNATURE_HASH], Bytes::new()),
            2,
            0,
        );
        producer
            .send(LogChunk {
                start_block: 1,
                end_block: 5,
                events: vec![truncated],
            })
            .await
            .unwrap();
        drop(producer);

        processor.run().await.unwrap();

        assert!(storage.list_activities(10).unwrap().is_empty());
        assert_eq!(storage.last_block().unwrap(), 5);
        assert_eq!(metrics.degraded_events("decode_error"), 1);
        assert_eq!(metrics.degraded_events("missing_goal"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn redelivered_chunks_do_not_double_count() {
        let Harness {
            storage,
            producer,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Degrade);

        let mut events = EventBuilder::new(T);
        let batch = [
            events.goal_created(1, ALICE, 10, T + 60, true),
            events.goal_resolved(1, true),
        ];
        producer.send(chunk(1, 2, &batch)).await.unwrap();
        producer.send(chunk(1, 2, &batch)).await.unwrap();
        drop(producer);

        processor.run().await.unwrap();

        let stats = storage.get_user_stats(ALICE).unwrap().unwrap();
        assert_eq!(stats.goals_created, 1);
        assert_eq!(stats.goals_completed, 1);
        assert_eq!(storage.list_activities(10).unwrap().len(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn rejected_event_stops_before_the_checkpoint() {
        let Harness {
            storage,
            producer,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Reject);

        let mut events = EventBuilder::new(T);
        let created = events.goal_created(1, ALICE, 10, T + 60, true);
        producer.send(chunk(1, 1, &[created])).await.unwrap();
        // Goal 2 was never created.
        let orphan = events.goal_resolved(2, true);
        producer.send(chunk(2, 2, &[orphan])).await.unwrap();
        drop(producer);

        assert!(processor.run().await.is_err());

        assert_eq!(storage.last_block().unwrap(), 1);
        let feed: Vec<_> = storage
            .list_activities(10)
            .unwrap()
            .into_iter()
            .map(|activity| activity.activity_type)
            .collect();
        assert_eq!(feed, vec![ActivityType::GoalCreated]);
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown_request_stops_the_processor() {
        let Harness {
            producer,
            token,
            mut processor,
            ..
        } = harness(StaticDescriptions::default(), MissingGoalPolicy::Degrade);

        token.graceful_shutdown();
        processor.run().await.unwrap();

        // The producer is still alive, the processor stopped because of the token.
        assert!(!producer.is_closed());
    }
}

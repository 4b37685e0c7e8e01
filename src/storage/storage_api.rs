// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

use crate::{
    contract::IndexedEvent,
    handlers::HandlerContext,
    model::{Activity, Goal, UserStats},
};
use anyhow::Result;
use std::any::Any;

/// Result of applying a single event to the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every mutation of the event was committed.
    Applied,
    /// The event was committed using defaults because the goal it refers to is unknown.
    DegradedMissingGoal,
    /// The log was already indexed, nothing was written.
    Duplicate,
}

/// Trait that defines the API between the event processor and the storage.
pub trait Storage: Send + Sync + 'static + Any {
    /// Applies all the mutations caused by an event as a single unit.
    ///
    /// # Description
    ///
    /// Either every mutation of the event gets committed or none of them does. When an error is returned the
    /// storage is left as it was before the call, so the event can be delivered again.
    fn apply_event(&self, event: &IndexedEvent, context: &HandlerContext) -> Result<ApplyOutcome>;
    /// Gets the last block whose events are fully committed. Zero when nothing has been indexed yet.
    fn last_block(&self) -> Result<u64>;
    /// Records that every event up to the given block has been committed.
    fn set_last_block(&self, block_number: u64) -> Result<()>;
    /// Binds the database to a contract address.
    ///
    /// # Description
    ///
    /// A database only holds the views of a single contract. Binding a database that was filled from another
    /// contract is an error.
    fn bind_contract(&self, contract_address: &str) -> Result<()>;
}

/// Read and write access to the views inside the transaction of a single event.
///
/// The event handlers are written against this trait, so they never deal with the storage backend directly.
pub trait StoreTx {
    fn activity_exists(&mut self, id: &str) -> Result<bool>;
    fn insert_activity(&mut self, activity: &Activity) -> Result<()>;
    fn goal(&mut self, goal_id: u64) -> Result<Option<Goal>>;
    /// Inserts the goal, or overwrites the mutable fields of an existing one.
    fn upsert_goal(&mut self, goal: &Goal) -> Result<()>;
    fn user_stats(&mut self, address: &str) -> Result<Option<UserStats>>;
    /// Inserts the statistics, or overwrites the ones stored for the same address.
    fn upsert_user_stats(&mut self, stats: &UserStats) -> Result<()>;
}

// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Event handlers of the VouchieVault contract.
//!
//! # Description
//!
//! There is one handler per event type. Each handler reads the current state of the views through a [StoreTx]
//! and writes the mutations the event causes through the same object, which is bound to a single storage
//! transaction. The storage commits the transaction only when the handler succeeds.
//!
//! ## Idempotency
//!
//! The activity row, keyed by `transactionHash-logIndex`, acts as the gate: if it already exists the log was
//! indexed before and the whole event is skipped. On top of that, counters are only moved on the first
//! creation and the first resolution of a goal, so a logical event delivered again under a different log
//! identity (i.e. after a reorg) doesn't count twice.

use crate::{
    contract::{ContractEvent, EventMeta, IndexedEvent},
    model::{Activity, ActivityType, Goal, UserStats, activity_id, canonical_address},
    storage::{ApplyOutcome, StoreTx},
};
use alloy::primitives::{Address, U256};
use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};

/// What to do with an event that refers to a goal the indexer never saw being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingGoalPolicy {
    /// Apply the event using zero values for the data of the goal.
    #[default]
    Degrade,
    /// Fail the event, so it gets delivered again once the creation has been indexed.
    Reject,
}

/// Typed failures of the handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{activity_type} event for unknown goal {goal_id}")]
    MissingGoal {
        goal_id: u64,
        activity_type: ActivityType,
    },
}

/// Inputs of a handler that don't come from the log itself.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    /// Description of the goal as read from the contract. Only used by the creation handler.
    pub description: Option<String>,
    pub missing_goal_policy: MissingGoalPolicy,
}

/// Routes an event to its handler.
pub fn apply_event(
    store: &mut dyn StoreTx,
    event: &IndexedEvent,
    context: &HandlerContext,
) -> Result<ApplyOutcome> {
    let meta = &event.meta;
    let id = activity_id(&meta.transaction_hash, meta.log_index);

    if store.activity_exists(&id)? {
        debug!("Log {id} was already indexed, skipping it");
        return Ok(ApplyOutcome::Duplicate);
    }

    match &event.event {
        ContractEvent::GoalCreated {
            goal_id,
            creator,
            stake_amount,
            deadline,
            is_solo,
        } => on_goal_created(
            store,
            meta,
            GoalCreated {
                goal_id: *goal_id,
                creator,
                stake_amount: *stake_amount,
                deadline: *deadline,
                is_solo: *is_solo,
                description: context.description.clone().unwrap_or_default(),
            },
        ),
        ContractEvent::GoalResolved {
            goal_id,
            successful,
            is_solo,
        } => on_goal_resolved(store, meta, context, *goal_id, *successful, *is_solo),
        ContractEvent::VoteCast {
            goal_id,
            voter,
            is_valid,
        } => on_vote_cast(store, meta, *goal_id, voter, *is_valid),
        ContractEvent::FundsClaimed {
            goal_id,
            claimant,
            amount,
        } => on_funds_claimed(store, meta, *goal_id, claimant, *amount),
        ContractEvent::StreakFrozen {
            goal_id,
            new_deadline,
            fee_paid,
        } => on_streak_frozen(store, meta, context, *goal_id, *new_deadline, *fee_paid),
        ContractEvent::BadgeClaimed { goal_id, creator } => {
            on_badge_claimed(store, meta, *goal_id, creator)
        }
        ContractEvent::GoalCanceled {
            goal_id,
            creator,
            refund_amount,
        } => on_goal_canceled(store, meta, context, *goal_id, creator, *refund_amount),
    }
}

struct GoalCreated<'a> {
    goal_id: u64,
    creator: &'a Address,
    stake_amount: U256,
    deadline: u64,
    is_solo: bool,
    description: String,
}

fn on_goal_created(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    event: GoalCreated<'_>,
) -> Result<ApplyOutcome> {
    let creator = canonical_address(event.creator);

    let mut activity = new_activity(meta, ActivityType::GoalCreated, creator.clone());
    activity.goal_id = Some(event.goal_id);
    activity.goal_title = Some(event.description.clone());
    activity.stake_amount = Some(event.stake_amount);
    activity.deadline = Some(event.deadline);
    activity.is_solo = Some(event.is_solo);

    if store.goal(event.goal_id)?.is_some() {
        // Same goal delivered under another log identity. The goal and the counters already account for it.
        warn!(
            "Goal {} was already created, only the activity is recorded",
            event.goal_id
        );
        store.insert_activity(&activity)?;
        return Ok(ApplyOutcome::Applied);
    }

    let goal = Goal::created(
        event.goal_id,
        creator.clone(),
        event.stake_amount,
        event.deadline,
        event.description,
        event.is_solo,
        meta.block_timestamp,
    );
    store.upsert_goal(&goal)?;
    store.insert_activity(&activity)?;

    let mut stats = ensure_user_stats(store, &creator)?;
    stats.record_created(event.stake_amount, meta.block_timestamp);
    store.upsert_user_stats(&stats)?;

    Ok(ApplyOutcome::Applied)
}

fn on_goal_resolved(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    context: &HandlerContext,
    goal_id: u64,
    successful: bool,
    is_solo: bool,
) -> Result<ApplyOutcome> {
    let prior = prior_goal(store, context, goal_id, ActivityType::GoalResolved)?;

    let mut activity = new_activity(meta, ActivityType::GoalResolved, creator_or_zero(&prior));
    snapshot_goal(&mut activity, goal_id, prior.as_ref());
    activity.stake_amount = Some(prior.as_ref().map_or(U256::ZERO, |goal| goal.stake_amount));
    activity.deadline = prior.as_ref().map(|goal| goal.deadline);
    activity.is_solo = Some(is_solo);
    activity.successful = Some(successful);
    store.insert_activity(&activity)?;

    // Without the goal the creator is unknown, so there are no statistics to update.
    let Some(mut goal) = prior else {
        return Ok(ApplyOutcome::DegradedMissingGoal);
    };

    let first_resolution = !goal.resolved;
    goal.resolve(successful, meta.block_timestamp);
    store.upsert_goal(&goal)?;

    if !first_resolution {
        warn!("Goal {goal_id} was already resolved, statistics are left untouched");
        return Ok(ApplyOutcome::Applied);
    }

    let mut stats = ensure_user_stats(store, &goal.creator)?;
    if successful {
        stats.record_success(goal.stake_amount);
    } else {
        stats.record_failure(goal.stake_amount);
    }
    store.upsert_user_stats(&stats)?;

    Ok(ApplyOutcome::Applied)
}

fn on_vote_cast(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    goal_id: u64,
    voter: &Address,
    is_valid: bool,
) -> Result<ApplyOutcome> {
    let goal = store.goal(goal_id)?;

    let mut activity = new_activity(meta, ActivityType::VoteCast, canonical_address(voter));
    snapshot_goal(&mut activity, goal_id, goal.as_ref());
    activity.is_valid = Some(is_valid);
    store.insert_activity(&activity)?;

    Ok(ApplyOutcome::Applied)
}

fn on_funds_claimed(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    goal_id: u64,
    claimant: &Address,
    amount: U256,
) -> Result<ApplyOutcome> {
    let goal = store.goal(goal_id)?;

    let mut activity = new_activity(meta, ActivityType::FundsClaimed, canonical_address(claimant));
    snapshot_goal(&mut activity, goal_id, goal.as_ref());
    activity.claim_amount = Some(amount);
    store.insert_activity(&activity)?;

    Ok(ApplyOutcome::Applied)
}

fn on_streak_frozen(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    context: &HandlerContext,
    goal_id: u64,
    new_deadline: u64,
    fee_paid: U256,
) -> Result<ApplyOutcome> {
    let prior = prior_goal(store, context, goal_id, ActivityType::StreakFrozen)?;

    let mut activity = new_activity(meta, ActivityType::StreakFrozen, creator_or_zero(&prior));
    snapshot_goal(&mut activity, goal_id, prior.as_ref());
    activity.stake_amount = Some(fee_paid);
    activity.deadline = Some(new_deadline);
    store.insert_activity(&activity)?;

    let Some(mut goal) = prior else {
        return Ok(ApplyOutcome::DegradedMissingGoal);
    };

    // The deadline is the only creation field that changes after the fact.
    goal.deadline = new_deadline;
    store.upsert_goal(&goal)?;

    Ok(ApplyOutcome::Applied)
}

fn on_badge_claimed(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    goal_id: u64,
    creator: &Address,
) -> Result<ApplyOutcome> {
    let goal = store.goal(goal_id)?;

    let mut activity = new_activity(meta, ActivityType::BadgeClaimed, canonical_address(creator));
    snapshot_goal(&mut activity, goal_id, goal.as_ref());
    store.insert_activity(&activity)?;

    Ok(ApplyOutcome::Applied)
}

fn on_goal_canceled(
    store: &mut dyn StoreTx,
    meta: &EventMeta,
    context: &HandlerContext,
    goal_id: u64,
    creator: &Address,
    refund_amount: U256,
) -> Result<ApplyOutcome> {
    let prior = prior_goal(store, context, goal_id, ActivityType::GoalCanceled)?;
    let creator = canonical_address(creator);

    let mut activity = new_activity(meta, ActivityType::GoalCanceled, creator.clone());
    snapshot_goal(&mut activity, goal_id, prior.as_ref());
    activity.claim_amount = Some(refund_amount);
    store.insert_activity(&activity)?;

    let outcome = match prior {
        Some(mut goal) => {
            let already_closed = goal.resolved;
            goal.cancel(meta.block_timestamp);
            store.upsert_goal(&goal)?;

            if already_closed {
                warn!("Goal {goal_id} was already closed, statistics are left untouched");
                return Ok(ApplyOutcome::Applied);
            }
            ApplyOutcome::Applied
        }
        None => ApplyOutcome::DegradedMissingGoal,
    };

    // A cancellation withdraws the goal: it reverts the creation counters and never counts as a failure.
    let mut stats = ensure_user_stats(store, &creator)?;
    stats.record_cancel(refund_amount);
    store.upsert_user_stats(&stats)?;

    Ok(outcome)
}

fn new_activity(meta: &EventMeta, activity_type: ActivityType, user: String) -> Activity {
    Activity::new(
        &meta.transaction_hash,
        meta.log_index,
        activity_type,
        user,
        meta.block_timestamp,
        meta.block_number,
    )
}

/// Fills the goal reference of an activity, taking the title as it is right now.
fn snapshot_goal(activity: &mut Activity, goal_id: u64, goal: Option<&Goal>) {
    activity.goal_id = Some(goal_id);
    activity.goal_title = goal.map(|goal| goal.description.clone());
}

fn creator_or_zero(goal: &Option<Goal>) -> String {
    match goal {
        Some(goal) => goal.creator.clone(),
        None => canonical_address(&Address::ZERO),
    }
}

/// Reads the goal an event refers to, applying the policy for unknown goals.
fn prior_goal(
    store: &mut dyn StoreTx,
    context: &HandlerContext,
    goal_id: u64,
    activity_type: ActivityType,
) -> Result<Option<Goal>> {
    let goal = store.goal(goal_id)?;

    if goal.is_none() {
        match context.missing_goal_policy {
            MissingGoalPolicy::Reject => {
                return Err(HandlerError::MissingGoal {
                    goal_id,
                    activity_type,
                }
                .into());
            }
            MissingGoalPolicy::Degrade => {
                warn!("{activity_type} event for unknown goal {goal_id}, applying it with default values");
            }
        }
    }

    Ok(goal)
}

/// Reads the statistics of a user, or zeroed ones if the user is new.
fn ensure_user_stats(store: &mut dyn StoreTx, address: &str) -> Result<UserStats> {
    Ok(store
        .user_stats(address)?
        .unwrap_or_else(|| UserStats::new(address)))
}

// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Domain records of the materialized views.
//!
//! # Description
//!
//! These are the rows kept by the storage: one [Goal] per goal id, one [Activity] per log occurrence and one
//! [UserStats] per user address. The streak state machine lives in [UserStats] so it can be checked without a
//! database.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Canonical representation of an address in the storage: lowercase and 0x-prefixed.
pub fn canonical_address(address: &Address) -> String {
    address.to_string().to_ascii_lowercase()
}

/// Parses a user supplied address into its canonical representation.
pub fn parse_address(address: &str) -> anyhow::Result<String> {
    let address = Address::from_str(address.trim())
        .map_err(|e| anyhow::anyhow!("Invalid address '{address}': {e}"))?;
    Ok(canonical_address(&address))
}

/// Builds the primary key of an activity row.
pub fn activity_id(transaction_hash: &str, log_index: u64) -> String {
    format!("{transaction_hash}-{log_index}")
}

/// Serializes a timestamp to an ISO 8601 string.
fn serialize_timestamp<S>(timestamp: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let dt = i64::try_from(*timestamp)
        .ok()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    serializer.serialize_str(&dt.to_rfc3339())
}

fn serialize_optional_timestamp<S>(timestamp: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match timestamp {
        Some(timestamp) => serialize_timestamp(timestamp, serializer),
        None => serializer.serialize_none(),
    }
}

/// Amounts are exposed as decimal strings, JSON numbers can't hold a uint256.
fn serialize_amount<S>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&amount.to_string())
}

fn serialize_optional_amount<S>(amount: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match amount {
        Some(amount) => serialize_amount(amount, serializer),
        None => serializer.serialize_none(),
    }
}

/// Snapshot of a goal's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Goal {
    pub goal_id: u64,
    pub creator: String,
    #[serde(serialize_with = "serialize_amount")]
    pub stake_amount: U256,
    /// Unix seconds.
    pub deadline: u64,
    pub description: String,
    pub is_solo: bool,
    pub resolved: bool,
    /// Only meaningful when `resolved` is set.
    pub successful: bool,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: u64,
    #[serde(serialize_with = "serialize_optional_timestamp")]
    pub resolved_at: Option<u64>,
}

impl Goal {
    /// Builds a goal that was just created, hence unresolved.
    pub fn created(
        goal_id: u64,
        creator: String,
        stake_amount: U256,
        deadline: u64,
        description: String,
        is_solo: bool,
        created_at: u64,
    ) -> Self {
        Self {
            goal_id,
            creator,
            stake_amount,
            deadline,
            description,
            is_solo,
            resolved: false,
            successful: false,
            created_at,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self, successful: bool, resolved_at: u64) {
        self.resolved = true;
        self.successful = successful;
        self.resolved_at = Some(resolved_at);
    }

    /// Cancellations are stored as unsuccessful resolutions.
    pub fn cancel(&mut self, canceled_at: u64) {
        self.resolve(false, canceled_at);
    }
}

/// Kind of an activity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    GoalCreated,
    GoalResolved,
    VoteCast,
    FundsClaimed,
    StreakFrozen,
    BadgeClaimed,
    GoalCanceled,
}

/// Immutable feed record of one log occurrence.
///
/// The goal title is a snapshot taken when the event was indexed, it is never joined against the current goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub id: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub activity_type: ActivityType,
    pub user: String,
    pub goal_id: Option<u64>,
    pub goal_title: Option<String>,
    #[serde(serialize_with = "serialize_optional_amount")]
    pub stake_amount: Option<U256>,
    pub deadline: Option<u64>,
    #[serde(serialize_with = "serialize_optional_amount")]
    pub claim_amount: Option<U256>,
    pub is_solo: Option<bool>,
    pub successful: Option<bool>,
    pub is_valid: Option<bool>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: u64,
    pub block_number: u64,
}

impl Activity {
    /// Creates an activity with every optional field unset.
    pub fn new(
        transaction_hash: &str,
        log_index: u64,
        activity_type: ActivityType,
        user: String,
        timestamp: u64,
        block_number: u64,
    ) -> Self {
        Self {
            id: activity_id(transaction_hash, log_index),
            transaction_hash: transaction_hash.to_string(),
            log_index,
            activity_type,
            user,
            goal_id: None,
            goal_title: None,
            stake_amount: None,
            deadline: None,
            claim_amount: None,
            is_solo: None,
            successful: None,
            is_valid: None,
            timestamp,
            block_number,
        }
    }
}

/// Aggregated statistics of a user, keyed by its canonical address.
///
/// # Description
///
/// Counters only move through the `record_*` methods. The streak is the amount of consecutive successful
/// resolutions: a success moves it one up, a failure resets it to zero and cancellations leave it alone.
/// `longest_streak` follows `current_streak` in lock-step, so `longest_streak >= current_streak` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub address: String,
    pub goals_created: u64,
    pub goals_completed: u64,
    pub goals_failed: u64,
    #[serde(serialize_with = "serialize_amount")]
    pub total_staked: U256,
    #[serde(serialize_with = "serialize_amount")]
    pub total_saved: U256,
    #[serde(serialize_with = "serialize_amount")]
    pub total_lost: U256,
    pub current_streak: u32,
    pub longest_streak: u32,
    #[serde(serialize_with = "serialize_optional_timestamp")]
    pub last_goal_at: Option<u64>,
}

impl UserStats {
    /// Zeroed statistics for an address never seen before.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            goals_created: 0,
            goals_completed: 0,
            goals_failed: 0,
            total_staked: U256::ZERO,
            total_saved: U256::ZERO,
            total_lost: U256::ZERO,
            current_streak: 0,
            longest_streak: 0,
            last_goal_at: None,
        }
    }

    pub fn record_created(&mut self, stake_amount: U256, created_at: u64) {
        self.goals_created = self.goals_created.saturating_add(1);
        self.total_staked = self.total_staked.saturating_add(stake_amount);
        self.last_goal_at = Some(created_at);
    }

    pub fn record_success(&mut self, stake_amount: U256) {
        self.goals_completed = self.goals_completed.saturating_add(1);
        self.total_saved = self.total_saved.saturating_add(stake_amount);
        self.current_streak = self.current_streak.saturating_add(1);
        self.longest_streak = self.longest_streak.max(self.current_streak);
    }

    pub fn record_failure(&mut self, stake_amount: U256) {
        self.goals_failed = self.goals_failed.saturating_add(1);
        self.total_lost = self.total_lost.saturating_add(stake_amount);
        self.current_streak = 0;
    }

    /// Reverts the creation-time counters. Both values are floored at zero.
    pub fn record_cancel(&mut self, refund_amount: U256) {
        self.goals_created = self.goals_created.saturating_sub(1);
        self.total_staked = self.total_staked.saturating_sub(refund_amount);
    }
}

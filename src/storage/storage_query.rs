// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

use crate::{
    constants::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT},
    model::{Activity, Goal, UserStats},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Sorting criteria of the leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardSort {
    /// Descending by current streak.
    #[default]
    Streak,
    /// Descending by total saved.
    Saved,
}

/// Summary of the indexing progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerStatus {
    pub contract_address: Option<String>,
    pub last_block: u64,
    pub goals: u64,
    pub activities: u64,
    pub users: u64,
}

/// Clamps a requested page size to the accepted range.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT)
}

/// Trait that defines the API between the REST API and the internal storage.
///
/// Addresses given to these methods are expected in their canonical form.
pub trait StorageQuery {
    /// Lists the latest activities, newest first.
    fn list_activities(&self, limit: usize) -> Result<Vec<Activity>>;
    /// Lists the latest activities of a user, newest first.
    fn list_activities_by_user(&self, address: &str, limit: usize) -> Result<Vec<Activity>>;
    /// Lists the latest activities of a goal, newest first.
    fn list_activities_by_goal(&self, goal_id: u64, limit: usize) -> Result<Vec<Activity>>;
    fn get_user_stats(&self, address: &str) -> Result<Option<UserStats>>;
    fn list_leaderboard(&self, sort_by: LeaderboardSort, limit: usize) -> Result<Vec<UserStats>>;
    fn get_goal(&self, goal_id: u64) -> Result<Option<Goal>>;
    /// Lists the goals of a creator, newest first.
    fn list_goals_by_creator(&self, address: &str, limit: usize) -> Result<Vec<Goal>>;
    fn indexer_status(&self) -> Result<IndexerStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case::default(None, DEFAULT_QUERY_LIMIT)]
    #[case::zero(Some(0), 1)]
    #[case::in_range(Some(42), 42)]
    #[case::too_big(Some(10_000), MAX_QUERY_LIMIT)]
    fn limits_are_clamped(#[case] requested: Option<usize>, #[case] expected: usize) {
        assert_eq!(clamp_limit(requested), expected);
    }

    #[rstest]
    fn leaderboard_sort_parses_its_keys() {
        assert_eq!(LeaderboardSort::from_str("streak").unwrap(), LeaderboardSort::Streak);
        assert_eq!(LeaderboardSort::from_str("saved").unwrap(), LeaderboardSort::Saved);
        assert!(LeaderboardSort::from_str("lost").is_err());
    }
}

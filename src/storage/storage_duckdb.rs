// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Module that handles the connection to the DuckDB database.

use crate::{
    constants::*,
    contract::IndexedEvent,
    error_codes::ERROR_CODE_DATABASE_LOCKED,
    handlers::{self, HandlerContext},
    model::{Activity, ActivityType, Goal, UserStats},
    storage::{
        ApplyOutcome, IndexerStatus, LeaderboardSort, Storage, StorageQuery, StoreTx,
    },
};
use alloy::primitives::U256;
use anyhow::{Context, Result};
use duckdb::{Connection, OptionalExt, Row, params, types::Type};
use std::{str::FromStr, sync::Mutex};
use tracing::{debug, error, info, warn};

/// Columns of the goals table, in the order the row mappers expect them.
const GOAL_COLUMNS: &str = "goal_id, creator, stake_amount, deadline, description, is_solo, resolved, successful, created_at, resolved_at";
/// Columns of the activities table, in the order the row mappers expect them.
const ACTIVITY_COLUMNS: &str = "id, transaction_hash, log_index, activity_type, user_address, goal_id, goal_title, stake_amount, deadline, claim_amount, is_solo, successful, is_valid, timestamp, block_number";
/// Columns of the user_stats table, in the order the row mappers expect them.
const USER_STATS_COLUMNS: &str = "address, goals_created, goals_completed, goals_failed, total_staked, total_saved, total_lost, current_streak, longest_streak, last_goal_at";
/// Newest first. Events of the same block keep their log order.
const ACTIVITY_ORDER: &str = "ORDER BY timestamp DESC, block_number DESC, log_index DESC";

/// Implementation of the Storage trait for the DuckDB database.
///
/// # Description
///
/// The DuckDBStorage object is responsible for the connection to the DuckDB database. It provides a thread-safe
/// interface for the storage of the indexed data.
///
/// Amounts are uint256 values, which don't fit in any DuckDB integer type. They are stored as decimal strings
/// without leading zeros, so comparing their length first and then the strings gives the numeric order.
pub struct DuckDBStorage {
    conn: Mutex<Connection>,
}

/// Simple factory pattern to allow opening a new connection to the same database from a task.
///
/// # Description
///
/// The main purpose of this object is to allow opening concurrent connections for reading from the database.
/// The main use case is the REST API, which needs a connection for each request. The connections are cloned
/// from the writer's one, so all of them share the same database instance, and readers don't contend for the
/// writer's lock.
pub struct DuckDBStorageFactory {
    conn: Mutex<Connection>,
}

impl DuckDBStorageFactory {
    /// Creates a factory of connections to the database behind the given storage.
    pub fn from_storage(storage: &DuckDBStorage) -> Result<Self> {
        let conn = storage
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?
            .try_clone()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(&self) -> Result<DuckDBStorage> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?
            .try_clone()?;
        Ok(DuckDBStorage {
            conn: Mutex::new(conn),
        })
    }
}

/// View over an open transaction, handed to the event handlers.
struct DuckDBTx<'a> {
    conn: &'a Connection,
}

impl StoreTx for DuckDBTx<'_> {
    fn activity_exists(&mut self, id: &str) -> Result<bool> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activities WHERE id = ?",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_activity(&mut self, activity: &Activity) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO activities ({ACTIVITY_COLUMNS})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO NOTHING"
            ),
            params![
                activity.id,
                activity.transaction_hash,
                activity.log_index,
                activity.activity_type.to_string(),
                activity.user,
                activity.goal_id,
                activity.goal_title,
                activity.stake_amount.map(|amount| amount.to_string()),
                activity.deadline,
                activity.claim_amount.map(|amount| amount.to_string()),
                activity.is_solo,
                activity.successful,
                activity.is_valid,
                activity.timestamp,
                activity.block_number,
            ],
        )?;
        Ok(())
    }

    fn goal(&mut self, goal_id: u64) -> Result<Option<Goal>> {
        select_goal(self.conn, goal_id)
    }

    fn upsert_goal(&mut self, goal: &Goal) -> Result<()> {
        // The creator is indexed, and DuckDB can't assign indexed columns on conflict. It never changes anyway.
        self.conn.execute(
            &format!(
                "INSERT INTO goals ({GOAL_COLUMNS})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (goal_id) DO UPDATE SET
                    stake_amount = EXCLUDED.stake_amount,
                    deadline = EXCLUDED.deadline,
                    description = EXCLUDED.description,
                    is_solo = EXCLUDED.is_solo,
                    resolved = EXCLUDED.resolved,
                    successful = EXCLUDED.successful,
                    created_at = EXCLUDED.created_at,
                    resolved_at = EXCLUDED.resolved_at"
            ),
            params![
                goal.goal_id,
                goal.creator,
                goal.stake_amount.to_string(),
                goal.deadline,
                goal.description,
                goal.is_solo,
                goal.resolved,
                goal.successful,
                goal.created_at,
                goal.resolved_at,
            ],
        )?;
        Ok(())
    }

    fn user_stats(&mut self, address: &str) -> Result<Option<UserStats>> {
        select_user_stats(self.conn, address)
    }

    fn upsert_user_stats(&mut self, stats: &UserStats) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO user_stats ({USER_STATS_COLUMNS})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (address) DO UPDATE SET
                    goals_created = EXCLUDED.goals_created,
                    goals_completed = EXCLUDED.goals_completed,
                    goals_failed = EXCLUDED.goals_failed,
                    total_staked = EXCLUDED.total_staked,
                    total_saved = EXCLUDED.total_saved,
                    total_lost = EXCLUDED.total_lost,
                    current_streak = EXCLUDED.current_streak,
                    longest_streak = EXCLUDED.longest_streak,
                    last_goal_at = EXCLUDED.last_goal_at"
            ),
            params![
                stats.address,
                stats.goals_created,
                stats.goals_completed,
                stats.goals_failed,
                stats.total_staked.to_string(),
                stats.total_saved.to_string(),
                stats.total_lost.to_string(),
                stats.current_streak,
                stats.longest_streak,
                stats.last_goal_at,
            ],
        )?;
        Ok(())
    }
}

impl Storage for DuckDBStorage {
    fn apply_event(&self, event: &IndexedEvent, context: &HandlerContext) -> Result<ApplyOutcome> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let tx = conn.transaction()?;

        let outcome = {
            let mut store = DuckDBTx { conn: &tx };
            handlers::apply_event(&mut store, event, context)?
        };

        // Dropping the transaction without committing rolls back whatever the handler wrote.
        tx.commit().with_context(|| {
            format!(
                "Failed to commit the {} event of {}-{}",
                event.event.activity_type(),
                event.meta.transaction_hash,
                event.meta.log_index
            )
        })?;

        Ok(outcome)
    }

    fn last_block(&self) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        Ok(conn.query_row(
            "SELECT last_block FROM indexer_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?)
    }

    fn set_last_block(&self, block_number: u64) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        conn.execute(
            "UPDATE indexer_state SET last_block = ? WHERE id = 1",
            [block_number],
        )?;
        Ok(())
    }

    fn bind_contract(&self, contract_address: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;

        let stored: Option<String> = conn.query_row(
            "SELECT contract_address FROM indexer_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;

        match stored {
            Some(stored) if stored == contract_address => Ok(()),
            Some(stored) => Err(anyhow::anyhow!(
                "The database holds the views of contract {stored}, it can't be used to index {contract_address}"
            )),
            None => {
                conn.execute(
                    "UPDATE indexer_state SET contract_address = ? WHERE id = 1",
                    [contract_address],
                )?;
                info!("Database bound to contract {contract_address}");
                Ok(())
            }
        }
    }
}

impl StorageQuery for DuckDBStorage {
    fn list_activities(&self, limit: usize) -> Result<Vec<Activity>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities {ACTIVITY_ORDER} LIMIT {limit}"
        ))?;
        let activities = statement
            .query_map([], activity_from_row)?
            .collect::<duckdb::Result<Vec<Activity>>>()?;
        Ok(activities)
    }

    fn list_activities_by_user(&self, address: &str, limit: usize) -> Result<Vec<Activity>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE user_address = ? {ACTIVITY_ORDER} LIMIT {limit}"
        ))?;
        let activities = statement
            .query_map([address], activity_from_row)?
            .collect::<duckdb::Result<Vec<Activity>>>()?;
        Ok(activities)
    }

    fn list_activities_by_goal(&self, goal_id: u64, limit: usize) -> Result<Vec<Activity>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE goal_id = ? {ACTIVITY_ORDER} LIMIT {limit}"
        ))?;
        let activities = statement
            .query_map([goal_id], activity_from_row)?
            .collect::<duckdb::Result<Vec<Activity>>>()?;
        Ok(activities)
    }

    fn get_user_stats(&self, address: &str) -> Result<Option<UserStats>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        select_user_stats(&conn, address)
    }

    fn list_leaderboard(&self, sort_by: LeaderboardSort, limit: usize) -> Result<Vec<UserStats>> {
        let order = match sort_by {
            LeaderboardSort::Streak => {
                "current_streak DESC, longest_streak DESC, length(total_saved) DESC, total_saved DESC"
            }
            LeaderboardSort::Saved => {
                "length(total_saved) DESC, total_saved DESC, goals_completed DESC"
            }
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {USER_STATS_COLUMNS} FROM user_stats ORDER BY {order}, address ASC LIMIT {limit}"
        ))?;
        let stats = statement
            .query_map([], user_stats_from_row)?
            .collect::<duckdb::Result<Vec<UserStats>>>()?;
        Ok(stats)
    }

    fn get_goal(&self, goal_id: u64) -> Result<Option<Goal>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        select_goal(&conn, goal_id)
    }

    fn list_goals_by_creator(&self, address: &str, limit: usize) -> Result<Vec<Goal>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE creator = ? ORDER BY created_at DESC, goal_id DESC LIMIT {limit}"
        ))?;
        let goals = statement
            .query_map([address], goal_from_row)?
            .collect::<duckdb::Result<Vec<Goal>>>()?;
        Ok(goals)
    }

    fn indexer_status(&self) -> Result<IndexerStatus> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;
        Ok(conn.query_row(
            "SELECT
                contract_address,
                last_block,
                (SELECT COUNT(*) FROM goals),
                (SELECT COUNT(*) FROM activities),
                (SELECT COUNT(*) FROM user_stats)
            FROM indexer_state WHERE id = 1",
            [],
            |row| {
                Ok(IndexerStatus {
                    contract_address: row.get(0)?,
                    last_block: row.get(1)?,
                    goals: row.get(2)?,
                    activities: row.get(3)?,
                    users: row.get(4)?,
                })
            },
        )?)
    }
}

impl DuckDBStorage {
    pub fn new() -> Result<DuckDBStorage> {
        Self::with_db(DUCKDB_FILE_PATH)
    }

    /// Creates a new DuckDBStorage with the given database path.
    ///
    /// `:memory:` opens a database that lives as long as this object and the connections cloned from it.
    pub fn with_db(db_path: &str) -> Result<DuckDBStorage> {
        let conn = if let Ok(conn) = Connection::open(db_path) {
            conn
        } else {
            error!(
                "Failed to open database: {db_path}. Check that the DB file is not locked by another process."
            );
            std::process::exit(ERROR_CODE_DATABASE_LOCKED);
        };

        let table_exists: bool = conn.query_row(
            r#"
                SELECT
                    count(*)
                FROM
                    information_schema.tables
                WHERE
                    table_schema = 'main'
                    AND table_name = ?
                    AND table_type = 'BASE TABLE';"#,
            [DUCKDB_BASE_TABLE_NAME],
            |row| row.get(0),
        )?;

        if !table_exists {
            DuckDBStorage::create_db_base(&conn)?;
        } else {
            let version: String = conn
                .query_row(
                    format!("SELECT version FROM {DUCKDB_BASE_TABLE_NAME} LIMIT 1").as_str(),
                    [],
                    |row| row.get(0),
                )
                .with_context(|| {
                    format!("Failed to retrieve version from {DUCKDB_BASE_TABLE_NAME} table")
                })?;

            if version != DUCKDB_SCHEMA_VERSION {
                warn!("Your database is out of date. Please run the database upgrade.");
            }
        }

        debug!("Database connection successfully established");

        Ok(DuckDBStorage {
            conn: Mutex::new(conn),
        })
    }

    fn create_db_base(conn: &Connection) -> Result<()> {
        let statement = format!(
            "
            BEGIN;
            CREATE TABLE IF NOT EXISTS {DUCKDB_BASE_TABLE_NAME}(
                version VARCHAR NOT NULL,
                PRIMARY KEY (version)
            );
            CREATE TABLE IF NOT EXISTS indexer_state(
                id UTINYINT NOT NULL,
                contract_address VARCHAR(42),
                last_block UBIGINT NOT NULL,
                PRIMARY KEY (id)
            );
            CREATE TABLE IF NOT EXISTS goals(
                goal_id UBIGINT NOT NULL,
                creator VARCHAR(42) NOT NULL,
                stake_amount VARCHAR(78) NOT NULL,
                deadline UBIGINT NOT NULL,
                description VARCHAR NOT NULL,
                is_solo BOOLEAN NOT NULL,
                resolved BOOLEAN NOT NULL,
                successful BOOLEAN NOT NULL,
                created_at UBIGINT NOT NULL,
                resolved_at UBIGINT,
                PRIMARY KEY (goal_id)
            );
            CREATE TABLE IF NOT EXISTS activities(
                id VARCHAR NOT NULL,
                transaction_hash VARCHAR(66) NOT NULL,
                log_index UBIGINT NOT NULL,
                activity_type VARCHAR(16) NOT NULL,
                user_address VARCHAR(42) NOT NULL,
                goal_id UBIGINT,
                goal_title VARCHAR,
                stake_amount VARCHAR(78),
                deadline UBIGINT,
                claim_amount VARCHAR(78),
                is_solo BOOLEAN,
                successful BOOLEAN,
                is_valid BOOLEAN,
                timestamp UBIGINT NOT NULL,
                block_number UBIGINT NOT NULL,
                PRIMARY KEY (id)
            );
            CREATE TABLE IF NOT EXISTS user_stats(
                address VARCHAR(42) NOT NULL,
                goals_created UBIGINT NOT NULL,
                goals_completed UBIGINT NOT NULL,
                goals_failed UBIGINT NOT NULL,
                total_staked VARCHAR(78) NOT NULL,
                total_saved VARCHAR(78) NOT NULL,
                total_lost VARCHAR(78) NOT NULL,
                current_streak UINTEGER NOT NULL,
                longest_streak UINTEGER NOT NULL,
                last_goal_at UBIGINT,
                PRIMARY KEY (address)
            );
            CREATE INDEX IF NOT EXISTS goals_creator_idx ON goals(creator);
            CREATE INDEX IF NOT EXISTS activities_user_idx ON activities(user_address);
            CREATE INDEX IF NOT EXISTS activities_timestamp_idx ON activities(timestamp);
            CREATE INDEX IF NOT EXISTS activities_type_idx ON activities(activity_type);
            CREATE INDEX IF NOT EXISTS activities_goal_idx ON activities(goal_id);
            INSERT INTO indexer_state (id, contract_address, last_block) VALUES (1, NULL, 0);
            INSERT INTO {DUCKDB_BASE_TABLE_NAME} (version) VALUES ('{DUCKDB_SCHEMA_VERSION}');
            COMMIT;"
        );

        // Not a big deal to batch this SQL statement as it is executed once during the database's lifetime.
        conn.execute_batch(&statement)?;

        Ok(())
    }
}

fn select_goal(conn: &Connection, goal_id: u64) -> Result<Option<Goal>> {
    Ok(conn
        .query_row(
            &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE goal_id = ?"),
            [goal_id],
            goal_from_row,
        )
        .optional()?)
}

fn select_user_stats(conn: &Connection, address: &str) -> Result<Option<UserStats>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_STATS_COLUMNS} FROM user_stats WHERE address = ?"),
            [address],
            user_stats_from_row,
        )
        .optional()?)
}

fn goal_from_row(row: &Row) -> duckdb::Result<Goal> {
    Ok(Goal {
        goal_id: row.get(0)?,
        creator: row.get(1)?,
        stake_amount: amount_column(row, 2)?,
        deadline: row.get(3)?,
        description: row.get(4)?,
        is_solo: row.get(5)?,
        resolved: row.get(6)?,
        successful: row.get(7)?,
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

fn activity_from_row(row: &Row) -> duckdb::Result<Activity> {
    let activity_type: String = row.get(3)?;
    let activity_type = ActivityType::from_str(&activity_type).map_err(|e| {
        conversion_error(3, format!("Unknown activity type '{activity_type}': {e}"))
    })?;

    Ok(Activity {
        id: row.get(0)?,
        transaction_hash: row.get(1)?,
        log_index: row.get(2)?,
        activity_type,
        user: row.get(4)?,
        goal_id: row.get(5)?,
        goal_title: row.get(6)?,
        stake_amount: optional_amount_column(row, 7)?,
        deadline: row.get(8)?,
        claim_amount: optional_amount_column(row, 9)?,
        is_solo: row.get(10)?,
        successful: row.get(11)?,
        is_valid: row.get(12)?,
        timestamp: row.get(13)?,
        block_number: row.get(14)?,
    })
}

fn user_stats_from_row(row: &Row) -> duckdb::Result<UserStats> {
    Ok(UserStats {
        address: row.get(0)?,
        goals_created: row.get(1)?,
        goals_completed: row.get(2)?,
        goals_failed: row.get(3)?,
        total_staked: amount_column(row, 4)?,
        total_saved: amount_column(row, 5)?,
        total_lost: amount_column(row, 6)?,
        current_streak: row.get(7)?,
        longest_streak: row.get(8)?,
        last_goal_at: row.get(9)?,
    })
}

fn amount_column(row: &Row, idx: usize) -> duckdb::Result<U256> {
    let raw: String = row.get(idx)?;
    U256::from_str_radix(&raw, 10)
        .map_err(|e| conversion_error(idx, format!("Invalid amount '{raw}': {e}")))
}

fn optional_amount_column(row: &Row, idx: usize) -> duckdb::Result<Option<U256>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        U256::from_str_radix(&raw, 10)
            .map_err(|e| conversion_error(idx, format!("Invalid amount '{raw}': {e}")))
    })
    .transpose()
}

fn conversion_error(idx: usize, message: String) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EventBuilder;
    use pretty_assertions::assert_eq;
    use rstest::*;

    const ALICE: &str = "0x000000000000000000000000000000000000000a";
    const BOB: &str = "0x000000000000000000000000000000000000000b";
    const CAROL: &str = "0x000000000000000000000000000000000000000c";
    const T: u64 = 1_700_000_000;

    #[fixture]
    fn storage() -> DuckDBStorage {
        DuckDBStorage::with_db(":memory:").expect("in-memory DB should open")
    }

    fn apply_all(storage: &DuckDBStorage, events: &[IndexedEvent]) {
        for event in events {
            storage
                .apply_event(event, &HandlerContext::default())
                .expect("event should apply");
        }
    }

    #[rstest]
    fn fresh_database_starts_from_scratch(storage: DuckDBStorage) {
        assert_eq!(storage.last_block().unwrap(), 0);

        let status = storage.indexer_status().unwrap();
        assert_eq!(status.contract_address, None);
        assert_eq!(status.goals, 0);
        assert_eq!(status.activities, 0);
        assert_eq!(status.users, 0);
    }

    #[rstest]
    fn last_block_is_persisted(storage: DuckDBStorage) {
        storage.set_last_block(1234).unwrap();
        assert_eq!(storage.last_block().unwrap(), 1234);
    }

    #[rstest]
    fn database_is_bound_to_a_single_contract(storage: DuckDBStorage) {
        let vault = "0x00000000000000000000000000000000000c0de5";
        storage.bind_contract(vault).unwrap();
        // Binding again to the same contract is fine.
        storage.bind_contract(vault).unwrap();

        assert!(
            storage
                .bind_contract("0x0000000000000000000000000000000000000bad")
                .is_err()
        );
        assert_eq!(
            storage.indexer_status().unwrap().contract_address.as_deref(),
            Some(vault)
        );
    }

    #[rstest]
    fn feed_is_newest_first_and_filtered_by_user(storage: DuckDBStorage) {
        let mut events = EventBuilder::new(T);
        apply_all(
            &storage,
            &[
                events.goal_created(1, ALICE, 10, T + 60, true),
                events.goal_created(2, BOB, 20, T + 60, false),
                events.vote_cast(2, ALICE, true),
            ],
        );

        let feed = storage.list_activities(10).unwrap();
        let kinds: Vec<_> = feed.iter().map(|a| (a.activity_type, a.goal_id)).collect();
        assert_eq!(
            kinds,
            vec![
                (ActivityType::VoteCast, Some(2)),
                (ActivityType::GoalCreated, Some(2)),
                (ActivityType::GoalCreated, Some(1)),
            ]
        );

        let alice = storage.list_activities_by_user(ALICE, 10).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|activity| activity.user == ALICE));

        assert_eq!(storage.list_activities(1).unwrap().len(), 1);
    }

    #[rstest]
    fn leaderboard_sorts_by_streak_and_by_saved(storage: DuckDBStorage) {
        let mut events = EventBuilder::new(T);
        apply_all(
            &storage,
            &[
                // Alice: two small successes.
                events.goal_created(1, ALICE, 5, T + 60, true),
                events.goal_resolved(1, true),
                events.goal_created(2, ALICE, 5, T + 60, true),
                events.goal_resolved(2, true),
                // Bob: one big success. 1000 sorts after 5 as a string, not as a number.
                events.goal_created(3, BOB, 1000, T + 60, true),
                events.goal_resolved(3, true),
                // Carol: a failure.
                events.goal_created(4, CAROL, 90, T + 60, true),
                events.goal_resolved(4, false),
            ],
        );

        let by_streak: Vec<_> = storage
            .list_leaderboard(LeaderboardSort::Streak, 10)
            .unwrap()
            .into_iter()
            .map(|stats| stats.address)
            .collect();
        assert_eq!(by_streak, vec![ALICE, BOB, CAROL]);

        let by_saved: Vec<_> = storage
            .list_leaderboard(LeaderboardSort::Saved, 10)
            .unwrap()
            .into_iter()
            .map(|stats| stats.address)
            .collect();
        assert_eq!(by_saved, vec![BOB, ALICE, CAROL]);

        assert_eq!(
            storage
                .list_leaderboard(LeaderboardSort::Saved, 1)
                .unwrap()
                .len(),
            1
        );
    }

    #[rstest]
    fn goals_are_listed_by_creator(storage: DuckDBStorage) {
        let mut events = EventBuilder::new(T);
        apply_all(
            &storage,
            &[
                events.goal_created(1, ALICE, 10, T + 60, true),
                events.goal_created(2, BOB, 10, T + 60, true),
                events.goal_created(3, ALICE, 10, T + 60, true),
            ],
        );

        let goals: Vec<_> = storage
            .list_goals_by_creator(ALICE, 10)
            .unwrap()
            .into_iter()
            .map(|goal| goal.goal_id)
            .collect();
        assert_eq!(goals, vec![3, 1]);

        let status = storage.indexer_status().unwrap();
        assert_eq!(status.goals, 3);
        assert_eq!(status.activities, 3);
        assert_eq!(status.users, 2);
    }

    #[rstest]
    fn huge_amounts_survive_the_round_trip(storage: DuckDBStorage) {
        let mut conn = storage.conn.lock().unwrap();
        let tx = conn.transaction().unwrap();
        let mut store = DuckDBTx { conn: &tx };

        let mut stats = UserStats::new(ALICE);
        stats.record_created(U256::MAX, T);
        store.upsert_user_stats(&stats).unwrap();

        assert_eq!(store.user_stats(ALICE).unwrap(), Some(stats));
    }

    #[rstest]
    fn readers_from_the_factory_see_committed_events(storage: DuckDBStorage) {
        let factory = DuckDBStorageFactory::from_storage(&storage).unwrap();
        let mut events = EventBuilder::new(T);
        apply_all(&storage, &[events.goal_created(1, ALICE, 10, T + 60, true)]);

        let reader = factory.create().unwrap();
        assert!(reader.get_goal(1).unwrap().is_some());
        assert_eq!(reader.get_user_stats(ALICE).unwrap().unwrap().goals_created, 1);
    }
}

// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! REST API that serves the views of the indexer.
//!
//! Every endpoint accepts a JSON body through POST and opens its own connection to the database, so reads never
//! wait on the writer.

use crate::{
    CancellationToken,
    model::{Activity, Goal, UserStats, parse_address},
    storage::{
        DuckDBStorage, DuckDBStorageFactory, IndexerStatus, LeaderboardSort, StorageQuery,
        storage_query::clamp_limit,
    },
};
use anyhow::Result;
use axum::{Router, extract::State, http::StatusCode, response::Json, routing::post};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::{error, info};

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn storage_error(e: anyhow::Error) -> ApiError {
    error!("Storage error while serving a request: {e:#}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// Request type for list_activities endpoint
#[derive(Deserialize, Default)]
pub struct ListActivitiesRequest {
    #[serde(default)]
    pub limit: Option<usize>,
}

// Request type for the endpoints scoped to a user
#[derive(Deserialize)]
pub struct UserRequest {
    pub address: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

// Request type for the endpoints scoped to a goal
#[derive(Deserialize)]
pub struct GoalRequest {
    pub goal_id: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

// Request type for leaderboard endpoint
#[derive(Deserialize, Default)]
pub struct LeaderboardRequest {
    /// `streak` (default) or `saved`.
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ActivitiesResponse {
    pub activities: Vec<Activity>,
}

#[derive(Serialize)]
pub struct LeaderboardResponse {
    pub sort_by: LeaderboardSort,
    pub entries: Vec<UserStats>,
}

#[derive(Serialize)]
pub struct GoalsResponse {
    pub goals: Vec<Goal>,
}

/// Creates a new storage instance with a new connection for this request.
fn open_storage(factory: &DuckDBStorageFactory) -> Result<DuckDBStorage, ApiError> {
    factory.create().map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create database connection: {}", e),
        )
    })
}

fn user_address(address: &str) -> Result<String, ApiError> {
    parse_address(address)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid address: {e}")))
}

// POST handler for list_activities
async fn list_activities_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<ListActivitiesRequest>,
) -> Result<Json<ActivitiesResponse>, ApiError> {
    let storage = open_storage(&factory)?;
    let activities = storage
        .list_activities(clamp_limit(payload.limit))
        .map_err(storage_error)?;
    Ok(Json(ActivitiesResponse { activities }))
}

// POST handler for list_user_activities
async fn list_user_activities_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<ActivitiesResponse>, ApiError> {
    let address = user_address(&payload.address)?;
    let storage = open_storage(&factory)?;
    let activities = storage
        .list_activities_by_user(&address, clamp_limit(payload.limit))
        .map_err(storage_error)?;
    Ok(Json(ActivitiesResponse { activities }))
}

// POST handler for list_goal_activities
async fn list_goal_activities_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<GoalRequest>,
) -> Result<Json<ActivitiesResponse>, ApiError> {
    let storage = open_storage(&factory)?;
    let activities = storage
        .list_activities_by_goal(payload.goal_id, clamp_limit(payload.limit))
        .map_err(storage_error)?;
    Ok(Json(ActivitiesResponse { activities }))
}

// POST handler for get_user_stats
async fn get_user_stats_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<UserStats>, ApiError> {
    let address = user_address(&payload.address)?;
    let storage = open_storage(&factory)?;
    match storage.get_user_stats(&address).map_err(storage_error)? {
        Some(stats) => Ok(Json(stats)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No statistics for user {address}"),
        )),
    }
}

// POST handler for leaderboard
async fn leaderboard_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<LeaderboardRequest>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let sort_by = match payload.sort_by.as_deref() {
        Some(sort_by) => LeaderboardSort::from_str(sort_by).map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                format!("Invalid sort key '{sort_by}', expected 'streak' or 'saved'"),
            )
        })?,
        None => LeaderboardSort::default(),
    };

    let storage = open_storage(&factory)?;
    let entries = storage
        .list_leaderboard(sort_by, clamp_limit(payload.limit))
        .map_err(storage_error)?;
    Ok(Json(LeaderboardResponse { sort_by, entries }))
}

// POST handler for get_goal
async fn get_goal_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<GoalRequest>,
) -> Result<Json<Goal>, ApiError> {
    let storage = open_storage(&factory)?;
    match storage.get_goal(payload.goal_id).map_err(storage_error)? {
        Some(goal) => Ok(Json(goal)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Goal {} not found", payload.goal_id),
        )),
    }
}

// POST handler for list_user_goals
async fn list_user_goals_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<GoalsResponse>, ApiError> {
    let address = user_address(&payload.address)?;
    let storage = open_storage(&factory)?;
    let goals = storage
        .list_goals_by_creator(&address, clamp_limit(payload.limit))
        .map_err(storage_error)?;
    Ok(Json(GoalsResponse { goals }))
}

// POST handler for status
async fn status_handler(
    State(factory): State<Arc<DuckDBStorageFactory>>,
) -> Result<Json<IndexerStatus>, ApiError> {
    let storage = open_storage(&factory)?;
    let status = storage.indexer_status().map_err(storage_error)?;
    Ok(Json(status))
}

/// Creates and returns the REST API router
pub fn create_router(factory: Arc<DuckDBStorageFactory>) -> Router {
    Router::new()
        .route("/list_activities", post(list_activities_handler))
        .route("/list_user_activities", post(list_user_activities_handler))
        .route("/list_goal_activities", post(list_goal_activities_handler))
        .route("/get_user_stats", post(get_user_stats_handler))
        .route("/leaderboard", post(leaderboard_handler))
        .route("/get_goal", post(get_goal_handler))
        .route("/list_user_goals", post(list_user_goals_handler))
        .route("/status", post(status_handler))
        .with_state(factory)
}

/// Starts the REST API server in a separate task.
///
/// The listener is bound before returning, so a busy address is reported to the caller.
pub async fn start_api_server(
    server_address: &str,
    storage_backend: Arc<DuckDBStorageFactory>,
    cancellation_token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(server_address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind the API server to {server_address}: {e}"))?;
    info!("REST API server listening on {server_address}");

    let app = create_router(storage_backend);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancellation_token))
            .await
        {
            error!("API server error: {e}");
        }
    });

    Ok(handle)
}

async fn shutdown_signal(cancellation_token: CancellationToken) {
    let _ = cancellation_token.subscribe().recv().await;
    info!("API server shutdown signal received");
}

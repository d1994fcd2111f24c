//! Sync API endpoints
//!
//! Provides endpoints for offline field devices.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::Caller;
use crate::error::Result;
use crate::state::AppState;
use crate::store::StoredConflict;
use crate::sync::{parse_entity_types, PullRequest, PullResponse, PushOutcome, PushRequest, SyncStatus};

/// Conflicts returned when the caller gives no limit
const DEFAULT_CONFLICT_LIMIT: usize = 50;

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push_changes))
        .route("/pull", post(pull_changes))
        .route("/status", get(get_sync_status))
        .route("/conflicts", get(list_conflicts))
}

/// Apply queued device mutations
async fn push_changes(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushOutcome>> {
    let device_id = req.device_id.or(caller.device_id);
    let outcome = state
        .push()
        .process_push(&req.mutations, &caller.user_id, device_id.as_deref())
        .await?;
    Ok(Json(outcome))
}

/// Fetch server changes after the caller's watermark
async fn pull_changes(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<PullRequest>,
) -> Result<Json<PullResponse>> {
    let entity_types = parse_entity_types(req.entity_types.as_deref())?;
    let device_id = req.device_id.or(caller.device_id);
    let response = state
        .pull()
        .pull(&caller.user_id, device_id.as_deref(), req.since, &entity_types)
        .await?;
    Ok(Json(response))
}

/// Get sync status for the caller
async fn get_sync_status(State(state): State<AppState>, caller: Caller) -> Result<Json<SyncStatus>> {
    let status = state.status().get_status(&caller.user_id).await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct ConflictsQuery {
    limit: Option<usize>,
}

/// Recent conflicts recorded against the caller's mutations
async fn list_conflicts(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ConflictsQuery>,
) -> Result<Json<Vec<StoredConflict>>> {
    let limit = query.limit.unwrap_or(DEFAULT_CONFLICT_LIMIT);
    let conflicts = state
        .status()
        .recent_conflicts(&caller.user_id, limit)
        .await?;
    Ok(Json(conflicts))
}

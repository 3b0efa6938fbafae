//! HTTP read surface and command injection: a convenience mirror of the
//! controller protocol for curl / dashboards.

use crate::config::PolicyConfig;
use crate::error::PagelensError;
use crate::gateway::submit_command;
use crate::protocol::{ActionCandidate, Command, CommandAck, SearchFilters, TabSummary};
use crate::state::{CommandOrigin, GatewayState};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub type ApiState = Arc<GatewayState>;

pub async fn get_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let tabs = state.world.lock().tab_summaries();
    let policy = state.policy.read().clone();
    Json(json!({
        "agents": state.agent_count(),
        "controllers": state.controller_count(),
        "tabs": tabs,
        "policy": policy,
        "rateLimit": state.policy_engine.lock().counters(),
        "pendingCommands": state.pending.lock().len(),
    }))
}

pub async fn get_tabs(State(state): State<ApiState>) -> Json<Vec<TabSummary>> {
    Json(state.world.lock().tab_summaries())
}

pub async fn get_candidates(
    State(state): State<ApiState>,
    AxumPath(tab_id): AxumPath<u64>,
) -> Result<Json<Vec<ActionCandidate>>, (StatusCode, String)> {
    let world = state.world.lock();
    let tab = world
        .tab(tab_id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, PagelensError::TabNotFound(tab_id).to_string()))?;
    let mut candidates: Vec<ActionCandidate> = tab.candidates.values().cloned().collect();
    candidates.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(candidates))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub role: Option<String>,
    pub tag: Option<String>,
    pub visible: Option<bool>,
    pub enabled: Option<bool>,
}

pub async fn search_tab(
    State(state): State<ApiState>,
    AxumPath(tab_id): AxumPath<u64>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<ActionCandidate>>, (StatusCode, String)> {
    let filters = SearchFilters {
        role: params.role,
        tag: params.tag,
        visible: params.visible,
        enabled: params.enabled,
    };
    state
        .world
        .lock()
        .search(tab_id, &params.q, &filters)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, PagelensError::TabNotFound(tab_id).to_string()))
}

/// Equivalent to a controller `act`: runs the full pipeline and returns the
/// single resolving ack (policy denial, missing agent, timeout, or result).
pub async fn post_command(
    State(state): State<ApiState>,
    Json(command): Json<Command>,
) -> Result<Json<CommandAck>, (StatusCode, String)> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    submit_command(&state, command, CommandOrigin::Http(tx));
    match rx.await {
        Ok(ack) => Ok(Json(ack)),
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Command resolution dropped".to_string(),
        )),
    }
}

pub async fn get_policy(State(state): State<ApiState>) -> Json<PolicyConfig> {
    Json(state.policy.read().clone())
}

pub async fn set_policy(
    State(state): State<ApiState>,
    Json(policy): Json<PolicyConfig>,
) -> Json<PolicyConfig> {
    *state.policy.write() = policy.clone();
    tracing::info!("Policy updated: {:?}", policy.domain_mode);
    Json(policy)
}

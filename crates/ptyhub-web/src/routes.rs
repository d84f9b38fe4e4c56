//! REST projection of the agent pool.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::auth::{self, TokenQuery};
use crate::projection;
use crate::server::AppState;

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

/// `GET /api/agents` — the deduplicated agent list.
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if !auth::request_authorized(&state.token, &headers, query.token.as_deref()) {
        return unauthorized();
    }
    let list = projection::build_agent_list(&state.pool, state.directory.as_ref()).await;
    Json(list).into_response()
}

/// `GET /api/agents/{id}` — scrollback snapshot plus status for one agent.
pub async fn agent_detail(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if !auth::request_authorized(&state.token, &headers, query.token.as_deref()) {
        return unauthorized();
    }
    let Some(scrollback) = state.pool.scrollback(&agent_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "agent not found"})),
        )
            .into_response();
    };
    let status = state.directory.agent_status(&agent_id);
    Json(json!({
        "agentId": agent_id,
        "scrollback": scrollback,
        "status": status.state,
        "exitCode": status.exit_code,
    }))
    .into_response()
}

/// Any other `/api/*` path.
pub async fn api_not_found(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if !auth::request_authorized(&state.token, &headers, query.token.as_deref()) {
        return unauthorized();
    }
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

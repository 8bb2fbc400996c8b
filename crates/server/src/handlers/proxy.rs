//! `/noodle/proxy` handlers: remote activation, RPC relay, deactivation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Extension, Query};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use noodle_node::{LockInfo, DEFAULT_RETRY_INTERVAL};
use noodle_primitives::LockKind;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ActivateQuery {
    pub node_key: String,
    pub icrm_tag: String,
    pub lock_type: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry_interval: Option<f64>,
}

/// `GET /noodle/proxy/` — activate a node for a remote peer: spawn its
/// process-level CRM server and hand back the lock addressing it.
pub async fn activate_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ActivateQuery>,
) -> ApiResult<Json<LockInfo>> {
    let kind: LockKind = query.lock_type.parse().map_err(ApiError)?;
    let info = state
        .noodle
        .activate_node_for_peer(
            &query.icrm_tag,
            &query.node_key,
            kind,
            query.timeout.map(Duration::from_secs_f64),
            query
                .retry_interval
                .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_secs_f64),
        )
        .await
        .map_err(ApiError)?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub node_key: String,
    pub lock_id: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// `POST /noodle/proxy/` — relay opaque RPC bytes to the locked node's
/// CRM server.
pub async fn relay_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<RelayQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let reply = state
        .noodle
        .relay(
            &query.node_key,
            &query.lock_id,
            body.to_vec(),
            query.timeout.map(Duration::from_secs_f64),
        )
        .await
        .map_err(ApiError)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        reply,
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeactivateQuery {
    pub node_key: String,
    pub lock_id: String,
}

/// `DELETE /noodle/proxy/` — shut the CRM server down and drop the lock.
pub async fn deactivate_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<DeactivateQuery>,
) -> ApiResult<StatusCode> {
    state
        .noodle
        .deactivate_node_for_peer(&query.node_key, &query.lock_id)
        .await
        .map_err(ApiError)?;
    Ok(StatusCode::OK)
}

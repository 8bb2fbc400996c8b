//! `/noodle/node` handlers: tree operations, links, snapshot transfer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::Json;
use noodle_node::{
    ChunkResponse, LockInfo, PackingResponse, PullFromRequest, ResourceNodeInfo,
    DEFAULT_RETRY_INTERVAL,
};
use noodle_primitives::{LockKind, NodeKey, NoodleError};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{run_blocking, ApiError, ApiResult};
use crate::schemas::{
    MountRequest, MountResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    UnlinkInfo,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NodeInfoQuery {
    pub node_key: NodeKey,
    #[serde(default)]
    pub child_start_index: Option<usize>,
    #[serde(default)]
    pub child_end_index: Option<usize>,
}

/// `GET /noodle/node/` — node info with a paged view of children.
pub async fn get_node_info(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<NodeInfoQuery>,
) -> ApiResult<Json<ResourceNodeInfo>> {
    let info = state
        .noodle
        .get_node_info(
            &query.node_key,
            query.child_start_index.unwrap_or(0),
            query.child_end_index,
        )
        .map_err(ApiError)?
        .ok_or_else(|| ApiError(NoodleError::NodeNotFound(query.node_key.clone())))?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct LinkQuery {
    pub icrm_tag: String,
    pub node_key: String,
    pub access_mode: String,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry_interval: Option<f64>,
}

/// `GET /noodle/node/link` — long-lived link; returns the lock info.
pub async fn link_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<LinkQuery>,
) -> ApiResult<Json<LockInfo>> {
    let kind: LockKind = query.access_mode.parse().map_err(ApiError)?;
    let _ = state.noodle.modules().icrm(&query.icrm_tag).map_err(ApiError)?;

    let noodle = Arc::clone(&state.noodle);
    let info = run_blocking(move || {
        let lock_id = noodle.link(
            &query.icrm_tag,
            &query.node_key,
            kind,
            query.timeout.map(Duration::from_secs_f64),
            query
                .retry_interval
                .map_or(DEFAULT_RETRY_INTERVAL, Duration::from_secs_f64),
        )?;
        let record = noodle
            .locks()
            .get_info(&lock_id)?
            .ok_or(NoodleError::LockNotFound {
                lock_id,
                node_key: NodeKey::new(query.node_key.as_str()),
            })?;
        Ok(LockInfo::from(record))
    })
    .await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct UnlinkQuery {
    pub node_key: String,
    pub lock_id: String,
}

/// `GET /noodle/node/unlink` — sever a link.
pub async fn unlink_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UnlinkQuery>,
) -> ApiResult<Json<UnlinkInfo>> {
    let noodle = Arc::clone(&state.noodle);
    run_blocking(move || noodle.unlink(&query.node_key, &query.lock_id)).await?;
    Ok(Json(UnlinkInfo { success: true }))
}

/// `POST /noodle/node/mount`.
pub async fn mount_node(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<MountRequest>,
) -> ApiResult<Json<MountResponse>> {
    let mount_params: Option<Value> = match request.mount_params_string.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str(raw).map_err(|err| {
            ApiError(NoodleError::Validation(format!(
                "mount_params_string is not valid JSON: {err}"
            )))
        })?),
    };

    let noodle = Arc::clone(&state.noodle);
    let node_key = request.node_key.clone();
    run_blocking(move || {
        noodle.mount(
            &request.node_key,
            request.template_name.as_deref(),
            mount_params.as_ref(),
        )
    })
    .await?;

    Ok(Json(MountResponse {
        success: true,
        message: String::new(),
        node_key,
    }))
}

#[derive(Debug, Deserialize)]
pub struct NodeKeyQuery {
    pub node_key: NodeKey,
}

/// `POST /noodle/node/unmount` — empty response on success.
pub async fn unmount_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<NodeKeyQuery>,
) -> ApiResult<StatusCode> {
    let noodle = Arc::clone(&state.noodle);
    run_blocking(move || noodle.unmount(&query.node_key)).await?;
    Ok(StatusCode::OK)
}

/// `POST /noodle/node/push` — push a local node's snapshot to a peer.
pub async fn push_node(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<PushRequest>,
) -> ApiResult<Json<PushResponse>> {
    let noodle = Arc::clone(&state.noodle);
    run_blocking(move || {
        noodle.push(
            &request.template_name,
            &request.source_node_key,
            &request.target_node_key,
        )
    })
    .await?;
    Ok(Json(PushResponse {
        success: true,
        message: String::new(),
    }))
}

/// `POST /noodle/node/pull` — pull a remote node's snapshot onto this
/// peer.
pub async fn pull_node(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<PullRequest>,
) -> ApiResult<Json<PullResponse>> {
    let noodle = Arc::clone(&state.noodle);
    let target_node_key = request.target_node_key.clone();
    run_blocking(move || {
        noodle.pull(
            &request.template_name,
            &request.target_node_key,
            &request.source_node_key,
        )
    })
    .await?;
    Ok(Json(PullResponse {
        success: true,
        message: String::new(),
        target_node_key,
    }))
}

/// `POST /noodle/node/packing` — materialize this peer's archive for a
/// pull and report its byte size.
pub async fn packing_node(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<NodeKeyQuery>,
) -> ApiResult<Json<PackingResponse>> {
    let noodle = Arc::clone(&state.noodle);
    let response = run_blocking(move || noodle.pack_for_pull(&query.node_key)).await?;
    Ok(Json(response))
}

/// `POST /noodle/node/pull_from` — receive one chunk of a push transfer.
pub async fn pull_chunk_from_peer(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<PullFromRequest>,
) -> ApiResult<StatusCode> {
    let noodle = Arc::clone(&state.noodle);
    run_blocking(move || noodle.write_push_chunk(&request)).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub node_key: NodeKey,
    pub chunk_index: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

/// `GET /noodle/node/push_to` — serve one chunk of a pull transfer.
pub async fn push_chunk_to_peer(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ChunkQuery>,
) -> ApiResult<Json<ChunkResponse>> {
    let noodle = Arc::clone(&state.noodle);
    let chunk = run_blocking(move || {
        noodle.read_pull_chunk(&query.node_key, query.chunk_index, query.chunk_size)
    })
    .await?;
    Ok(Json(chunk))
}

use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use noodle_node::LockInfo;
use noodle_primitives::{NodeKey, NoodleError};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LockQuery {
    pub lock_id: String,
}

/// `GET /noodle/lock/` — lock info, or 404 for unknown ids.
pub async fn get_lock_info(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<LockQuery>,
) -> ApiResult<Json<LockInfo>> {
    let record = state
        .noodle
        .locks()
        .get_info(&query.lock_id)
        .map_err(ApiError)?
        .ok_or_else(|| {
            ApiError(NoodleError::LockNotFound {
                lock_id: query.lock_id.clone(),
                node_key: NodeKey::new("<unknown>"),
            })
        })?;
    Ok(Json(record.into()))
}

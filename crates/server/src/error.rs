//! Error → HTTP status mapping at the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use noodle_primitives::{ErrorKind, NoodleError};
use serde_json::json;
use tracing::error;

/// Wrapper turning engine errors into status + JSON responses.
#[derive(Debug)]
pub struct ApiError(pub NoodleError);

impl From<NoodleError> for ApiError {
    fn from(err: NoodleError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidState | ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error!(%status, err = %self.0, "request failed");
        (
            status,
            Json(json!({
                "success": false,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Joins a blocking-pool operation back into the handler, folding panics
/// into internal errors.
pub async fn run_blocking<T, F>(operation: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, NoodleError> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|err| ApiError(NoodleError::Other(eyre::eyre!("task panicked: {err}"))))?
        .map_err(ApiError)
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::orchestrator::IssueError;
use crate::store::StoreError;

/// JSON error body `{errCode, errMsg}` returned by every API route.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
            ApiError::Unauthorized => "unauthorized".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "errCode": status.as_u16(),
            "errMsg": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "storage failure while serving request");
        ApiError::Internal("storage failure".to_string())
    }
}

impl From<IssueError> for ApiError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::UnknownInstructionType(_) | IssueError::TargetNotAlive(_) => {
                ApiError::BadRequest(err.to_string())
            }
            IssueError::Registry(_) | IssueError::Ledger(_) | IssueError::Queue { .. } => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<camp_core::IdentityError> for ApiError {
    fn from(err: camp_core::IdentityError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::paths::ResolveError;

/// Everything a handler can fail with, as seen by the client.
///
/// None of the variants carry paths or OS error text: the details are logged
/// where the failure happens and the response body stays generic so it cannot
/// be used to map out the server's filesystem.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid path")]
    InvalidPath,

    #[error("Could not find the requested path")]
    NotFound,

    #[error("Unsupported file type")]
    UnsupportedClassification,

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPath => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::UnsupportedClassification => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ResolveError> for AppError {
    fn from(_: ResolveError) -> Self {
        AppError::InvalidPath
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use taskhub_core::{FieldType, StoreError, ValidationError};
use thiserror::Error;

/// Error returned by REST handlers, rendered as `{ "error": ... }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    BadRequest(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Store(e.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) => match e {
                StoreError::Validation(_)
                | StoreError::UnknownOwner(_)
                | StoreError::UnknownParent(_)
                | StoreError::ParentCycle(_) => StatusCode::BAD_REQUEST,
                StoreError::TaskNotFound(_)
                | StoreError::OwnerNotFound(_)
                | StoreError::CustomFieldNotFound(_) => StatusCode::NOT_FOUND,
                StoreError::DuplicateEmail(_) => StatusCode::CONFLICT,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Store(StoreError::Validation(ValidationError::FieldTypeInvalid)) => {
                let valid: Vec<&str> = FieldType::ALL.iter().map(|t| t.as_str()).collect();
                json!({ "error": self.to_string(), "validTypes": valid })
            }
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

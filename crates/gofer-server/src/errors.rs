//! The single mapping point from service errors to API responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use gofer::auth::AuthError;
use gofer::events::EventError;
use gofer::extensions::RegistryError;
use gofer::object_store::ObjectStoreError;
use gofer::pipelines::dag::ValidationError;
use gofer::pipelines::service::PipelineError;
use gofer::run_engine::RunError;
use gofer::scheduler::SchedulerError;
use gofer::secret_store::SecretStoreError;
use gofer::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal server error")]
    Internal(String),
}

/// Body shape for every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_errors: Option<Vec<ValidationError>>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::FailedPrecondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal detail goes to the log, not the wire.
        if let ApiError::Internal(detail) = &self {
            error!(detail = %detail, "internal error while serving request");
        }

        let body = ErrorBody {
            message: self.to_string(),
            validation_errors: None,
        };

        (self.status_code(), Json(body)).into_response()
    }
}

/// Validation failures carry their structured error list so callers can fix
/// everything at once.
pub fn invalid_config_response(errors: Vec<ValidationError>) -> Response {
    let body = ErrorBody {
        message: "pipeline configuration failed validation".into(),
        validation_errors: Some(errors),
    };
    (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound("requested entity not found".into()),
            StorageError::Exists => ApiError::AlreadyExists("entity already exists".into()),
            StorageError::Connection(detail) => ApiError::Unavailable(detail),
            StorageError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotFound => ApiError::NotFound("token not found".into()),
            AuthError::Unauthenticated => ApiError::Unauthenticated,
            AuthError::PermissionDenied(namespace) => ApiError::PermissionDenied(format!(
                "token does not grant access to namespace '{namespace}'"
            )),
            AuthError::FailedPrecondition(message) => ApiError::FailedPrecondition(message),
            AuthError::Storage(e) => e.into(),
            AuthError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound => ApiError::NotFound("pipeline not found".into()),
            PipelineError::InvalidConfig(errors) => {
                let summary = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                ApiError::InvalidArgument(summary)
            }
            PipelineError::FailedPrecondition(message) => ApiError::FailedPrecondition(message),
            PipelineError::Storage(e) => e.into(),
            PipelineError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotFound => ApiError::NotFound("run not found".into()),
            RunError::FailedPrecondition(message) => ApiError::FailedPrecondition(message),
            RunError::ResourceExhausted(limit) => ApiError::ResourceExhausted(format!(
                "pipeline is at its run parallelism limit ({limit})"
            )),
            RunError::Storage(e) => e.into(),
            RunError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::NotFound("extension not found".into()),
            RegistryError::Exists => ApiError::AlreadyExists("extension already installed".into()),
            RegistryError::FailedPrecondition(message) => ApiError::FailedPrecondition(message),
            RegistryError::Unavailable(detail) => ApiError::Unavailable(detail),
            RegistryError::Storage(e) => e.into(),
            RegistryError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<ObjectStoreError> for ApiError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound => ApiError::NotFound("object not found".into()),
            ObjectStoreError::Exists => {
                ApiError::AlreadyExists("object already exists; use force to overwrite".into())
            }
            ObjectStoreError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<SecretStoreError> for ApiError {
    fn from(err: SecretStoreError) -> Self {
        match err {
            SecretStoreError::NotFound => ApiError::NotFound("secret not found".into()),
            SecretStoreError::Exists => {
                ApiError::AlreadyExists("secret already exists; use force to overwrite".into())
            }
            SecretStoreError::Corrupt(detail) => ApiError::Corrupt(detail),
            SecretStoreError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoSuchContainer => ApiError::NotFound("container not found".into()),
            SchedulerError::NoSuchImage(image) => {
                ApiError::FailedPrecondition(format!("image '{image}' not found"))
            }
            SchedulerError::AmbiguousContainerName(name) => {
                ApiError::Internal(format!("ambiguous container name '{name}'"))
            }
            SchedulerError::Unavailable(detail) => ApiError::Unavailable(detail),
            SchedulerError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status_codes() {
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::AlreadyExists("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::ResourceExhausted("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Corrupt("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_errors_translate() {
        assert!(matches!(
            ApiError::from(StorageError::NotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::Exists),
            ApiError::AlreadyExists(_)
        ));
    }

    #[test]
    fn run_exhaustion_translates() {
        assert!(matches!(
            ApiError::from(RunError::ResourceExhausted(2)),
            ApiError::ResourceExhausted(_)
        ));
    }
}

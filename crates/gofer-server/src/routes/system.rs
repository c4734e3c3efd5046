use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/system/metadata", get(metadata))
        .route("/api/system/settings", get(get_settings).put(update_settings))
}

#[derive(Debug, Serialize)]
struct MetadataResponse {
    version: String,
}

async fn metadata(
    Extension(caller): Extension<Caller>,
) -> Result<Json<MetadataResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    Ok(Json(MetadataResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct SystemSettingsResponse {
    /// When true, both manual and extension-driven run creation is refused.
    ignore_pipeline_run_events: bool,
}

async fn get_settings(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<SystemSettingsResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    Ok(Json(SystemSettingsResponse {
        ignore_pipeline_run_events: state.ignore_run_events.load(Ordering::SeqCst),
    }))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    ignore_pipeline_run_events: bool,
}

/// Operator switch for incident response: flipping it on drains new run
/// creation without touching in-flight runs.
async fn update_settings(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<SystemSettingsResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    state
        .set_ignore_run_events(request.ignore_pipeline_run_events)
        .await?;

    Ok(Json(SystemSettingsResponse {
        ignore_pipeline_run_events: request.ignore_pipeline_run_events,
    }))
}

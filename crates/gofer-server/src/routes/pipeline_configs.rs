use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::pipelines::service::PipelineError;
use gofer::pipelines::{Config, PipelineDefinition};

use crate::auth::{preflight, Caller};
use crate::errors::{invalid_config_response, ApiError};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/configs",
            get(list_configs).post(register_config),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/configs/{version}",
            get(get_config).delete(delete_config),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/configs/{version}/deploy",
            post(deploy_config),
        )
}

#[derive(Debug, Serialize)]
struct RegisterConfigResponse {
    config: Config,
}

/// Register a new configuration version. The submitted definition's id must
/// match the pipeline in the path; registering against a brand-new id also
/// creates the pipeline.
async fn register_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Json(definition): Json<PipelineDefinition>,
) -> Result<Response, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    if definition.id != pipeline_id {
        return Err(ApiError::InvalidArgument(format!(
            "definition id '{}' does not match pipeline '{pipeline_id}' in the path",
            definition.id
        )));
    }

    match state.pipelines.register_config(&namespace_id, definition).await {
        Ok(config) => Ok(axum::response::IntoResponse::into_response(Json(
            RegisterConfigResponse { config },
        ))),
        Err(PipelineError::InvalidConfig(errors)) => Ok(invalid_config_response(errors)),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Serialize)]
struct ListConfigsResponse {
    configs: Vec<Config>,
}

async fn list_configs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListConfigsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let configs = state
        .pipelines
        .list_configs(&namespace_id, &pipeline_id, query.offset, query.limit)
        .await?;

    Ok(Json(ListConfigsResponse { configs }))
}

#[derive(Debug, Serialize)]
struct GetConfigResponse {
    config: Config,
}

async fn get_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, version)): Path<(String, String, u64)>,
) -> Result<Json<GetConfigResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let pipeline = state
        .pipelines
        .get_pipeline(&namespace_id, &pipeline_id, Some(version))
        .await?;

    Ok(Json(GetConfigResponse {
        config: pipeline.config,
    }))
}

async fn deploy_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, version)): Path<(String, String, u64)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .pipelines
        .deploy(&namespace_id, &pipeline_id, version)
        .await?;

    Ok(())
}

async fn delete_config(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, version)): Path<(String, String, u64)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .pipelines
        .delete_config(&namespace_id, &pipeline_id, version)
        .await?;

    Ok(())
}

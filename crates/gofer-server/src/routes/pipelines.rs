use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::pipelines::{Metadata, Pipeline, PipelineState};

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/namespaces/{namespace_id}/pipelines", get(list_pipelines))
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}",
            get(get_pipeline).delete(delete_pipeline),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/enable",
            put(enable_pipeline),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/disable",
            put(disable_pipeline),
        )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Serialize)]
struct ListPipelinesResponse {
    pipelines: Vec<Metadata>,
}

async fn list_pipelines(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(namespace_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListPipelinesResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let pipelines = state
        .pipelines
        .list_pipelines(&namespace_id, query.offset, query.limit)
        .await?;

    Ok(Json(ListPipelinesResponse { pipelines }))
}

#[derive(Debug, Deserialize)]
struct GetQuery {
    /// Config version to include; latest when omitted.
    version: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GetPipelineResponse {
    pipeline: Pipeline,
}

async fn get_pipeline(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Query(query): Query<GetQuery>,
) -> Result<Json<GetPipelineResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let pipeline = state
        .pipelines
        .get_pipeline(&namespace_id, &pipeline_id, query.version)
        .await?;

    Ok(Json(GetPipelineResponse { pipeline }))
}

async fn enable_pipeline(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .pipelines
        .set_pipeline_state(&namespace_id, &pipeline_id, PipelineState::Active)
        .await?;

    Ok(())
}

async fn disable_pipeline(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .pipelines
        .set_pipeline_state(&namespace_id, &pipeline_id, PipelineState::Disabled)
        .await?;

    Ok(())
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .pipelines
        .delete_pipeline(&namespace_id, &pipeline_id)
        .await?;

    Ok(())
}

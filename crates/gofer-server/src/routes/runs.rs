use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::runs::{Initiator, InitiatorKind, Run};
use gofer::storage;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs",
            get(list_runs).post(start_run).delete(cancel_all_runs),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}",
            get(get_run).delete(cancel_run),
        )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: u64,
    #[serde(default)]
    reverse: bool,
}

#[derive(Debug, Serialize)]
struct ListRunsResponse {
    runs: Vec<Run>,
}

async fn list_runs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let rows = storage::runs::list(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        query.offset,
        query.limit,
        state.settings.server.storage_results_limit,
        query.reverse,
    )
    .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        runs.push(Run::try_from(row)?);
    }

    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize)]
struct GetRunResponse {
    run: Run,
}

async fn get_run(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id)): Path<(String, String, u64)>,
) -> Result<Json<GetRunResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::runs::get(&mut conn, &namespace_id, &pipeline_id, run_id as i64).await?;

    Ok(Json(GetRunResponse {
        run: Run::try_from(row)?,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StartRunRequest {
    /// Run-level variable overrides; they win over pipeline config values.
    #[serde(default)]
    variables: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct StartRunResponse {
    run: Run,
}

async fn start_run(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let name = match &caller {
        Caller::Token(token) => token.id.clone(),
        Caller::Bypassed => "anonymous".into(),
    };

    let run = state
        .run_engine
        .start_run(
            &namespace_id,
            &pipeline_id,
            request.variables,
            Initiator {
                kind: InitiatorKind::Manual,
                name,
                reason: "manual run via api".into(),
            },
        )
        .await?;

    Ok(Json(StartRunResponse { run }))
}

#[derive(Debug, Default, Deserialize)]
struct CancelQuery {
    /// Skip the graceful stop window and kill containers immediately.
    #[serde(default)]
    force: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id)): Path<(String, String, u64)>,
    Query(query): Query<CancelQuery>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .run_engine
        .cancel_run(&namespace_id, &pipeline_id, run_id, query.force)
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct CancelAllRunsResponse {
    /// Runs that were asked to stop.
    runs: Vec<u64>,
}

async fn cancel_all_runs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelAllRunsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let runs = state
        .run_engine
        .cancel_all_runs(&namespace_id, &pipeline_id, query.force)
        .await?;

    Ok(Json(CancelAllRunsResponse { runs }))
}

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::object_store::Scope;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/objects",
            get(list_pipeline_objects),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/objects/{key}",
            get(get_pipeline_object)
                .put(put_pipeline_object)
                .delete(delete_pipeline_object),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}/objects",
            get(list_run_objects),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}/objects/{key}",
            get(get_run_object)
                .put(put_run_object)
                .delete(delete_run_object),
        )
}

#[derive(Debug, Serialize)]
struct ListObjectsResponse {
    /// Keys in insertion order, oldest first.
    keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PutQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct PutObjectResponse {
    /// Key evicted to make room, when the scope was full.
    evicted: Option<String>,
}

fn pipeline_scope(namespace_id: String, pipeline_id: String) -> Scope {
    Scope::Pipeline {
        namespace_id,
        pipeline_id,
    }
}

fn run_scope(namespace_id: String, pipeline_id: String, run_id: u64) -> Scope {
    Scope::Run {
        namespace_id,
        pipeline_id,
        run_id,
    }
}

async fn list_pipeline_objects(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<Json<ListObjectsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let keys = state
        .object_store
        .list_keys(&pipeline_scope(namespace_id, pipeline_id))
        .await?;

    Ok(Json(ListObjectsResponse { keys }))
}

async fn get_pipeline_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
) -> Result<Bytes, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let content = state
        .object_store
        .get(&pipeline_scope(namespace_id, pipeline_id), &key)
        .await?;

    Ok(Bytes::from(content))
}

async fn put_pipeline_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
    Query(query): Query<PutQuery>,
    body: Bytes,
) -> Result<Json<PutObjectResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let scope = pipeline_scope(namespace_id, pipeline_id);
    let evicted = state
        .object_store
        .put(&scope, &key, body.to_vec(), query.force)
        .await?;

    if let Some(evicted_key) = &evicted {
        let _ = state
            .event_bus
            .publish(gofer::events::Kind::EvictedObject {
                key: evicted_key.clone(),
                scope: scope.to_string(),
            })
            .await;
    }

    Ok(Json(PutObjectResponse { evicted }))
}

async fn delete_pipeline_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .object_store
        .delete(&pipeline_scope(namespace_id, pipeline_id), &key)
        .await?;

    Ok(())
}

async fn list_run_objects(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id)): Path<(String, String, u64)>,
) -> Result<Json<ListObjectsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let keys = state
        .object_store
        .list_keys(&run_scope(namespace_id, pipeline_id, run_id))
        .await?;

    Ok(Json(ListObjectsResponse { keys }))
}

async fn get_run_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, key)): Path<(String, String, u64, String)>,
) -> Result<Bytes, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let content = state
        .object_store
        .get(&run_scope(namespace_id, pipeline_id, run_id), &key)
        .await?;

    Ok(Bytes::from(content))
}

async fn put_run_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, key)): Path<(String, String, u64, String)>,
    Query(query): Query<PutQuery>,
    body: Bytes,
) -> Result<Json<PutObjectResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let evicted = state
        .object_store
        .put(
            &run_scope(namespace_id, pipeline_id, run_id),
            &key,
            body.to_vec(),
            query.force,
        )
        .await?;

    Ok(Json(PutObjectResponse { evicted }))
}

async fn delete_run_object(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, key)): Path<(String, String, u64, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .object_store
        .delete(&run_scope(namespace_id, pipeline_id, run_id), &key)
        .await?;

    Ok(())
}

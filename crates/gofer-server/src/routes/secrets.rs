use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::secret_store::{
    global_secret_key, pipeline_secret_key, pipeline_secret_prefix, GLOBAL_SECRET_PREFIX,
};

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/secrets",
            get(list_pipeline_secrets),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/secrets/{key}",
            get(get_pipeline_secret)
                .put(put_pipeline_secret)
                .delete(delete_pipeline_secret),
        )
        .route("/api/secrets", get(list_global_secrets))
        .route(
            "/api/secrets/{key}",
            get(get_global_secret)
                .put(put_global_secret)
                .delete(delete_global_secret),
        )
}

#[derive(Debug, Serialize)]
struct ListSecretsResponse {
    /// Key names only; values never appear in listings.
    keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GetSecretResponse {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PutSecretRequest {
    value: String,
    #[serde(default)]
    force: bool,
}

async fn list_pipeline_secrets(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<Json<ListSecretsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let prefix = pipeline_secret_prefix(&namespace_id, &pipeline_id);
    let keys = state.secret_store.list_keys(&prefix).await?;

    // Callers see their own key names, not the storage-qualified ones.
    let keys = keys
        .into_iter()
        .map(|key| key.trim_start_matches(&prefix).to_string())
        .collect();

    Ok(Json(ListSecretsResponse { keys }))
}

async fn get_pipeline_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
) -> Result<Json<GetSecretResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let plaintext = state
        .secret_store
        .get(&pipeline_secret_key(&namespace_id, &pipeline_id, &key))
        .await?;

    Ok(Json(GetSecretResponse {
        key,
        value: String::from_utf8_lossy(&plaintext).into_owned(),
    }))
}

async fn put_pipeline_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
    Json(request): Json<PutSecretRequest>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .secret_store
        .put(
            &pipeline_secret_key(&namespace_id, &pipeline_id, &key),
            request.value.into_bytes(),
            request.force,
        )
        .await?;

    Ok(())
}

async fn delete_pipeline_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, key)): Path<(String, String, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .secret_store
        .delete(&pipeline_secret_key(&namespace_id, &pipeline_id, &key))
        .await?;

    Ok(())
}

async fn list_global_secrets(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ListSecretsResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let keys = state.secret_store.list_keys(GLOBAL_SECRET_PREFIX).await?;
    let keys = keys
        .into_iter()
        .map(|key| key.trim_start_matches(GLOBAL_SECRET_PREFIX).to_string())
        .collect();

    Ok(Json(ListSecretsResponse { keys }))
}

async fn get_global_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(key): Path<String>,
) -> Result<Json<GetSecretResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let plaintext = state.secret_store.get(&global_secret_key(&key)).await?;

    Ok(Json(GetSecretResponse {
        key,
        value: String::from_utf8_lossy(&plaintext).into_owned(),
    }))
}

async fn put_global_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(key): Path<String>,
    Json(request): Json<PutSecretRequest>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    state
        .secret_store
        .put(
            &global_secret_key(&key),
            request.value.into_bytes(),
            request.force,
        )
        .await?;

    Ok(())
}

async fn delete_global_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(key): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    state.secret_store.delete(&global_secret_key(&key)).await?;

    Ok(())
}

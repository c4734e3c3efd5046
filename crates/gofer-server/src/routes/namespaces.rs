use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::events::Kind;
use gofer::pipelines::dag::validate_identifier;
use gofer::storage;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/namespaces", get(list_namespaces).post(create_namespace))
        .route(
            "/api/namespaces/{namespace_id}",
            get(get_namespace)
                .put(update_namespace)
                .delete(delete_namespace),
        )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: u64,
}

impl From<storage::namespaces::Namespace> for Namespace {
    fn from(row: storage::namespaces::Namespace) -> Self {
        Namespace {
            id: row.id,
            name: row.name,
            description: row.description,
            created: row.created as u64,
        }
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
struct ListNamespacesResponse {
    namespaces: Vec<Namespace>,
}

async fn list_namespaces(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListNamespacesResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let mut conn = state.storage.conn().await?;
    let rows = storage::namespaces::list(
        &mut conn,
        query.offset,
        query.limit,
        state.settings.server.storage_results_limit,
    )
    .await?;

    Ok(Json(ListNamespacesResponse {
        namespaces: rows.into_iter().map(Namespace::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateNamespaceRequest {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_namespace(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<CreateNamespaceRequest>,
) -> Result<Json<Namespace>, ApiError> {
    preflight(&caller, &request.id, true)?;

    validate_identifier("namespace id", &request.id)
        .map_err(|e| ApiError::InvalidArgument(e.to_string()))?;

    let row = storage::namespaces::Namespace {
        id: request.id.clone(),
        name: request.name,
        description: request.description,
        created: gofer::epoch_milli() as i64,
    };

    let mut conn = state.storage.conn().await?;
    storage::namespaces::insert(&mut conn, &row).await?;
    drop(conn);

    let _ = state
        .event_bus
        .publish(Kind::CreatedNamespace {
            namespace_id: request.id,
        })
        .await;

    Ok(Json(Namespace::from(row)))
}

async fn get_namespace(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(namespace_id): Path<String>,
) -> Result<Json<Namespace>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::namespaces::get(&mut conn, &namespace_id).await?;

    Ok(Json(Namespace::from(row)))
}

#[derive(Debug, Deserialize)]
struct UpdateNamespaceRequest {
    name: Option<String>,
    description: Option<String>,
}

async fn update_namespace(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(namespace_id): Path<String>,
    Json(request): Json<UpdateNamespaceRequest>,
) -> Result<Json<Namespace>, ApiError> {
    preflight(&caller, &namespace_id, true)?;

    let mut conn = state.storage.conn().await?;
    storage::namespaces::update(&mut conn, &namespace_id, request.name, request.description)
        .await?;
    let row = storage::namespaces::get(&mut conn, &namespace_id).await?;

    Ok(Json(Namespace::from(row)))
}

async fn delete_namespace(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(namespace_id): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, true)?;

    if namespace_id == crate::auth::DEFAULT_NAMESPACE {
        return Err(ApiError::FailedPrecondition(
            "the default namespace cannot be deleted".into(),
        ));
    }

    let mut conn = state.storage.conn().await?;
    storage::namespaces::delete(&mut conn, &namespace_id).await?;
    drop(conn);

    let _ = state
        .event_bus
        .publish(Kind::DeletedNamespace { namespace_id })
        .await;

    Ok(())
}

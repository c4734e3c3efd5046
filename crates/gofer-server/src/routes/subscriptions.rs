use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::extensions::Subscription;
use gofer::storage;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/subscriptions/{extension_name}/{extension_label}",
            get(get_subscription).delete(delete_subscription),
        )
}

#[derive(Debug, Serialize)]
struct ListSubscriptionsResponse {
    subscriptions: Vec<Subscription>,
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
) -> Result<Json<ListSubscriptionsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let subscriptions = state
        .extensions
        .list_subscriptions(&namespace_id, &pipeline_id)
        .await?;

    Ok(Json(ListSubscriptionsResponse { subscriptions }))
}

#[derive(Debug, Serialize)]
struct GetSubscriptionResponse {
    subscription: Subscription,
}

async fn get_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, extension_name, extension_label)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> Result<Json<GetSubscriptionResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::subscriptions::get(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        &extension_name,
        &extension_label,
    )
    .await?;

    Ok(Json(GetSubscriptionResponse {
        subscription: Subscription::try_from(row)?,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionRequest {
    extension_name: String,
    extension_label: String,
    #[serde(default)]
    settings: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionResponse {
    subscription: Subscription,
}

async fn create_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id)): Path<(String, String)>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<Json<CreateSubscriptionResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    // The pipeline must exist before an extension starts firing at it.
    let mut conn = state.storage.conn().await?;
    storage::pipeline_metadata::get(&mut conn, &namespace_id, &pipeline_id).await?;
    drop(conn);

    let subscription = state
        .extensions
        .subscribe(
            &namespace_id,
            &pipeline_id,
            &request.extension_name,
            &request.extension_label,
            request.settings,
        )
        .await?;

    Ok(Json(CreateSubscriptionResponse { subscription }))
}

async fn delete_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, extension_name, extension_label)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    state
        .extensions
        .unsubscribe(&namespace_id, &pipeline_id, &extension_name, &extension_label)
        .await?;

    Ok(())
}

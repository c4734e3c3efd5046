use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::extensions::registry::InstallRequest;
use gofer::extensions::{Registration, State as ExtensionState};
use gofer::scheduler::RegistryAuth;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/extensions", get(list_extensions).post(install_extension))
        .route(
            "/api/extensions/{name}",
            get(get_extension).delete(uninstall_extension),
        )
        .route("/api/extensions/{name}/enable", put(enable_extension))
        .route("/api/extensions/{name}/disable", put(disable_extension))
        .route("/api/extensions/{name}/resolve", post(resolve))
}

/// What the API shows for an extension; the callback key never leaves the
/// server.
#[derive(Debug, Serialize)]
struct ExtensionView {
    registration: Registration,
    url: Option<String>,
    state: ExtensionState,
    started: u64,
}

impl From<gofer::extensions::Extension> for ExtensionView {
    fn from(extension: gofer::extensions::Extension) -> Self {
        ExtensionView {
            registration: extension.registration,
            url: extension.url,
            state: extension.state,
            started: extension.started,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListExtensionsResponse {
    extensions: Vec<ExtensionView>,
}

async fn list_extensions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ListExtensionsResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let extensions = state.extensions.list_extensions().await?;

    Ok(Json(ListExtensionsResponse {
        extensions: extensions.into_iter().map(ExtensionView::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct GetExtensionResponse {
    extension: ExtensionView,
}

async fn get_extension(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<GetExtensionResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let extension = state.extensions.get_extension(&name).await?;

    Ok(Json(GetExtensionResponse {
        extension: ExtensionView::from(extension),
    }))
}

#[derive(Debug, Deserialize)]
struct InstallExtensionRequest {
    name: String,
    image: String,
    registry_auth: Option<RegistryAuth>,

    /// Config map for the extension, either captured from the installer
    /// dialog or supplied directly.
    #[serde(default)]
    settings: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct InstallExtensionResponse {
    registration: Registration,
}

async fn install_extension(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<InstallExtensionRequest>,
) -> Result<Json<InstallExtensionResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let registration = state
        .extensions
        .install(InstallRequest {
            name: request.name,
            image: request.image,
            registry_auth: request.registry_auth,
            settings: request.settings,
        })
        .await?;

    Ok(Json(InstallExtensionResponse { registration }))
}

async fn enable_extension(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.extensions.enable(&name).await?;
    Ok(())
}

async fn disable_extension(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.extensions.disable(&name).await?;
    Ok(())
}

async fn uninstall_extension(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.extensions.uninstall(&name).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    namespace_id: String,
    pipeline_id: String,
    extension_label: String,
    #[serde(default)]
    variables: HashMap<String, String>,
}

/// Callback surface for extensions. Authenticated by the per-extension key
/// handed to the container at start, not by a bearer token.
async fn resolve(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ResolveRequest>,
) -> Result<(), ApiError> {
    let key = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthenticated)?;

    state
        .extensions
        .resolve(
            &name,
            key,
            &request.namespace_id,
            &request.pipeline_id,
            &request.extension_label,
            request.variables,
        )
        .await?;

    Ok(())
}

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use gofer::auth::{Token, TokenKind};

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tokens", get(list_tokens).post(create_token))
        .route("/api/tokens/bootstrap", post(bootstrap))
        .route("/api/tokens/whoami", get(whoami))
        .route("/api/tokens/{id}", get(get_token).delete(delete_token))
        .route("/api/tokens/{id}/enable", put(enable_token))
        .route("/api/tokens/{id}/disable", put(disable_token))
}

#[derive(Debug, Serialize)]
struct CreatedTokenResponse {
    token: Token,

    /// Shown exactly once; only the hash is stored.
    secret: String,
}

/// Create the first management token. Open (no auth) but succeeds exactly
/// once per installation.
async fn bootstrap(
    State(state): State<AppState>,
) -> Result<Json<CreatedTokenResponse>, ApiError> {
    let created = state.auth.bootstrap().await?;

    Ok(Json(CreatedTokenResponse {
        token: created.token,
        secret: created.plaintext,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    kind: TokenKind,

    /// Regex patterns for grantable namespaces. Ignored for management
    /// tokens, which can reach everything.
    #[serde(default)]
    namespaces: Vec<String>,

    #[serde(default)]
    metadata: HashMap<String, String>,

    /// Seconds until expiry; 0 means never.
    #[serde(default)]
    expires_secs: u64,
}

async fn create_token(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Json<CreatedTokenResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let created = state
        .auth
        .create_token(
            request.kind,
            request.namespaces,
            request.metadata,
            Duration::from_secs(request.expires_secs),
        )
        .await?;

    Ok(Json(CreatedTokenResponse {
        token: created.token,
        secret: created.plaintext,
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Serialize)]
struct ListTokensResponse {
    tokens: Vec<Token>,
}

async fn list_tokens(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListTokensResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let tokens = state.auth.list_tokens(query.offset, query.limit).await?;

    Ok(Json(ListTokensResponse { tokens }))
}

#[derive(Debug, Serialize)]
struct GetTokenResponse {
    token: Token,
}

async fn get_token(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<GetTokenResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;

    let token = state.auth.get_token(&id).await?;

    Ok(Json(GetTokenResponse { token }))
}

/// The token behind the current request.
async fn whoami(
    Extension(caller): Extension<Caller>,
) -> Result<Json<GetTokenResponse>, ApiError> {
    match caller {
        Caller::Token(token) => Ok(Json(GetTokenResponse { token })),
        Caller::Bypassed => Err(ApiError::FailedPrecondition(
            "authentication is bypassed; there is no current token".into(),
        )),
    }
}

async fn enable_token(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.auth.set_token_disabled(&id, false).await?;
    Ok(())
}

async fn disable_token(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.auth.set_token_disabled(&id, true).await?;
    Ok(())
}

async fn delete_token(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<(), ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, true)?;
    state.auth.delete_token(&id).await?;
    Ok(())
}

//! Bearer token middleware and per-handler preflight checks.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use gofer::auth::{has_access, Token, TokenKind};

use crate::errors::ApiError;
use crate::state::AppState;

/// Paths that manage their own authentication.
const OPEN_PATHS: [&str; 1] = ["/api/tokens/bootstrap"];

/// What the middleware learned about the caller, attached to the request for
/// handlers to gate on.
#[derive(Debug, Clone)]
pub enum Caller {
    /// Auth is switched off in development configuration.
    Bypassed,

    Token(Token),
}

/// Resolve the bearer token on every request. Handlers receive a [`Caller`]
/// request extension; requests without a valid token are rejected here.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    // Extension callbacks (/api/extensions/{name}/resolve) authenticate with
    // their per-extension key instead of a bearer token; the handler
    // verifies it.
    let segments: Vec<&str> = path.split('/').collect();
    let extension_callback = matches!(
        segments.as_slice(),
        ["", "api", "extensions", _, "resolve"]
    );
    if OPEN_PATHS.contains(&path.as_str()) || extension_callback {
        return Ok(next.run(request).await);
    }

    if state.settings.development.bypass_auth {
        request.extensions_mut().insert(Caller::Bypassed);
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthenticated)?;

    let token = state.auth.authenticate(token).await?;
    request.extensions_mut().insert(Caller::Token(token));

    Ok(next.run(request).await)
}

/// Namespace used when the caller does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Check that the caller may act on `namespace_id`, optionally requiring a
/// management token. Every handler calls this before doing work.
pub fn preflight(
    caller: &Caller,
    namespace_id: &str,
    management_only: bool,
) -> Result<(), ApiError> {
    let token = match caller {
        Caller::Bypassed => return Ok(()),
        Caller::Token(token) => token,
    };

    if management_only && token.kind != TokenKind::Management {
        return Err(ApiError::PermissionDenied(
            "this operation requires a management token".into(),
        ));
    }

    if !has_access(token, namespace_id) {
        return Err(ApiError::PermissionDenied(format!(
            "token does not grant access to namespace '{namespace_id}'"
        )));
    }

    Ok(())
}

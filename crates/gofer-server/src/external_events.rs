//! The optional secondary listener for external (webhook style) events.
//!
//! Third parties cannot be asked to hold Gofer credentials, so this listener
//! accepts raw payloads addressed to an extension and forwards them; the
//! extension decides what, if anything, they resolve to and calls back into
//! the main API with its own key.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/external/{extension_name}", post(forward_external_event))
        .with_state(state)
}

/// Hand an external payload to the named extension's webhook surface. The
/// listener is deliberately dumb: no auth, no parsing, bounded forwarding.
async fn forward_external_event(
    State(state): State<AppState>,
    Path(extension_name): Path<String>,
    body: Bytes,
) -> StatusCode {
    let extension = match state.extensions.get_extension(&extension_name).await {
        Ok(extension) => extension,
        Err(_) => {
            debug!(extension = extension_name, "external event for unknown extension");
            return StatusCode::NOT_FOUND;
        }
    };

    if extension.state != gofer::extensions::State::Running {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let Some(url) = extension.url else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    let client = reqwest_client();
    let result = client
        .post(format!("{url}/api/external-event"))
        .bearer_auth(&extension.secret_key)
        .body(body.to_vec())
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => StatusCode::OK,
        Ok(response) => {
            warn!(
                extension = extension_name,
                status = %response.status(),
                "extension rejected external event"
            );
            StatusCode::BAD_GATEWAY
        }
        Err(e) => {
            warn!(extension = extension_name, error = %e, "could not forward external event");
            StatusCode::BAD_GATEWAY
        }
    }
}

fn reqwest_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// Bind and serve the external events listener until shutdown.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind_address = state.settings.external_events.bind_address.clone();
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = bind_address, "external events listener started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

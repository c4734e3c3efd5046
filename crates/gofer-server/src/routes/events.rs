use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Extension, Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use gofer::events::Event;
use gofer::storage;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/events", get(list_events))
        .route("/api/events/stream", get(stream_events))
        .route("/api/events/{id}", get(get_event))
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
struct ListEventsResponse {
    events: Vec<Event>,
}

async fn list_events(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListEventsResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let mut conn = state.storage.conn().await?;
    let rows = storage::events::list(
        &mut conn,
        query.offset,
        query.limit,
        state.settings.server.storage_results_limit,
        query.reverse,
    )
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(Event::try_from(row).map_err(|e| ApiError::Internal(e.to_string()))?);
    }

    Ok(Json(ListEventsResponse { events }))
}

#[derive(Debug, Serialize)]
struct GetEventResponse {
    event: Event,
}

async fn get_event(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> Result<Json<GetEventResponse>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::events::get(&mut conn, id as i64).await?;

    Ok(Json(GetEventResponse {
        event: Event::try_from(row).map_err(|e| ApiError::Internal(e.to_string()))?,
    }))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    /// Event id to replay from. Omitted means live events only.
    from: Option<u64>,
}

/// Stream events over SSE: history from `from` in id order, then live
/// delivery as events are published.
async fn stream_events(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    preflight(&caller, crate::auth::DEFAULT_NAMESPACE, false)?;

    let receiver = match query.from {
        Some(from) => state.event_bus.replay(from),
        None => {
            // Live-only: adapt a subscription onto the same channel shape.
            let mut subscription = state.event_bus.subscribe(&[]);
            let (tx, rx) = tokio::sync::mpsc::channel(100);
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            rx
        }
    };

    let stream = ReceiverStream::new(receiver).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
        Ok(SseEvent::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Extension, Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};

use gofer::run_engine::logs;
use gofer::runs::task_execution::{State as TaskState, TaskExecution};
use gofer::scheduler::task_container_id;
use gofer::storage;

use crate::auth::{preflight, Caller};
use crate::errors::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}/tasks",
            get(list_task_executions),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}/tasks/{task_id}",
            get(get_task_execution).delete(cancel_task_execution),
        )
        .route(
            "/api/namespaces/{namespace_id}/pipelines/{pipeline_id}/runs/{run_id}/tasks/{task_id}/logs",
            get(get_logs).delete(delete_logs),
        )
}

#[derive(Debug, Serialize)]
struct ListTaskExecutionsResponse {
    task_executions: Vec<TaskExecution>,
}

async fn list_task_executions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id)): Path<(String, String, u64)>,
) -> Result<Json<ListTaskExecutionsResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let rows = storage::task_executions::list(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
    )
    .await?;

    let mut task_executions = Vec::with_capacity(rows.len());
    for row in rows {
        task_executions.push(TaskExecution::try_from(row)?);
    }

    Ok(Json(ListTaskExecutionsResponse { task_executions }))
}

#[derive(Debug, Serialize)]
struct GetTaskExecutionResponse {
    task_execution: TaskExecution,
}

async fn get_task_execution(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, task_id)): Path<(String, String, u64, String)>,
) -> Result<Json<GetTaskExecutionResponse>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::task_executions::get(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
        &task_id,
    )
    .await?;

    Ok(Json(GetTaskExecutionResponse {
        task_execution: TaskExecution::try_from(row)?,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CancelQuery {
    /// Seconds to wait before the container is killed. 0 kills immediately.
    wait_for: Option<u64>,
}

async fn cancel_task_execution(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, task_id)): Path<(String, String, u64, String)>,
    Query(query): Query<CancelQuery>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::task_executions::get(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
        &task_id,
    )
    .await?;
    drop(conn);

    let execution = TaskExecution::try_from(row)?;
    if execution.state != TaskState::Running {
        return Err(ApiError::FailedPrecondition(format!(
            "task execution is {}; only running executions can be cancelled",
            execution.state
        )));
    }

    let timeout = query
        .wait_for
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(
            state.settings.api.task_execution_stop_timeout,
        ));

    state
        .scheduler
        .stop_container(
            &task_container_id(&namespace_id, &pipeline_id, run_id, &task_id),
            timeout,
        )
        .await?;

    Ok(())
}

/// Stream a task execution's log file as server-sent events. The stream ends
/// when the file's sentinel is reached.
async fn get_logs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, task_id)): Path<(String, String, u64, String)>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::task_executions::get(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
        &task_id,
    )
    .await?;
    drop(conn);

    let execution = TaskExecution::try_from(row)?;
    if execution.logs_removed {
        return Err(ApiError::FailedPrecondition(
            "logs for this task execution have been removed".into(),
        ));
    }
    if execution.logs_expired {
        return Err(ApiError::FailedPrecondition(
            "logs for this task execution have expired".into(),
        ));
    }

    let path = state
        .run_engine
        .task_log_path(&namespace_id, &pipeline_id, run_id, &task_id);

    let mut lines = logs::tail(path);
    let stream = async_stream_lines(move |tx| async move {
        while let Some(line) = lines.recv().await {
            match line {
                Ok(line) => {
                    if tx.send(Ok(SseEvent::default().data(line))).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Adapt a channel-filling closure into a stream without pulling in another
/// dependency.
fn async_stream_lines<F, Fut>(
    fill: F,
) -> impl Stream<Item = Result<SseEvent, Infallible>>
where
    F: FnOnce(tokio::sync::mpsc::Sender<Result<SseEvent, Infallible>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(100);
    tokio::spawn(fill(tx));
    tokio_stream::wrappers::ReceiverStream::new(rx)
}

async fn delete_logs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace_id, pipeline_id, run_id, task_id)): Path<(String, String, u64, String)>,
) -> Result<(), ApiError> {
    preflight(&caller, &namespace_id, false)?;

    let mut conn = state.storage.conn().await?;
    let row = storage::task_executions::get(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
        &task_id,
    )
    .await?;

    let execution = TaskExecution::try_from(row)?;
    if execution.state != TaskState::Complete {
        return Err(ApiError::FailedPrecondition(
            "logs can only be removed once the task execution is complete".into(),
        ));
    }

    let path = state
        .run_engine
        .task_log_path(&namespace_id, &pipeline_id, run_id, &task_id);
    logs::remove(&path)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    storage::task_executions::update(
        &mut conn,
        &namespace_id,
        &pipeline_id,
        run_id as i64,
        &task_id,
        storage::task_executions::UpdatableFields {
            logs_removed: Some(true),
            ..Default::default()
        },
    )
    .await?;

    Ok(())
}

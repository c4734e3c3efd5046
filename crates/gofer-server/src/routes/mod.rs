//! Route registration. Handlers stay thin: preflight, dispatch to a service,
//! map the result.

pub mod events;
pub mod extensions;
pub mod namespaces;
pub mod objects;
pub mod pipeline_configs;
pub mod pipelines;
pub mod runs;
pub mod secrets;
pub mod subscriptions;
pub mod system;
pub mod task_executions;
pub mod tokens;

use axum::middleware;
use axum::Router;

use crate::auth::authenticate;
use crate::state::AppState;

pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(namespaces::router())
        .merge(pipelines::router())
        .merge(pipeline_configs::router())
        .merge(runs::router())
        .merge(task_executions::router())
        .merge(extensions::router())
        .merge(subscriptions::router())
        .merge(secrets::router())
        .merge(objects::router())
        .merge(tokens::router())
        .merge(events::router())
        .merge(system::router())
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state)
}

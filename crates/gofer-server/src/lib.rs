//! HTTP control plane for Gofer: request routing, auth gating, and the
//! mapping from service errors onto API responses. All business logic lives
//! in the `gofer` crate; handlers here validate, dispatch, and render.

pub mod auth;
pub mod errors;
pub mod external_events;
pub mod logging;
pub mod routes;
pub mod state;

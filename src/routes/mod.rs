//! Route tables. `app` mounts everything at the root path.

mod common;
mod records;
mod schema;

pub use common::common_routes;
pub use records::record_routes;
pub use schema::schema_routes;

use crate::state::AppState;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

/// Full REST surface with the configured request body limit.
pub fn app(state: AppState) -> Router {
    let limit = state.settings.body_limit_bytes;
    Router::new()
        .merge(common_routes(state.clone()))
        .merge(schema_routes(state.clone()))
        .merge(record_routes(state))
        .layer(RequestBodyLimitLayer::new(limit))
}

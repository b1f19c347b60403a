//! Runtime data routes. The entity is resolved by name per request against its published version.

use crate::handlers::records::{
    bulk_create, bulk_delete, bulk_update, create, delete as delete_handler, list, query, read, update,
};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn record_routes(state: AppState) -> Router {
    Router::new()
        .route("/dynamic-data/:entity/records", get(list).post(create))
        .route("/dynamic-data/:entity/records/query", post(query))
        .route(
            "/dynamic-data/:entity/records/bulk",
            post(bulk_create).put(bulk_update).delete(bulk_delete),
        )
        .route(
            "/dynamic-data/:entity/records/:id",
            get(read).put(update).delete(delete_handler),
        )
        .with_state(state)
}

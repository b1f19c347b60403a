//! Registry and lifecycle routes. Every path takes ids as UUIDs; the tenant comes from headers.

use crate::handlers::{migration, schema};
use crate::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};

pub fn schema_routes(state: AppState) -> Router {
    Router::new()
        .route("/entities", post(schema::create_entity).get(schema::list_entities))
        .route(
            "/entities/:id",
            get(schema::get_entity).put(schema::update_entity).delete(schema::delete_entity),
        )
        .route("/entities/:id/fields", post(schema::add_field).get(schema::list_fields))
        .route(
            "/entities/:id/fields/:field_id",
            get(schema::get_field).put(schema::update_field).delete(schema::delete_field),
        )
        .route("/entities/:id/indexes", post(schema::add_index).get(schema::list_indexes))
        .route("/entities/:id/indexes/:index_id", delete(schema::delete_index))
        .route("/relationships", post(schema::add_relationship).get(schema::list_relationships))
        .route(
            "/relationships/:id",
            get(schema::get_relationship).delete(schema::delete_relationship),
        )
        .route("/entities/:id/preview-migration", post(migration::preview))
        .route("/entities/:id/publish", post(migration::publish))
        .route("/entities/:id/archive", post(migration::archive))
        .route("/entities/:id/recover", post(migration::recover))
        .route("/entities/:id/migrations", get(migration::list_migrations))
        .route("/entities/:id/projection", get(migration::projection))
        .route("/migrations/:id/rollback", post(migration::rollback))
        .with_state(state)
}

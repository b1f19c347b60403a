#![allow(dead_code)]

use schemaforge::schema::{EntityDefinition, FieldDefinition};
use schemaforge::{AppState, RequestContext, Settings};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub const TENANT: &str = "acme";

pub fn payload<T: DeserializeOwned>(v: Value) -> T {
    serde_json::from_value(v).expect("payload")
}

pub fn state() -> AppState {
    AppState::in_memory(Settings::default())
}

pub fn ctx(tenant: &str) -> RequestContext {
    RequestContext::new(tenant, "alice", "admin")
}

pub async fn entity(state: &AppState, tenant: &str, name: &str) -> EntityDefinition {
    state
        .registry
        .create_entity(tenant, payload(json!({ "name": name })))
        .await
        .expect("create entity")
}

pub async fn field(state: &AppState, tenant: &str, entity: &EntityDefinition, body: Value) -> FieldDefinition {
    state
        .registry
        .add_field(tenant, entity.id, payload(body))
        .await
        .expect("add field")
}

/// `customer(name: required string, email: unique email)`, published as version 1.
pub async fn published_customer(state: &AppState, tenant: &str) -> EntityDefinition {
    let e = entity(state, tenant, "customer").await;
    field(
        state,
        tenant,
        &e,
        json!({"name": "name", "field_type": {"type": "string"}, "constraints": {"required": true, "max_length": 120}}),
    )
    .await;
    field(
        state,
        tenant,
        &e,
        json!({"name": "email", "field_type": {"type": "email"}, "constraints": {"unique": true}}),
    )
    .await;
    state.migrations.publish(tenant, e.id, "alice").await.expect("publish").entity
}

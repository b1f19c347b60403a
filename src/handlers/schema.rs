//! Schema registry handlers: entities, fields, relationships and indexes. Metadata only.

use crate::error::AppError;
use crate::extractors::JsonBody;
use crate::handlers::parse_id;
use crate::response::{success_many, success_one, success_one_ok};
use crate::schema::{EntityPatch, FieldPatch, NewEntity, NewField, NewIndex, NewRelationship};
use crate::service::access::{require, SCHEMA_MANAGE};
use crate::service::RequestContext;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

fn manage(state: &AppState, ctx: &RequestContext) -> Result<(), AppError> {
    require(state.access.as_ref(), ctx, SCHEMA_MANAGE)
}

pub async fn create_entity(
    State(state): State<AppState>,
    ctx: RequestContext,
    JsonBody(body): JsonBody<NewEntity>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    let entity = state.registry.create_entity(&ctx.tenant_id, body).await?;
    Ok(success_one(entity))
}

pub async fn list_entities(State(state): State<AppState>, ctx: RequestContext) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_many(state.registry.list_entities(&ctx.tenant_id).await?))
}

pub async fn get_entity(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one_ok(state.registry.get_entity(&ctx.tenant_id, parse_id(&id)?).await?))
}

pub async fn update_entity(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<EntityPatch>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one_ok(state.registry.update_entity(&ctx.tenant_id, parse_id(&id)?, body).await?))
}

pub async fn delete_entity(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    state.registry.delete_entity(&ctx.tenant_id, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_field(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity_id): Path<String>,
    JsonBody(body): JsonBody<NewField>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one(state.registry.add_field(&ctx.tenant_id, parse_id(&entity_id)?, body).await?))
}

pub async fn list_fields(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_many(state.registry.list_fields(&ctx.tenant_id, parse_id(&entity_id)?).await?))
}

pub async fn get_field(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity_id, field_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    let field = state.registry.get_field(&ctx.tenant_id, parse_id(&entity_id)?, parse_id(&field_id)?).await?;
    Ok(success_one_ok(field))
}

pub async fn update_field(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity_id, field_id)): Path<(String, String)>,
    JsonBody(body): JsonBody<FieldPatch>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    let field = state
        .registry
        .update_field(&ctx.tenant_id, parse_id(&entity_id)?, parse_id(&field_id)?, body)
        .await?;
    Ok(success_one_ok(field))
}

pub async fn delete_field(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity_id, field_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    state.registry.delete_field(&ctx.tenant_id, parse_id(&entity_id)?, parse_id(&field_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_relationship(
    State(state): State<AppState>,
    ctx: RequestContext,
    JsonBody(body): JsonBody<NewRelationship>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one(state.registry.add_relationship(&ctx.tenant_id, body).await?))
}

pub async fn list_relationships(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_many(state.registry.list_relationships(&ctx.tenant_id).await?))
}

pub async fn get_relationship(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one_ok(state.registry.get_relationship(&ctx.tenant_id, parse_id(&id)?).await?))
}

pub async fn delete_relationship(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    state.registry.delete_relationship(&ctx.tenant_id, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_index(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity_id): Path<String>,
    JsonBody(body): JsonBody<NewIndex>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_one(state.registry.add_index(&ctx.tenant_id, parse_id(&entity_id)?, body).await?))
}

pub async fn list_indexes(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    Ok(success_many(state.registry.list_indexes(&ctx.tenant_id, parse_id(&entity_id)?).await?))
}

pub async fn delete_index(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity_id, index_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    manage(&state, &ctx)?;
    state.registry.delete_index(&ctx.tenant_id, parse_id(&entity_id)?, parse_id(&index_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

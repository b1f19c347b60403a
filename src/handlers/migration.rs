//! Lifecycle handlers: preview, publish, rollback, archive, recover and the published projection.

use crate::error::AppError;
use crate::handlers::parse_id;
use crate::response::{success_many, success_one_ok};
use crate::service::access::{require, SCHEMA_MANAGE};
use crate::service::RequestContext;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
};

pub async fn preview(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    Ok(success_one_ok(state.migrations.preview(&ctx.tenant_id, parse_id(&id)?).await?))
}

pub async fn publish(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    let outcome = state.migrations.publish(&ctx.tenant_id, parse_id(&id)?, &ctx.user_id).await?;
    Ok(success_one_ok(outcome))
}

pub async fn list_migrations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    Ok(success_many(state.migrations.migrations(&ctx.tenant_id, parse_id(&id)?).await?))
}

pub async fn rollback(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    let entity = state.migrations.rollback(&ctx.tenant_id, parse_id(&id)?, &ctx.user_id).await?;
    Ok(success_one_ok(entity))
}

pub async fn archive(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    let entity = state.migrations.archive(&ctx.tenant_id, parse_id(&id)?, &ctx.user_id).await?;
    Ok(success_one_ok(entity))
}

pub async fn recover(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(state.access.as_ref(), &ctx, SCHEMA_MANAGE)?;
    Ok(success_one_ok(state.migrations.recover(&ctx.tenant_id, parse_id(&id)?).await?))
}

/// Projection reads are open to any caller that can read the entity's records.
pub async fn projection(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let projection = state.migrations.projection(&ctx.tenant_id, parse_id(&id)?).await?;
    require(state.access.as_ref(), &ctx, &format!("{}.read", projection.name))?;
    Ok(success_one_ok(projection))
}

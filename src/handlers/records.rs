//! Runtime data handlers under `/dynamic-data/:entity/records`.

use crate::error::AppError;
use crate::extractors::JsonBody;
use crate::handlers::parse_id;
use crate::query::{parse_sort, FilterNode, ListRequest};
use crate::response::{success_one, success_one_ok, success_page};
use crate::service::RequestContext;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(String::from).collect()
}

/// Build a list request from query parameters. Unreserved keys become `field = value` filters.
fn list_request(params: Vec<(String, String)>) -> Result<ListRequest, AppError> {
    let mut req = ListRequest::default();
    let mut filter = None;
    let mut pairs: Vec<(String, Value)> = Vec::new();
    for (k, v) in params {
        match k.as_str() {
            "filter" => {
                let parsed: Value =
                    serde_json::from_str(&v).map_err(|e| AppError::field("filter", format!("invalid JSON: {}", e)))?;
                filter = Some(FilterNode::parse(&parsed)?);
            }
            "sort" => req.sort = parse_sort(&v),
            "q" | "search" => req.search = Some(v),
            "include" => req.include = split_list(&v),
            "limit" => {
                req.limit = Some(v.parse().map_err(|_| AppError::field("limit", "must be a non-negative integer"))?);
            }
            "offset" => {
                req.offset = Some(v.parse().map_err(|_| AppError::field("offset", "must be a non-negative integer"))?);
            }
            _ => pairs.push((k, Value::String(v))),
        }
    }
    req.filter = match (filter, FilterNode::equalities(pairs)) {
        (Some(f), Some(FilterNode::And(mut eq))) => {
            eq.insert(0, f);
            Some(FilterNode::And(eq))
        }
        (Some(f), _) => Some(f),
        (None, eq) => eq,
    };
    Ok(req)
}

#[derive(Deserialize)]
pub struct IncludeParams {
    #[serde(default)]
    include: Option<String>,
}

#[derive(Deserialize)]
pub struct BulkItems {
    items: Vec<Value>,
    #[serde(default)]
    all_or_nothing: bool,
}

#[derive(Deserialize)]
pub struct BulkIds {
    ids: Vec<Uuid>,
    #[serde(default)]
    all_or_nothing: bool,
}

pub async fn list(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, AppError> {
    let req = list_request(params)?;
    Ok(success_page(state.crud.list(&ctx, &entity, &req).await?))
}

pub async fn query(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    JsonBody(req): JsonBody<ListRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(success_page(state.crud.list(&ctx, &entity, &req).await?))
}

pub async fn create(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> Result<impl IntoResponse, AppError> {
    Ok(success_one(state.crud.create(&ctx, &entity, body).await?))
}

pub async fn read(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity, id)): Path<(String, String)>,
    Query(params): Query<IncludeParams>,
) -> Result<impl IntoResponse, AppError> {
    let include = params.include.as_deref().map(split_list).unwrap_or_default();
    let record = state.crud.get(&ctx, &entity, parse_id(&id)?, &include).await?;
    Ok(success_one_ok(record))
}

pub async fn update(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity, id)): Path<(String, String)>,
    JsonBody(body): JsonBody<Value>,
) -> Result<impl IntoResponse, AppError> {
    Ok(success_one_ok(state.crud.update(&ctx, &entity, parse_id(&id)?, body).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((entity, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(success_one_ok(state.crud.delete(&ctx, &entity, parse_id(&id)?).await?))
}

pub async fn bulk_create(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<BulkItems>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.crud.bulk_create(&ctx, &entity, body.items, body.all_or_nothing).await?;
    Ok((StatusCode::OK, Json(result)))
}

pub async fn bulk_update(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<BulkItems>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.crud.bulk_update(&ctx, &entity, body.items, body.all_or_nothing).await?;
    Ok((StatusCode::OK, Json(result)))
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(entity): Path<String>,
    JsonBody(body): JsonBody<BulkIds>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.crud.bulk_delete(&ctx, &entity, body.ids, body.all_or_nothing).await?;
    Ok((StatusCode::OK, Json(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operator;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn reserved_keys_and_equalities() {
        let req = list_request(params(&[
            ("sort", "-created_at,name"),
            ("limit", "10"),
            ("offset", "20"),
            ("include", "orders, owner"),
            ("status", "open"),
        ]))
        .unwrap();
        assert_eq!(req.sort.len(), 2);
        assert_eq!(req.limit, Some(10));
        assert_eq!(req.offset, Some(20));
        assert_eq!(req.include, vec!["orders".to_string(), "owner".to_string()]);
        let Some(FilterNode::And(conds)) = req.filter else { panic!("expected and") };
        assert!(matches!(&conds[0], FilterNode::Condition { field, op: Operator::Eq, .. } if field == "status"));
    }

    #[test]
    fn json_filter_is_combined_with_equalities() {
        let req = list_request(params(&[
            ("filter", r#"{"field":"age","op":"gte","value":18}"#),
            ("city", "Oslo"),
        ]))
        .unwrap();
        let Some(FilterNode::And(conds)) = req.filter else { panic!("expected and") };
        assert_eq!(conds.len(), 2);
        assert!(matches!(&conds[0], FilterNode::Condition { op: Operator::Gte, .. }));
    }

    #[test]
    fn malformed_parameters_are_validation_errors() {
        assert!(matches!(
            list_request(params(&[("limit", "ten")])),
            Err(AppError::Validation { field: Some(f), .. }) if f == "limit"
        ));
        assert!(matches!(
            list_request(params(&[("filter", "{oops")])),
            Err(AppError::Validation { field: Some(f), .. }) if f == "filter"
        ));
    }
}

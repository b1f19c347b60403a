//! Standard response envelope helpers.

use crate::service::ListPage;
use axum::{http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Serialize)]
pub struct SuccessMany<T> {
    pub data: Vec<T>,
    pub meta: MetaCount,
}

#[derive(Serialize)]
pub struct MetaCount {
    pub count: u64,
}

#[derive(Serialize)]
pub struct SuccessPage {
    pub data: Vec<Value>,
    pub meta: MetaPage,
}

#[derive(Serialize)]
pub struct MetaPage {
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::CREATED, Json(SuccessOne { data, meta: None }))
}

pub fn success_one_ok<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::OK, Json(SuccessOne { data, meta: None }))
}

pub fn success_many<T: Serialize>(data: Vec<T>) -> (StatusCode, Json<SuccessMany<T>>) {
    let count = data.len() as u64;
    (
        StatusCode::OK,
        Json(SuccessMany {
            data,
            meta: MetaCount { count },
        }),
    )
}

pub fn success_page(page: ListPage) -> (StatusCode, Json<SuccessPage>) {
    (
        StatusCode::OK,
        Json(SuccessPage {
            data: page.data,
            meta: MetaPage {
                total: page.total,
                limit: page.limit,
                offset: page.offset,
            },
        }),
    )
}

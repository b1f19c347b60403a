//! Metadata persistence. Records are JSON payloads keyed by (kind, tenant, id),
//! optionally grouped under a parent id, with tenant-wide unique keys.

mod memory;
mod postgres;

pub use memory::MemoryMetadataStore;
pub use postgres::{ensure_database_exists, ensure_sys_tables, qualified_sys_table, PgMetadataStore};

use crate::error::AppError;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetaKind {
    Entity,
    Field,
    Relationship,
    Index,
    Migration,
    Version,
}

impl MetaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKind::Entity => "entity",
            MetaKind::Field => "field",
            MetaKind::Relationship => "relationship",
            MetaKind::Index => "index",
            MetaKind::Migration => "migration",
            MetaKind::Version => "version",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub id: String,
    pub parent_id: Option<String>,
    /// Keys that must be unique within the tenant (e.g. `table:customers`). Replaced wholesale on every put.
    pub unique_keys: Vec<String>,
    pub payload: Value,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace a record. Fails with a validation error if a unique key is held by another record.
    async fn put(&self, kind: MetaKind, tenant_id: &str, record: MetaRecord) -> Result<(), AppError>;

    async fn get(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<Option<Value>, AppError>;

    /// All records of a kind for the tenant, optionally restricted to one parent, ordered by id.
    async fn list(&self, kind: MetaKind, tenant_id: &str, parent_id: Option<&str>) -> Result<Vec<Value>, AppError>;

    /// The record of `kind` currently holding unique key `key`.
    async fn find_by_key(&self, kind: MetaKind, tenant_id: &str, key: &str) -> Result<Option<Value>, AppError>;

    /// Remove a record and release its unique keys. Returns false if it did not exist.
    async fn remove(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<bool, AppError>;
}

pub(crate) fn duplicate_key(key: &str) -> AppError {
    match key.split_once(':') {
        Some((scope, name)) => AppError::validation(format!("{} '{}' already exists", scope, name)),
        None => AppError::validation(format!("'{}' already exists", key)),
    }
}

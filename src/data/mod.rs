//! Physical record storage. Backends evaluate the query IR and apply migration scripts.

pub mod memory;
pub mod postgres;

use crate::error::AppError;
use crate::migration::MigrationScript;
use crate::model::{ModelDescriptor, Record};
use crate::query::{Column, SelectQuery};
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// The entity table a write targets.
#[derive(Clone, Debug)]
pub struct TableRef {
    pub tenant_id: String,
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub soft_delete: bool,
    /// Unique index name -> field reported when the index rejects a write.
    pub unique_constraints: BTreeMap<String, String>,
}

impl TableRef {
    pub fn of(model: &ModelDescriptor) -> Self {
        TableRef {
            tenant_id: model.tenant_id.clone(),
            schema: model.schema.clone(),
            table: model.table.clone(),
            columns: model
                .columns()
                .into_iter()
                .map(|(name, storage)| Column::new(name, storage))
                .collect(),
            soft_delete: model.soft_delete,
            unique_constraints: model.unique_constraints.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// One statement of an atomic write batch. Row-targeting ops only match live rows of the tenant.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// `record` carries every column to store, system columns included.
    Insert { table: TableRef, record: Record },
    Update { table: TableRef, id: Uuid, changes: Record },
    Delete { table: TableRef, id: Uuid },
    SoftDelete {
        table: TableRef,
        id: Uuid,
        deleted_at: String,
        deleted_by: String,
    },
    /// Replace the link set of `id` in a many-to-many junction table.
    ReplaceLinks {
        tenant_id: String,
        schema: String,
        junction: String,
        local_column: String,
        remote_column: String,
        id: Uuid,
        targets: Vec<Uuid>,
    },
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Record>, AppError>;

    async fn count(&self, query: &SelectQuery) -> Result<u64, AppError>;

    /// Apply all ops in one transaction. Returns the affected row per op (`None` for link replacement).
    /// An update or delete matching no row fails the whole batch with `NotFound`.
    async fn write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<Record>>, AppError>;

    /// Execute a migration script atomically.
    async fn migrate(&self, script: &MigrationScript) -> Result<(), AppError>;

    async fn ping(&self) -> Result<(), AppError>;
}

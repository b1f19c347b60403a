//! Migration generator: shapes, diffs, DDL, and the publish/rollback executor.

pub mod ddl;
pub mod diff;
pub mod shape;
pub mod storage;
mod service;

pub use diff::{ChangeKind, RiskLevel, SchemaChange};
pub use service::{EntityGuard, EntityLocks, MigrationService, PublishOutcome};
pub use shape::SchemaShape;
pub use storage::StorageType;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }
}

/// Persisted record of one schema transition. Only status fields change after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMigration {
    pub id: Uuid,
    pub tenant_id: String,
    pub entity_id: Uuid,
    pub from_version: i64,
    pub to_version: i64,
    pub status: MigrationStatus,
    pub up_sql: String,
    pub down_sql: String,
    pub changes: Vec<SchemaChange>,
    /// Every change can be undone without data loss.
    pub reversible: bool,
    pub actor: String,
    /// Version record created by this migration once completed.
    #[serde(default)]
    pub version_id: Option<Uuid>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlannedChange {
    pub kind: ChangeKind,
    pub table: String,
    pub object: String,
    pub risk: RiskLevel,
    pub exact_inverse: bool,
    pub sql: Vec<String>,
}

/// Preview of what `publish` would execute.
#[derive(Clone, Debug, Serialize)]
pub struct MigrationPlan {
    pub entity_id: Uuid,
    pub from_version: i64,
    pub to_version: i64,
    pub risk: RiskLevel,
    pub reversible: bool,
    pub changes: Vec<PlannedChange>,
    pub up_sql: String,
    pub down_sql: String,
    #[serde(skip)]
    pub(crate) up: Vec<SchemaChange>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn build(entity_id: Uuid, from_version: i64, schema: &str, up: Vec<SchemaChange>) -> Self {
        let down = diff::invert_all(&up);
        let changes: Vec<PlannedChange> = up
            .iter()
            .map(|c| PlannedChange {
                kind: c.kind(),
                table: c.table().to_string(),
                object: c.object().to_string(),
                risk: c.risk(),
                exact_inverse: c.exact_inverse(),
                sql: ddl::render(schema, c),
            })
            .collect();
        MigrationPlan {
            entity_id,
            from_version,
            to_version: from_version + 1,
            risk: changes.iter().map(|c| c.risk).max().unwrap_or(RiskLevel::Safe),
            reversible: changes.iter().all(|c| c.exact_inverse),
            up_sql: ddl::script_text(&ddl::render_all(schema, &up)),
            down_sql: ddl::script_text(&ddl::render_all(schema, &down)),
            changes,
            up,
        }
    }
}

/// Ordered changes for one tenant schema, with the rendered statements.
/// SQL backends execute `statements`; the in-memory backend applies `changes`.
#[derive(Clone, Debug)]
pub struct MigrationScript {
    pub tenant_id: String,
    pub schema: String,
    pub changes: Vec<SchemaChange>,
    pub statements: Vec<String>,
}

impl MigrationScript {
    pub fn new(tenant_id: &str, schema: &str, changes: Vec<SchemaChange>) -> Self {
        let statements = ddl::render_all(schema, &changes);
        MigrationScript {
            tenant_id: tenant_id.to_string(),
            schema: schema.to_string(),
            changes,
            statements,
        }
    }
}

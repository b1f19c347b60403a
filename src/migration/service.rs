//! Publish, rollback and archive: the only operations that change physical tables.

use super::diff::{self, SchemaChange};
use super::shape::shape_of;
use super::{EntityMigration, MigrationPlan, MigrationScript, MigrationStatus};
use crate::data::RecordStore;
use crate::error::AppError;
use crate::model::{ModelCache, SchemaProjection};
use crate::schema::{Catalog, DraftGeneration, EntityDefinition, EntitySnapshot, EntityStatus, SchemaVersion};
use crate::service::audit::{AuditAction, AuditLog, AuditRecord};
use crate::service::events::{DomainEvent, EventBus};
use crate::tenant::tenant_schema;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

type LockKey = (String, Uuid);

/// Per-(tenant, entity) locks serializing schema transitions. Never waits: a held lock is a conflict.
///
/// Entries live only while someone holds or contends for them.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    pub fn try_acquire(&self, tenant_id: &str, entity_id: Uuid) -> Result<EntityGuard<'_>, AppError> {
        let key: LockKey = (tenant_id.to_string(), entity_id);
        let lock = self.map().entry(key.clone()).or_default().clone();
        match lock.try_lock_owned() {
            Ok(guard) => Ok(EntityGuard {
                locks: self,
                key,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(&key);
                tracing::warn!(tenant = %tenant_id, entity_id = %entity_id, "schema change rejected: entity is locked");
                Err(AppError::Conflict(format!("entity {} is being changed by another request", entity_id)))
            }
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the entry once the map holds the only reference. Clones are only taken under the map lock.
    fn release(&self, key: &LockKey) {
        let mut map = self.map();
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.map().len()
    }
}

/// Held lock on one entity; releases and prunes the entry on drop.
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PublishOutcome {
    pub entity: EntityDefinition,
    pub migration: EntityMigration,
}

pub struct MigrationService {
    catalog: Catalog,
    records: Arc<dyn RecordStore>,
    models: Arc<ModelCache>,
    locks: Arc<EntityLocks>,
    audit: AuditLog,
    events: EventBus,
    timeout: Duration,
}

impl MigrationService {
    pub fn new(
        catalog: Catalog,
        records: Arc<dyn RecordStore>,
        models: Arc<ModelCache>,
        locks: Arc<EntityLocks>,
        audit: AuditLog,
        events: EventBus,
        timeout: Duration,
    ) -> Self {
        MigrationService {
            catalog,
            records,
            models,
            locks,
            audit,
            events,
            timeout,
        }
    }

    /// FK targets other than the entity itself must already have tables.
    async fn check_targets_published(&self, snapshot: &EntitySnapshot, plan_tables: &[String]) -> Result<(), AppError> {
        for related in &snapshot.related {
            if !plan_tables.contains(&related.table_name) {
                continue;
            }
            let other = self.catalog.require_entity(&snapshot.entity.tenant_id, related.id).await?;
            if other.published_version_id.is_none() {
                return Err(AppError::Conflict(format!(
                    "entity '{}' must be published before '{}'",
                    other.name, snapshot.entity.name
                )));
            }
        }
        Ok(())
    }

    /// Diff between the live published shape and the working definition.
    async fn plan(&self, entity: &EntityDefinition) -> Result<(MigrationPlan, EntitySnapshot), AppError> {
        let working = self.catalog.working_snapshot(&entity.tenant_id, entity).await?;
        let schema = tenant_schema(&entity.tenant_id);
        if entity.is_published() && entity.draft.is_none() {
            return Ok((MigrationPlan::build(entity.id, entity.version, &schema, Vec::new()), working));
        }
        let old = match self.catalog.published_snapshot(entity).await? {
            Some(v) => Some(shape_of(&v.snapshot)?),
            None => None,
        };
        let new = shape_of(&working)?;
        let referenced: Vec<String> = new
            .foreign_keys
            .values()
            .filter(|fk| fk.ref_table != entity.table_name)
            .map(|fk| fk.ref_table.clone())
            .collect();
        self.check_targets_published(&working, &referenced).await?;
        let up = diff::diff(old.as_ref(), &new);
        Ok((MigrationPlan::build(entity.id, entity.version, &schema, up), working))
    }

    pub async fn preview(&self, tenant_id: &str, entity_id: Uuid) -> Result<MigrationPlan, AppError> {
        let entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        if entity.status == EntityStatus::Archived {
            return Err(AppError::Conflict(format!("entity '{}' is archived", entity.name)));
        }
        Ok(self.plan(&entity).await?.0)
    }

    async fn run(&self, script: &MigrationScript) -> Result<(), AppError> {
        if script.changes.is_empty() {
            return Ok(());
        }
        match tokio::time::timeout(self.timeout, self.records.migrate(script)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "migration exceeded {:?} and was rolled back",
                self.timeout
            ))),
        }
    }

    /// Apply the pending draft. Exactly one concurrent publish per entity proceeds.
    pub async fn publish(&self, tenant_id: &str, entity_id: Uuid, actor: &str) -> Result<PublishOutcome, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let mut entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        match entity.status {
            EntityStatus::Archived | EntityStatus::Migrating => {
                return Err(AppError::Conflict(format!(
                    "entity '{}' is {}",
                    entity.name,
                    entity.status.as_str()
                )))
            }
            EntityStatus::Published if entity.draft.is_none() => {
                return Err(AppError::Conflict(format!(
                    "entity '{}' has no pending changes to publish",
                    entity.name
                )))
            }
            _ => {}
        }
        let (plan, working) = self.plan(&entity).await?;
        let first = entity.published_version_id.is_none();
        let now = Utc::now();
        let mut migration = EntityMigration {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            entity_id,
            from_version: entity.version,
            to_version: entity.version + 1,
            status: MigrationStatus::Pending,
            up_sql: plan.up_sql.clone(),
            down_sql: plan.down_sql.clone(),
            changes: plan.up.clone(),
            reversible: plan.reversible,
            actor: actor.to_string(),
            version_id: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            rolled_back_at: None,
        };
        self.catalog.save_migration(&migration).await?;

        if first {
            entity.status = EntityStatus::Migrating;
            self.catalog.save_entity(&entity).await?;
        }
        migration.status = MigrationStatus::Running;
        migration.started_at = Some(Utc::now());
        self.catalog.save_migration(&migration).await?;

        let script = MigrationScript::new(tenant_id, &tenant_schema(tenant_id), plan.up.clone());
        tracing::debug!(tenant = %tenant_id, entity = %entity.name, statements = script.statements.len(), "executing migration");
        if let Err(e) = self.run(&script).await {
            tracing::error!(
                tenant = %tenant_id,
                entity = %entity.name,
                migration_id = %migration.id,
                error = %e,
                "migration failed"
            );
            migration.status = MigrationStatus::Failed;
            migration.error = Some(e.to_string());
            migration.completed_at = Some(Utc::now());
            self.catalog.save_migration(&migration).await?;
            if first {
                entity.status = EntityStatus::Draft;
                self.catalog.save_entity(&entity).await?;
            }
            self.audit
                .record(
                    AuditRecord::new(AuditAction::PublishFailed, tenant_id, &entity.name, actor)
                        .record_id(migration.id)
                        .after(Some(json!({ "error": e.to_string() }))),
                )
                .await?;
            return Err(e);
        }

        let version_id = Uuid::new_v4();
        let from_version = entity.version;
        entity.status = EntityStatus::Published;
        entity.version += 1;
        let parent = entity.published_version_id;
        entity.published_version_id = Some(version_id);
        entity.draft = None;
        entity.updated_at = Utc::now();
        let mut snapshot = working;
        snapshot.entity = entity.clone();
        self.catalog
            .save_version(&SchemaVersion {
                id: version_id,
                entity_id,
                tenant_id: tenant_id.to_string(),
                version: entity.version,
                parent_version_id: parent,
                snapshot,
                created_at: Utc::now(),
            })
            .await?;
        self.catalog.save_entity(&entity).await?;
        migration.status = MigrationStatus::Completed;
        migration.version_id = Some(version_id);
        migration.completed_at = Some(Utc::now());
        self.catalog.save_migration(&migration).await?;

        self.models.invalidate(tenant_id, entity_id);
        self.push_projection(&entity).await;
        self.audit
            .record(
                AuditRecord::new(AuditAction::Publish, tenant_id, &entity.name, actor)
                    .record_id(migration.id)
                    .before(Some(json!({ "version": from_version })))
                    .after(Some(json!({ "version": entity.version, "changes": migration.changes.len() }))),
            )
            .await?;
        tracing::info!(
            tenant = %tenant_id,
            entity = %entity.name,
            version = entity.version,
            changes = migration.changes.len(),
            "entity published"
        );
        Ok(PublishOutcome { entity, migration })
    }

    async fn push_projection(&self, entity: &EntityDefinition) {
        match self.models.get(entity).await {
            Ok(d) => self.events.emit(DomainEvent::SchemaPublished(d.projection())),
            Err(e) => tracing::warn!(tenant = %entity.tenant_id, entity = %entity.name, error = %e, "projection not pushed"),
        }
    }

    pub async fn migrations(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<EntityMigration>, AppError> {
        let entity = self.catalog.entity(tenant_id, entity_id).await?;
        if entity.is_none() {
            return Err(AppError::NotFound(format!("entity {}", entity_id)));
        }
        self.catalog.migrations(tenant_id, entity_id).await
    }

    /// Undo the latest completed migration of an entity with its stored inverse.
    pub async fn rollback(&self, tenant_id: &str, migration_id: Uuid, actor: &str) -> Result<EntityDefinition, AppError> {
        let not_found = || AppError::NotFound(format!("migration {}", migration_id));
        let entity_id = self
            .catalog
            .migration(tenant_id, migration_id)
            .await?
            .ok_or_else(not_found)?
            .entity_id;
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let mut migration = self.catalog.migration(tenant_id, migration_id).await?.ok_or_else(not_found)?;
        if migration.status != MigrationStatus::Completed {
            return Err(AppError::Conflict(format!(
                "migration {} is {}; only completed migrations can be rolled back",
                migration.id,
                migration.status.as_str()
            )));
        }
        let latest = self
            .catalog
            .migrations(tenant_id, entity_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MigrationStatus::Completed)
            .last();
        if latest.map(|m| m.id) != Some(migration.id) {
            return Err(AppError::Conflict(
                "only the latest completed migration of an entity can be rolled back".into(),
            ));
        }
        if let Some(c) = migration.changes.iter().find(|c| !c.exact_inverse()) {
            return Err(AppError::Conflict(format!(
                "change to {}.{} cannot be undone without data loss; publish a forward fix instead",
                c.table(),
                c.object()
            )));
        }
        let mut entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        if entity.status != EntityStatus::Published {
            return Err(AppError::Conflict(format!(
                "entity '{}' is {}",
                entity.name,
                entity.status.as_str()
            )));
        }

        let down: Vec<SchemaChange> = diff::invert_all(&migration.changes);
        let script = MigrationScript::new(tenant_id, &tenant_schema(tenant_id), down);
        if let Err(e) = self.run(&script).await {
            tracing::error!(tenant = %tenant_id, entity = %entity.name, migration_id = %migration.id, error = %e, "rollback failed");
            return Err(e);
        }

        let restored = match migration.version_id {
            Some(vid) => self.catalog.version(tenant_id, vid).await?.and_then(|v| v.parent_version_id),
            None => None,
        };
        let from = entity.version;
        entity.version = migration.from_version;
        entity.published_version_id = restored;
        entity.updated_at = Utc::now();
        match restored {
            Some(parent) => {
                // working metadata still carries the undone edits
                entity.draft = Some(DraftGeneration {
                    parent_version_id: parent,
                    started_at: Utc::now(),
                });
            }
            None => {
                entity.status = EntityStatus::Draft;
                entity.draft = None;
            }
        }
        self.catalog.save_entity(&entity).await?;
        migration.status = MigrationStatus::RolledBack;
        migration.rolled_back_at = Some(Utc::now());
        self.catalog.save_migration(&migration).await?;

        self.models.invalidate(tenant_id, entity_id);
        if entity.published_version_id.is_some() {
            self.push_projection(&entity).await;
        }
        self.audit
            .record(
                AuditRecord::new(AuditAction::Rollback, tenant_id, &entity.name, actor)
                    .record_id(migration.id)
                    .before(Some(json!({ "version": from })))
                    .after(Some(json!({ "version": entity.version }))),
            )
            .await?;
        tracing::info!(tenant = %tenant_id, entity = %entity.name, version = entity.version, "migration rolled back");
        Ok(entity)
    }

    /// Stop serving CRUD for a published entity. History and tables are kept.
    pub async fn archive(&self, tenant_id: &str, entity_id: Uuid, actor: &str) -> Result<EntityDefinition, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let mut entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        if entity.status != EntityStatus::Published {
            return Err(AppError::Conflict(format!(
                "entity '{}' is {}; only published entities can be archived",
                entity.name,
                entity.status.as_str()
            )));
        }
        entity.status = EntityStatus::Archived;
        entity.updated_at = Utc::now();
        self.catalog.save_entity(&entity).await?;
        self.models.invalidate(tenant_id, entity_id);
        self.audit
            .record(AuditRecord::new(AuditAction::Archive, tenant_id, &entity.name, actor).record_id(entity.id))
            .await?;
        tracing::info!(tenant = %tenant_id, entity = %entity.name, "entity archived");
        Ok(entity)
    }

    /// Clear the write block left by a failed descriptor build and rebuild now.
    pub async fn recover(&self, tenant_id: &str, entity_id: Uuid) -> Result<SchemaProjection, AppError> {
        let entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        self.models.recover(tenant_id, entity_id);
        let descriptor = self.models.get(&entity).await?;
        if !self.models.is_writable(tenant_id, entity_id) {
            return Err(AppError::Conflict(format!(
                "descriptor for entity '{}' still fails to build",
                entity.name
            )));
        }
        tracing::info!(tenant = %tenant_id, entity = %entity.name, "entity recovered");
        Ok(descriptor.projection())
    }

    pub async fn projection(&self, tenant_id: &str, entity_id: Uuid) -> Result<SchemaProjection, AppError> {
        let entity = self.catalog.require_entity(tenant_id, entity_id).await?;
        Ok(self.models.get(&entity).await?.projection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_conflicts_until_release() {
        let locks = EntityLocks::default();
        let id = Uuid::new_v4();
        let guard = locks.try_acquire("acme", id).unwrap();
        assert!(matches!(locks.try_acquire("acme", id), Err(AppError::Conflict(_))));
        // other tenants and entities are independent
        locks.try_acquire("globex", id).unwrap();
        locks.try_acquire("acme", Uuid::new_v4()).unwrap();
        drop(guard);
        locks.try_acquire("acme", id).unwrap();
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = EntityLocks::default();
        for _ in 0..1000 {
            locks.try_acquire("acme", Uuid::new_v4()).unwrap();
        }
        assert_eq!(locks.tracked(), 0);

        let id = Uuid::new_v4();
        let held = locks.try_acquire("acme", id).unwrap();
        assert!(locks.try_acquire("acme", id).is_err());
        assert_eq!(locks.tracked(), 1);
        drop(held);
        assert_eq!(locks.tracked(), 0);
    }
}

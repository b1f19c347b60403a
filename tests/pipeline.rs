mod common;

use async_trait::async_trait;
use common::*;
use schemaforge::data::WriteOp;
use schemaforge::migration::{ChangeKind, MigrationScript, MigrationStatus, RiskLevel};
use schemaforge::model::Record;
use schemaforge::query::{ListRequest, SelectQuery};
use schemaforge::schema::EntityStatus;
use schemaforge::service::{AllowAll, TracingAuditSink};
use schemaforge::{AppError, AppState, MemoryMetadataStore, MemoryRecordStore, RecordStore, Settings};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory records whose writes and migrations can be made to hang past any deadline.
#[derive(Default)]
struct StallingRecords {
    inner: MemoryRecordStore,
    stalled: AtomicBool,
}

impl StallingRecords {
    async fn pause(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl RecordStore for StallingRecords {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Record>, AppError> {
        self.inner.select(query).await
    }

    async fn count(&self, query: &SelectQuery) -> Result<u64, AppError> {
        self.inner.count(query).await
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<Record>>, AppError> {
        self.pause().await;
        self.inner.write(ops).await
    }

    async fn migrate(&self, script: &MigrationScript) -> Result<(), AppError> {
        self.pause().await;
        self.inner.migrate(script).await
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.inner.ping().await
    }
}

fn stalling_state(records: Arc<StallingRecords>) -> AppState {
    let settings = Settings {
        migration_timeout: Duration::from_millis(50),
        bulk_timeout: Duration::from_millis(50),
        ..Settings::default()
    };
    AppState::new(
        settings,
        Arc::new(MemoryMetadataStore::new()),
        records,
        Arc::new(AllowAll),
        Arc::new(TracingAuditSink),
    )
}

#[tokio::test]
async fn first_publish_creates_the_table_and_serves_records() {
    let state = state();
    let e = entity(&state, TENANT, "customer").await;
    field(&state, TENANT, &e, json!({"name": "name", "field_type": {"type": "string"}})).await;

    let plan = state.migrations.preview(TENANT, e.id).await.unwrap();
    assert_eq!(plan.changes[0].kind, ChangeKind::CreateTable);
    assert_eq!(plan.risk, RiskLevel::Safe);
    assert!(plan.up_sql.contains("CREATE TABLE"));

    let out = state.migrations.publish(TENANT, e.id, "alice").await.unwrap();
    assert_eq!(out.entity.status, EntityStatus::Published);
    assert_eq!(out.entity.version, 1);
    assert_eq!(out.migration.status, MigrationStatus::Completed);

    let c = ctx(TENANT);
    let created = state.crud.create(&c, "customer", json!({"name": "Ada"})).await.unwrap();
    assert_eq!(created["name"], "Ada");
    assert_eq!(created["created_by"], "alice");
    assert!(created.get("tenant_id").is_none());
}

#[tokio::test]
async fn preview_after_publish_is_empty() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let plan = state.migrations.preview(TENANT, e.id).await.unwrap();
    assert!(plan.is_empty());
    assert!(plan.up_sql.is_empty());
}

#[tokio::test]
async fn republish_without_changes_conflicts() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let err = state.migrations.publish(TENANT, e.id, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(state.registry.get_entity(TENANT, e.id).await.unwrap().version, 1);
}

#[tokio::test]
async fn new_optional_field_is_a_single_add_column() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let ada = state
        .crud
        .create(&c, "customer", json!({"name": "Ada", "email": "ada@example.com"}))
        .await
        .unwrap();

    field(
        &state,
        TENANT,
        &e,
        json!({"name": "loyalty_tier", "field_type": {"type": "select", "options": ["bronze", "silver", "gold"]}}),
    )
    .await;
    // the live version keeps serving while the draft is pending
    let draft = state.registry.get_entity(TENANT, e.id).await.unwrap();
    assert_eq!(draft.status, EntityStatus::Published);
    assert!(draft.draft.is_some());

    let plan = state.migrations.preview(TENANT, e.id).await.unwrap();
    assert_eq!(plan.changes.len(), 1);
    assert_eq!(plan.changes[0].kind, ChangeKind::AddColumn);
    assert_eq!(plan.changes[0].object, "loyalty_tier");
    assert!(plan.reversible);
    assert!(plan.up_sql.contains("ADD COLUMN"));
    assert!(plan.down_sql.contains("DROP COLUMN"));

    let out = state.migrations.publish(TENANT, e.id, "alice").await.unwrap();
    assert_eq!(out.entity.version, 2);
    assert_eq!(out.migration.down_sql, plan.down_sql);

    let id = ada["id"].as_str().unwrap().parse().unwrap();
    let read = state.crud.get(&c, "customer", id, &[]).await.unwrap();
    assert_eq!(read["loyalty_tier"], Value::Null);
    assert_eq!(read["name"], "Ada");
}

#[tokio::test]
async fn rollback_restores_previous_descriptor() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let before = state.models.get(&e).await.unwrap();

    field(&state, TENANT, &e, json!({"name": "notes", "field_type": {"type": "text"}})).await;
    let out = state.migrations.publish(TENANT, e.id, "alice").await.unwrap();
    assert!(state.models.get(&out.entity).await.unwrap().field("notes").is_some());

    let restored = state.migrations.rollback(TENANT, out.migration.id, "alice").await.unwrap();
    assert_eq!(restored.version, 1);
    assert_eq!(restored.status, EntityStatus::Published);
    let after = state.models.get(&restored).await.unwrap();
    assert_eq!(*after, *before);

    let history = state.migrations.migrations(TENANT, e.id).await.unwrap();
    assert_eq!(history.last().unwrap().status, MigrationStatus::RolledBack);
    // the undone migration cannot be rolled back twice
    let err = state.migrations.rollback(TENANT, out.migration.id, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn rollback_is_limited_to_the_latest_migration() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let first = state.migrations.migrations(TENANT, e.id).await.unwrap()[0].id;
    field(&state, TENANT, &e, json!({"name": "notes", "field_type": {"type": "text"}})).await;
    state.migrations.publish(TENANT, e.id, "alice").await.unwrap();

    let err = state.migrations.rollback(TENANT, first, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn failed_migration_leaves_version_unchanged() {
    let state = state();
    let e = entity(&state, TENANT, "contact").await;
    let nick = field(&state, TENANT, &e, json!({"name": "nickname", "field_type": {"type": "string"}})).await;
    state.migrations.publish(TENANT, e.id, "alice").await.unwrap();
    let c = ctx(TENANT);
    for _ in 0..2 {
        state.crud.create(&c, "contact", json!({"nickname": "sam"})).await.unwrap();
    }

    state
        .registry
        .update_field(TENANT, e.id, nick.id, payload(json!({"constraints": {"unique": true}})))
        .await
        .unwrap();
    let err = state.migrations.publish(TENANT, e.id, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::MigrationExecution(_)));

    let current = state.registry.get_entity(TENANT, e.id).await.unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.status, EntityStatus::Published);
    let history = state.migrations.migrations(TENANT, e.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, MigrationStatus::Failed);
    assert!(history[1].error.is_some());

    // the live version still serves both rows
    let page = state.crud.list(&c, "contact", &ListRequest::default()).await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn concurrent_publish_admits_exactly_one() {
    let state = state();
    let e = entity(&state, TENANT, "ticket").await;
    field(&state, TENANT, &e, json!({"name": "title", "field_type": {"type": "string"}})).await;

    let a = state.migrations.clone();
    let b = state.migrations.clone();
    let id = e.id;
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.publish(TENANT, id, "alice").await }),
        tokio::spawn(async move { b.publish(TENANT, id, "bob").await }),
    );
    let results = [ra.unwrap(), rb.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(AppError::Conflict(_)))));

    let current = state.registry.get_entity(TENANT, e.id).await.unwrap();
    assert_eq!(current.version, 1);
    let completed = state
        .migrations
        .migrations(TENANT, e.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.status == MigrationStatus::Completed)
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn published_entities_must_be_archived_before_delete() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let err = state.registry.delete_entity(TENANT, e.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    state.migrations.archive(TENANT, e.id, "alice").await.unwrap();
    let err = state.crud.list(&ctx(TENANT), "customer", &ListRequest::default()).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    state.registry.delete_entity(TENANT, e.id).await.unwrap();
    assert!(state.registry.list_entities(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn drafts_are_not_served() {
    let state = state();
    let e = entity(&state, TENANT, "lead").await;
    field(&state, TENANT, &e, json!({"name": "source", "field_type": {"type": "string"}})).await;
    let err = state.crud.create(&ctx(TENANT), "lead", json!({"source": "web"})).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = state.migrations.projection(TENANT, e.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn migration_past_its_deadline_is_abandoned() {
    let records = Arc::new(StallingRecords::default());
    let state = stalling_state(records.clone());
    let e = published_customer(&state, TENANT).await;
    field(&state, TENANT, &e, json!({"name": "notes", "field_type": {"type": "text"}})).await;

    records.stalled.store(true, Ordering::SeqCst);
    let err = state.migrations.publish(TENANT, e.id, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
    let current = state.registry.get_entity(TENANT, e.id).await.unwrap();
    assert_eq!(current.version, 1);
    let history = state.migrations.migrations(TENANT, e.id).await.unwrap();
    assert_eq!(history[1].status, MigrationStatus::Failed);

    // nothing was applied, so the same draft publishes cleanly afterwards
    records.stalled.store(false, Ordering::SeqCst);
    let out = state.migrations.publish(TENANT, e.id, "alice").await.unwrap();
    assert_eq!(out.entity.version, 2);
    assert_eq!(out.migration.changes.len(), 1);
}

#[tokio::test]
async fn writes_past_the_deadline_fail_without_effect() {
    let records = Arc::new(StallingRecords::default());
    let state = stalling_state(records.clone());
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    state.crud.create(&c, "customer", json!({"name": "Ada"})).await.unwrap();

    records.stalled.store(true, Ordering::SeqCst);
    let err = state.crud.create(&c, "customer", json!({"name": "Bob"})).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
    let result = state
        .crud
        .bulk_create(&c, "customer", vec![json!({"name": "Cy"}), json!({"name": "Di"})], false)
        .await
        .unwrap();
    assert_eq!(result.failed, 2);
    assert!(result.results.iter().all(|r| r.error.as_ref().is_some_and(|e| e.code == "timeout")));

    records.stalled.store(false, Ordering::SeqCst);
    assert_eq!(state.crud.list(&c, "customer", &ListRequest::default()).await.unwrap().total, 1);
}

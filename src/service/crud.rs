//! Tenant-scoped record CRUD over published entities.

use super::access::{require, AccessControl, RequestContext};
use super::audit::{AuditAction, AuditLog, AuditRecord};
use super::events::{DomainEvent, EventBus, RecordEvent, RecordEventType};
use super::validation::{validate_create, validate_update};
use crate::data::{RecordStore, TableRef, WriteOp};
use crate::error::{AppError, ErrorDetail};
use crate::migration::shape::TENANT_ID_LENGTH;
use crate::migration::storage::StorageType;
use crate::model::descriptor::format_datetime;
use crate::model::{JoinPath, ModelCache, ModelDescriptor, Record};
use crate::query::ir::CompareOp;
use crate::query::{Column, ListRequest, Predicate, QueryBuilder, SelectQuery};
use crate::schema::{Catalog, EntityStatus};
use crate::settings::Settings;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Copy, Debug)]
pub struct CrudLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub bulk_limit: usize,
    pub bulk_timeout: Duration,
}

impl From<&Settings> for CrudLimits {
    fn from(s: &Settings) -> Self {
        CrudLimits {
            default_page_size: s.default_page_size,
            max_page_size: s.max_page_size,
            bulk_limit: s.bulk_limit,
            bulk_timeout: s.bulk_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListPage {
    pub data: Vec<Value>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct BulkItemResult {
    pub index: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Serialize)]
pub struct BulkResult {
    pub results: Vec<BulkItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkResult {
    fn from_items(results: Vec<BulkItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.ok).count();
        BulkResult {
            failed: results.len() - succeeded,
            succeeded,
            results,
        }
    }
}

/// Entity and descriptor resolved for one call, with the caller's field rights applied.
struct Scope {
    model: Arc<ModelDescriptor>,
    hidden: BTreeSet<String>,
    read_only: BTreeSet<String>,
}

/// A validated mutation waiting to be executed, alone or as part of a batch.
struct Prepared {
    action: AuditAction,
    id: Uuid,
    ops: Vec<WriteOp>,
    before: Option<Record>,
}

pub struct CrudService {
    catalog: Catalog,
    models: Arc<ModelCache>,
    records: Arc<dyn RecordStore>,
    access: Arc<dyn AccessControl>,
    audit: AuditLog,
    events: EventBus,
    limits: CrudLimits,
}

fn body_object(body: Value) -> Result<Record, AppError> {
    match body {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::BadRequest("body must be a JSON object".into())),
    }
}

fn tenant_column() -> Column {
    Column::new("tenant_id", StorageType::Varchar { length: TENANT_ID_LENGTH })
}

fn now() -> String {
    format_datetime(&chrono::Utc::now())
}

/// Prefix the field path of a validation error with an item position.
fn at_item(index: usize, e: AppError) -> AppError {
    match e {
        AppError::Validation { field, message } => AppError::Validation {
            field: Some(match field {
                Some(f) => format!("items[{}].{}", index, f),
                None => format!("items[{}]", index),
            }),
            message,
        },
        other => other,
    }
}

impl CrudService {
    pub fn new(
        catalog: Catalog,
        models: Arc<ModelCache>,
        records: Arc<dyn RecordStore>,
        access: Arc<dyn AccessControl>,
        audit: AuditLog,
        events: EventBus,
        limits: CrudLimits,
    ) -> Self {
        CrudService {
            catalog,
            models,
            records,
            access,
            audit,
            events,
            limits,
        }
    }

    async fn scope(&self, ctx: &RequestContext, entity: &str, action: &str, write: bool) -> Result<Scope, AppError> {
        let e = self
            .catalog
            .entity_by_name(&ctx.tenant_id, entity)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("entity '{}'", entity)))?;
        require(self.access.as_ref(), ctx, &format!("{}.{}", e.name, action))?;
        if e.status != EntityStatus::Published {
            return Err(AppError::Conflict(format!(
                "entity '{}' is {}; records are only served for published entities",
                e.name,
                e.status.as_str()
            )));
        }
        let model = self.models.get(&e).await?;
        if write && !self.models.is_writable(&ctx.tenant_id, e.id) {
            return Err(AppError::Conflict(format!(
                "entity '{}' is unusable for writes until recovered",
                e.name
            )));
        }
        let mut hidden = BTreeSet::new();
        let mut read_only = BTreeSet::new();
        let names = model
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(model.relations.keys().map(String::as_str));
        for name in names {
            let access = self.access.field_access(&ctx.role, &model.name, name);
            if !access.can_read() {
                hidden.insert(name.to_string());
            }
            if !access.can_write() {
                read_only.insert(name.to_string());
            }
        }
        Ok(Scope {
            model,
            hidden,
            read_only,
        })
    }

    fn builder<'a>(&self, scope: &'a Scope, ctx: &'a RequestContext) -> QueryBuilder<'a> {
        QueryBuilder::new(&scope.model, &ctx.tenant_id)
            .hidden(scope.hidden.clone())
            .page_sizes(self.limits.default_page_size, self.limits.max_page_size)
    }

    /// Shape a stored row for the caller: calculated fields filled, internal and hidden keys removed.
    fn present(&self, scope: &Scope, mut row: Record) -> Value {
        scope.model.compute(&mut row);
        row.remove("tenant_id");
        for name in &scope.hidden {
            row.remove(name);
        }
        if let Some(Value::Object(related)) = row.get_mut("_related") {
            related.retain(|k, _| !scope.hidden.contains(k));
        }
        Value::Object(row)
    }

    async fn fetch(&self, scope: &Scope, ctx: &RequestContext, id: Uuid) -> Result<Record, AppError> {
        let query = QueryBuilder::new(&scope.model, &ctx.tenant_id).by_id(id, &[])?;
        self.records
            .select(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{} record {}", scope.model.name, id)))
    }

    /// Live row of `table` with this id exists for the tenant.
    async fn exists(&self, model: &ModelDescriptor, tenant_id: &str, table: &str, soft_delete: bool, id: &str) -> Result<bool, AppError> {
        let mut parts = vec![
            Predicate::Compare {
                column: tenant_column(),
                op: CompareOp::Eq,
                value: Value::String(tenant_id.to_string()),
            },
            Predicate::Compare {
                column: Column::new("id", StorageType::Uuid),
                op: CompareOp::Eq,
                value: Value::String(id.to_string()),
            },
        ];
        if soft_delete {
            parts.push(Predicate::IsNull {
                column: Column::new("deleted_at", StorageType::Timestamptz),
                negated: false,
            });
        }
        let query = SelectQuery {
            tenant_id: tenant_id.to_string(),
            schema: model.schema.clone(),
            table: table.to_string(),
            columns: vec![Column::new("id", StorageType::Uuid)],
            predicate: Predicate::And(parts),
            order_by: Vec::new(),
            limit: Some(1),
            offset: 0,
            lookups: Vec::new(),
        };
        Ok(!self.records.select(&query).await?.is_empty())
    }

    /// Reference values must name a live record of the target entity in the same tenant.
    async fn check_references(&self, model: &ModelDescriptor, tenant_id: &str, values: &Record) -> Result<(), AppError> {
        for (name, v) in values {
            let Some(id) = v.as_str() else { continue };
            let target = model
                .relations
                .values()
                .find(|r| matches!(&r.join, JoinPath::Local { column } if column == name));
            if let Some(r) = target {
                if !self.exists(model, tenant_id, &r.target_table, r.target_soft_delete, id).await? {
                    return Err(AppError::field(name, "references a missing record"));
                }
            }
        }
        Ok(())
    }

    /// Split many-to-many link lists out of a body and check the rest is writable by the caller.
    async fn split_links(
        &self,
        scope: &Scope,
        ctx: &RequestContext,
        body: &mut Record,
    ) -> Result<Vec<(String, Vec<Uuid>)>, AppError> {
        if let Some(k) = body.keys().find(|k| scope.read_only.contains(*k)) {
            return Err(AppError::Permission(format!("field '{}' is read-only for role '{}'", k, ctx.role)));
        }
        let names: Vec<String> = body
            .keys()
            .filter(|k| scope.model.link_relation(k).is_some())
            .cloned()
            .collect();
        let mut links = Vec::with_capacity(names.len());
        for name in names {
            let raw = body.remove(&name).unwrap_or(Value::Null);
            let items = match raw {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                _ => return Err(AppError::field(&name, "must be an array of record ids")),
            };
            let mut ids = Vec::with_capacity(items.len());
            for item in &items {
                let id = item
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| AppError::field(&name, "must be an array of record ids"))?;
                if let Some(r) = scope.model.link_relation(&name) {
                    if !self
                        .exists(&scope.model, &ctx.tenant_id, &r.target_table, r.target_soft_delete, &id.to_string())
                        .await?
                    {
                        return Err(AppError::field(&name, format!("references a missing record {}", id)));
                    }
                }
                ids.push(id);
            }
            links.push((name, ids));
        }
        Ok(links)
    }

    fn link_ops(&self, scope: &Scope, ctx: &RequestContext, id: Uuid, links: Vec<(String, Vec<Uuid>)>) -> Vec<WriteOp> {
        links
            .into_iter()
            .filter_map(|(name, targets)| {
                let r = scope.model.link_relation(&name)?;
                match &r.join {
                    JoinPath::Junction {
                        table,
                        local_column,
                        remote_column,
                    } => Some(WriteOp::ReplaceLinks {
                        tenant_id: ctx.tenant_id.clone(),
                        schema: scope.model.schema.clone(),
                        junction: table.clone(),
                        local_column: local_column.clone(),
                        remote_column: remote_column.clone(),
                        id,
                        targets,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    async fn prepare_create(&self, scope: &Scope, ctx: &RequestContext, body: Value) -> Result<Prepared, AppError> {
        let mut body = body_object(body)?;
        let links = self.split_links(scope, ctx, &mut body).await?;
        let values = validate_create(&scope.model, &body)?;
        self.check_references(&scope.model, &ctx.tenant_id, &values).await?;

        let id = Uuid::new_v4();
        let at = now();
        let mut record = Map::new();
        record.insert("id".into(), Value::String(id.to_string()));
        record.insert("tenant_id".into(), Value::String(ctx.tenant_id.clone()));
        record.insert("created_at".into(), Value::String(at.clone()));
        record.insert("created_by".into(), Value::String(ctx.user_id.clone()));
        record.insert("updated_at".into(), Value::String(at));
        record.insert("updated_by".into(), Value::String(ctx.user_id.clone()));
        if scope.model.soft_delete {
            record.insert("deleted_at".into(), Value::Null);
            record.insert("deleted_by".into(), Value::Null);
        }
        record.extend(values);

        let mut ops = vec![WriteOp::Insert {
            table: TableRef::of(&scope.model),
            record,
        }];
        ops.extend(self.link_ops(scope, ctx, id, links));
        Ok(Prepared {
            action: AuditAction::Create,
            id,
            ops,
            before: None,
        })
    }

    async fn prepare_update(&self, scope: &Scope, ctx: &RequestContext, id: Uuid, body: Value) -> Result<Prepared, AppError> {
        let mut body = body_object(body)?;
        body.remove("id");
        let links = self.split_links(scope, ctx, &mut body).await?;
        let current = self.fetch(scope, ctx, id).await?;
        let mut changes = validate_update(&scope.model, &current, &body)?;
        self.check_references(&scope.model, &ctx.tenant_id, &changes).await?;
        changes.insert("updated_at".into(), Value::String(now()));
        changes.insert("updated_by".into(), Value::String(ctx.user_id.clone()));

        let mut ops = vec![WriteOp::Update {
            table: TableRef::of(&scope.model),
            id,
            changes,
        }];
        ops.extend(self.link_ops(scope, ctx, id, links));
        Ok(Prepared {
            action: AuditAction::Update,
            id,
            ops,
            before: Some(current),
        })
    }

    async fn prepare_delete(&self, scope: &Scope, ctx: &RequestContext, id: Uuid) -> Result<Prepared, AppError> {
        let current = self.fetch(scope, ctx, id).await?;
        let table = TableRef::of(&scope.model);
        let op = if scope.model.soft_delete {
            WriteOp::SoftDelete {
                table,
                id,
                deleted_at: now(),
                deleted_by: ctx.user_id.clone(),
            }
        } else {
            WriteOp::Delete { table, id }
        };
        Ok(Prepared {
            action: AuditAction::Delete,
            id,
            ops: vec![op],
            before: Some(current),
        })
    }

    /// Run prepared mutations in one transaction. Audit slots are held across the write;
    /// events go out after commit. Returns the resulting row per mutation (prior row for deletes).
    async fn execute(&self, scope: &Scope, ctx: &RequestContext, batch: Vec<Prepared>) -> Result<Vec<Record>, AppError> {
        let slots = self.audit.reserve(batch.len()).await?;
        let mut heads = Vec::with_capacity(batch.len());
        let mut ops = Vec::new();
        let mut meta = Vec::with_capacity(batch.len());
        for p in batch {
            heads.push(ops.len());
            ops.extend(p.ops);
            meta.push((p.action, p.id, p.before));
        }
        let rows = match tokio::time::timeout(self.limits.bulk_timeout, self.records.write(ops)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::Timeout(format!(
                    "write exceeded {:?} and was rolled back",
                    self.limits.bulk_timeout
                )))
            }
        };

        let mut results = Vec::with_capacity(meta.len());
        let mut audits = Vec::with_capacity(meta.len());
        let mut events = Vec::with_capacity(meta.len());
        for ((action, id, before), head) in meta.into_iter().zip(heads) {
            let row = rows.get(head).cloned().flatten().unwrap_or_default();
            let after = match action {
                AuditAction::Delete => None,
                _ => Some(Value::Object(row.clone())),
            };
            audits.push(
                AuditRecord::new(action, &ctx.tenant_id, &scope.model.name, &ctx.user_id)
                    .record_id(id)
                    .before(before.clone().map(Value::Object))
                    .after(after),
            );
            let (event_type, record, diff) = match action {
                AuditAction::Create => (RecordEventType::OnCreate, row.clone(), None),
                AuditAction::Update => {
                    let diff = before.as_ref().map(|b| changed_fields(b, &row));
                    (RecordEventType::OnUpdate, row.clone(), diff)
                }
                _ => (RecordEventType::OnDelete, before.clone().unwrap_or_default(), None),
            };
            let mut record = record;
            scope.model.compute(&mut record);
            record.remove("tenant_id");
            events.push(RecordEvent {
                event_type,
                tenant_id: ctx.tenant_id.clone(),
                entity_name: scope.model.name.clone(),
                record_id: id,
                record: Value::Object(record),
                diff,
                actor: ctx.user_id.clone(),
            });
            results.push(match action {
                AuditAction::Delete => before.unwrap_or_default(),
                _ => row,
            });
        }
        slots.commit(audits);
        for e in events {
            self.events.emit(DomainEvent::Record(e));
        }
        Ok(results)
    }

    pub async fn create(&self, ctx: &RequestContext, entity: &str, body: Value) -> Result<Value, AppError> {
        let scope = self.scope(ctx, entity, "create", true).await?;
        let prepared = self.prepare_create(&scope, ctx, body).await?;
        let row = self.execute(&scope, ctx, vec![prepared]).await?.pop().unwrap_or_default();
        tracing::debug!(tenant = %ctx.tenant_id, entity = %entity, "record created");
        Ok(self.present(&scope, row))
    }

    pub async fn get(&self, ctx: &RequestContext, entity: &str, id: Uuid, include: &[String]) -> Result<Value, AppError> {
        let scope = self.scope(ctx, entity, "read", false).await?;
        let query = self.builder(&scope, ctx).by_id(id, include)?;
        let row = self
            .records
            .select(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("{} record {}", scope.model.name, id)))?;
        Ok(self.present(&scope, row))
    }

    pub async fn list(&self, ctx: &RequestContext, entity: &str, req: &ListRequest) -> Result<ListPage, AppError> {
        let scope = self.scope(ctx, entity, "read", false).await?;
        let query = self.builder(&scope, ctx).list(req)?;
        let rows = self.records.select(&query).await?;
        let total = self.records.count(&query.for_count()).await?;
        Ok(ListPage {
            data: rows.into_iter().map(|r| self.present(&scope, r)).collect(),
            total,
            limit: query.limit.unwrap_or(self.limits.default_page_size),
            offset: query.offset,
        })
    }

    pub async fn update(&self, ctx: &RequestContext, entity: &str, id: Uuid, body: Value) -> Result<Value, AppError> {
        let scope = self.scope(ctx, entity, "update", true).await?;
        let prepared = self.prepare_update(&scope, ctx, id, body).await?;
        let row = self.execute(&scope, ctx, vec![prepared]).await?.pop().unwrap_or_default();
        Ok(self.present(&scope, row))
    }

    /// Soft-deletes when the entity supports it. Returns the record as it was.
    pub async fn delete(&self, ctx: &RequestContext, entity: &str, id: Uuid) -> Result<Value, AppError> {
        let scope = self.scope(ctx, entity, "delete", true).await?;
        let prepared = self.prepare_delete(&scope, ctx, id).await?;
        let row = self.execute(&scope, ctx, vec![prepared]).await?.pop().unwrap_or_default();
        Ok(self.present(&scope, row))
    }

    fn check_batch(&self, n: usize, key: &str) -> Result<(), AppError> {
        if n > self.limits.bulk_limit {
            return Err(AppError::field(
                key,
                format!("at most {} items per call", self.limits.bulk_limit),
            ));
        }
        Ok(())
    }

    /// Validate every item, then either write all in one transaction or fail on the first bad item.
    async fn atomic(&self, scope: &Scope, ctx: &RequestContext, prepared: Vec<Result<Prepared, AppError>>) -> Result<BulkResult, AppError> {
        let mut batch = Vec::with_capacity(prepared.len());
        for (i, p) in prepared.into_iter().enumerate() {
            batch.push(p.map_err(|e| at_item(i, e))?);
        }
        let ids: Vec<Uuid> = batch.iter().map(|p| p.id).collect();
        let rows = self.execute(scope, ctx, batch).await?;
        Ok(BulkResult::from_items(
            rows.into_iter()
                .zip(ids)
                .enumerate()
                .map(|(index, (row, id))| BulkItemResult {
                    index,
                    ok: true,
                    id: Some(id),
                    record: Some(self.present(scope, row)),
                    error: None,
                })
                .collect(),
        ))
    }

    /// Items run one by one in their own transactions; failures are reported per item.
    /// Items not started before the deadline fail with a timeout.
    async fn each<F, Fut>(&self, scope: &Scope, ctx: &RequestContext, n: usize, mut prepare: F) -> BulkResult
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<Prepared, AppError>>,
    {
        let deadline = Instant::now() + self.limits.bulk_timeout;
        let mut results = Vec::with_capacity(n);
        for index in 0..n {
            let outcome = if Instant::now() > deadline {
                Err(AppError::Timeout("bulk call deadline passed before this item ran".into()))
            } else {
                match prepare(index).await {
                    Ok(p) => {
                        let id = p.id;
                        self.execute(scope, ctx, vec![p])
                            .await
                            .map(|mut rows| (id, rows.pop().unwrap_or_default()))
                    }
                    Err(e) => Err(e),
                }
            };
            results.push(match outcome {
                Ok((id, row)) => BulkItemResult {
                    index,
                    ok: true,
                    id: Some(id),
                    record: Some(self.present(scope, row)),
                    error: None,
                },
                Err(e) => BulkItemResult {
                    index,
                    ok: false,
                    id: None,
                    record: None,
                    error: Some(e.detail()),
                },
            });
        }
        BulkResult::from_items(results)
    }

    pub async fn bulk_create(&self, ctx: &RequestContext, entity: &str, items: Vec<Value>, all_or_nothing: bool) -> Result<BulkResult, AppError> {
        self.check_batch(items.len(), "items")?;
        let scope = self.scope(ctx, entity, "create", true).await?;
        let result = if all_or_nothing {
            let mut prepared = Vec::with_capacity(items.len());
            for item in items {
                prepared.push(self.prepare_create(&scope, ctx, item).await);
            }
            self.atomic(&scope, ctx, prepared).await?
        } else {
            let n = items.len();
            let items = &items;
            let scope_ref = &scope;
            self.each(&scope, ctx, n, |i| self.prepare_create(scope_ref, ctx, items[i].clone()))
                .await
        };
        tracing::info!(tenant = %ctx.tenant_id, entity = %entity, succeeded = result.succeeded, failed = result.failed, "bulk create");
        Ok(result)
    }

    /// Each item carries its `id` next to the fields to change.
    pub async fn bulk_update(&self, ctx: &RequestContext, entity: &str, items: Vec<Value>, all_or_nothing: bool) -> Result<BulkResult, AppError> {
        self.check_batch(items.len(), "items")?;
        let scope = self.scope(ctx, entity, "update", true).await?;
        let item_id = |item: &Value| -> Result<Uuid, AppError> {
            item.get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| AppError::field("id", "each item needs a record id"))
        };
        let result = if all_or_nothing {
            let mut prepared = Vec::with_capacity(items.len());
            for item in items {
                let p = match item_id(&item) {
                    Ok(id) => self.prepare_update(&scope, ctx, id, item).await,
                    Err(e) => Err(e),
                };
                prepared.push(p);
            }
            self.atomic(&scope, ctx, prepared).await?
        } else {
            let n = items.len();
            let items = &items;
            let scope_ref = &scope;
            self.each(&scope, ctx, n, |i| async move {
                let id = item_id(&items[i])?;
                self.prepare_update(scope_ref, ctx, id, items[i].clone()).await
            })
            .await
        };
        tracing::info!(tenant = %ctx.tenant_id, entity = %entity, succeeded = result.succeeded, failed = result.failed, "bulk update");
        Ok(result)
    }

    pub async fn bulk_delete(&self, ctx: &RequestContext, entity: &str, ids: Vec<Uuid>, all_or_nothing: bool) -> Result<BulkResult, AppError> {
        self.check_batch(ids.len(), "ids")?;
        let scope = self.scope(ctx, entity, "delete", true).await?;
        let result = if all_or_nothing {
            let mut prepared = Vec::with_capacity(ids.len());
            let mut seen = BTreeSet::new();
            for id in &ids {
                prepared.push(if seen.insert(*id) {
                    self.prepare_delete(&scope, ctx, *id).await
                } else {
                    Err(AppError::field("id", format!("record {} listed twice", id)))
                });
            }
            self.atomic(&scope, ctx, prepared).await?
        } else {
            let ids = &ids;
            let scope_ref = &scope;
            self.each(&scope, ctx, ids.len(), |i| self.prepare_delete(scope_ref, ctx, ids[i]))
                .await
        };
        tracing::info!(tenant = %ctx.tenant_id, entity = %entity, succeeded = result.succeeded, failed = result.failed, "bulk delete");
        Ok(result)
    }
}

/// `{field: {"before", "after"}}` for every non-system field whose value changed.
fn changed_fields(before: &Record, after: &Record) -> Value {
    let mut diff = Map::new();
    for (k, new) in after {
        if matches!(k.as_str(), "updated_at" | "updated_by" | "tenant_id") {
            continue;
        }
        let old = before.get(k).unwrap_or(&Value::Null);
        if old != new {
            diff.insert(k.clone(), json!({ "before": old, "after": new }));
        }
    }
    Value::Object(diff)
}

//! Audit trail for record mutations and schema transitions.
//!
//! Records go through a bounded queue drained by one writer task. Mutating callers reserve
//! their queue slots before touching data and commit the records right after, so an
//! acknowledged mutation always has its audit record queued.

use crate::error::AppError;
use crate::store::qualified_sys_table;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Publish,
    PublishFailed,
    Rollback,
    Archive,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Publish => "publish",
            AuditAction::PublishFailed => "publish_failed",
            AuditAction::Rollback => "rollback",
            AuditAction::Archive => "archive",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub entity_name: String,
    pub record_id: Option<String>,
    pub tenant_id: String,
    pub actor: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, tenant_id: &str, entity_name: &str, actor: &str) -> Self {
        AuditRecord {
            id: Uuid::new_v4(),
            action,
            entity_name: entity_name.to_string(),
            record_id: None,
            tenant_id: tenant_id.to_string(),
            actor: actor.to_string(),
            before: None,
            after: None,
            at: Utc::now(),
        }
    }

    pub fn record_id(mut self, id: impl ToString) -> Self {
        self.record_id = Some(id.to_string());
        self
    }

    pub fn before(mut self, v: Option<Value>) -> Self {
        self.before = v;
        self
    }

    pub fn after(mut self, v: Option<Value>) -> Self {
        self.after = v;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<(), AppError>;
}

pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, r: &AuditRecord) -> Result<(), AppError> {
        tracing::info!(
            target: "schemaforge::audit",
            tenant = %r.tenant_id,
            action = r.action.as_str(),
            entity = %r.entity_name,
            record_id = r.record_id.as_deref().unwrap_or("-"),
            actor = %r.actor,
            "audit"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, r: &AuditRecord) -> Result<(), AppError> {
        self.records
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(r.clone());
        Ok(())
    }
}

/// Writes to `_sys_audit_log` in the metadata schema.
pub struct PgAuditSink {
    pool: PgPool,
    table: String,
}

impl PgAuditSink {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        PgAuditSink {
            pool,
            table: qualified_sys_table(schema, "_sys_audit_log"),
        }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, r: &AuditRecord) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO {} (id, tenant_id, action, entity_name, record_id, actor, before, after, at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table
        );
        sqlx::query(&sql)
            .bind(r.id)
            .bind(&r.tenant_id)
            .bind(r.action.as_str())
            .bind(&r.entity_name)
            .bind(&r.record_id)
            .bind(&r.actor)
            .bind(&r.before)
            .bind(&r.after)
            .bind(r.at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

enum AuditMessage {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditMessage>,
}

/// Queue slots held for records that will be committed after a write succeeds.
/// Unused slots are released on drop.
pub struct AuditSlots<'a> {
    permits: Vec<mpsc::Permit<'a, AuditMessage>>,
}

impl AuditSlots<'_> {
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    /// Queue one record per reserved slot. Records beyond the reservation are logged and dropped.
    pub fn commit(self, records: impl IntoIterator<Item = AuditRecord>) {
        let mut permits = self.permits.into_iter();
        for record in records {
            match permits.next() {
                Some(p) => p.send(AuditMessage::Record(record)),
                None => tracing::error!(action = record.action.as_str(), entity = %record.entity_name, "audit record without reserved slot"),
            }
        }
    }
}

fn writer_stopped() -> AppError {
    AppError::Internal("audit writer stopped".into())
}

impl AuditLog {
    /// Spawn the writer task draining into `sink`.
    pub fn start(sink: Arc<dyn AuditSink>, capacity: usize) -> (AuditLog, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditMessage>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    AuditMessage::Record(r) => {
                        if let Err(e) = sink.write(&r).await {
                            tracing::error!(
                                tenant = %r.tenant_id,
                                action = r.action.as_str(),
                                entity = %r.entity_name,
                                error = %e,
                                "audit write failed"
                            );
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("audit writer stopped");
        });
        (AuditLog { tx }, handle)
    }

    /// Hold `n` queue slots, waiting for space if the writer is behind.
    pub async fn reserve(&self, n: usize) -> Result<AuditSlots<'_>, AppError> {
        if n == 0 {
            return Ok(AuditSlots { permits: Vec::new() });
        }
        let permits = self.tx.reserve_many(n).await.map_err(|_| writer_stopped())?;
        Ok(AuditSlots {
            permits: permits.collect(),
        })
    }

    /// Queue a single record.
    pub async fn record(&self, record: AuditRecord) -> Result<(), AppError> {
        self.reserve(1).await?.commit([record]);
        Ok(())
    }

    /// Wait until everything queued so far has been handed to the sink.
    pub async fn flush(&self) -> Result<(), AppError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(AuditMessage::Flush(done))
            .await
            .map_err(|_| writer_stopped())?;
        wait.await.map_err(|_| writer_stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn committed_records_reach_sink_in_order() {
        let sink = Arc::new(MemoryAuditSink::default());
        let (log, _writer) = AuditLog::start(sink.clone(), 4);
        let slots = log.reserve(2).await.unwrap();
        assert_eq!(slots.len(), 2);
        slots.commit([
            AuditRecord::new(AuditAction::Create, "acme", "customer", "ada").record_id(1),
            AuditRecord::new(AuditAction::Update, "acme", "customer", "ada").record_id(1),
        ]);
        log.record(AuditRecord::new(AuditAction::Publish, "acme", "customer", "ada"))
            .await
            .unwrap();
        log.flush().await.unwrap();
        let actions: Vec<_> = sink.records().iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![AuditAction::Create, AuditAction::Update, AuditAction::Publish]);
    }

    #[tokio::test]
    async fn unused_slots_are_released() {
        let sink = Arc::new(MemoryAuditSink::default());
        let (log, _writer) = AuditLog::start(sink.clone(), 2);
        drop(log.reserve(2).await.unwrap());
        let slots = log.reserve(2).await.unwrap();
        slots.commit([AuditRecord::new(AuditAction::Delete, "acme", "customer", "ada")]);
        log.flush().await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}

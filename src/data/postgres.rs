//! Record storage in per-tenant PostgreSQL schemas.

use super::{RecordStore, TableRef, WriteOp};
use crate::error::AppError;
use crate::migration::storage::StorageType;
use crate::migration::MigrationScript;
use crate::model::descriptor::format_datetime;
use crate::model::Record;
use crate::query::{Column, SelectQuery};
use crate::sql::{self, QueryBuf};
use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        PgRecordStore { pool }
    }
}

fn bind(q: &QueryBuf) -> Query<'_, Postgres, PgArguments> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

fn db_code(e: &sqlx::Error) -> Option<(String, Option<String>)> {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| (c.into_owned(), db.constraint().map(str::to_string))),
        _ => None,
    }
}

/// Constraint violations raised by a record write become validation errors.
fn write_error(e: sqlx::Error, table: Option<&TableRef>) -> AppError {
    match db_code(&e) {
        Some((code, constraint)) if code == "23505" => {
            let field = constraint
                .as_ref()
                .and_then(|c| table.and_then(|t| t.unique_constraints.get(c)));
            match field {
                Some(f) => AppError::field(f, "must be unique"),
                None => AppError::validation(format!(
                    "duplicate value violates unique index '{}'",
                    constraint.unwrap_or_default()
                )),
            }
        }
        Some((code, constraint)) if code == "23503" => AppError::validation(format!(
            "foreign key '{}' rejected the write: referenced record is missing or still referenced",
            constraint.unwrap_or_default()
        )),
        Some((code, _)) if code == "22001" || code == "22003" || code == "23502" => {
            AppError::validation(e.to_string())
        }
        _ => AppError::Db(e),
    }
}

fn decode_cell(row: &PgRow, c: &Column) -> Result<Value, AppError> {
    let name = c.name.as_str();
    Ok(match c.storage {
        StorageType::Varchar { .. } | StorageType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::String),
        StorageType::BigInt => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
        StorageType::Numeric { .. } => row
            .try_get::<Option<String>, _>(name)?
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(Number::from_f64)
            .map(Value::Number),
        StorageType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        StorageType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(name)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        StorageType::Timestamptz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)?
            .map(|d| Value::String(format_datetime(&d))),
        StorageType::Jsonb => row.try_get::<Option<Value>, _>(name)?,
        StorageType::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(name)?
            .map(|u| Value::String(u.to_string())),
    }
    .unwrap_or(Value::Null))
}

fn decode_row(row: &PgRow, columns: &[Column], related: bool) -> Result<Record, AppError> {
    let mut out = Record::new();
    for c in columns {
        out.insert(c.name.clone(), decode_cell(row, c)?);
    }
    if related {
        let v: Option<Value> = row.try_get("_related")?;
        out.insert("_related".into(), v.unwrap_or(Value::Null));
    }
    Ok(out)
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Record>, AppError> {
        let q = sql::select(query)?;
        let rows = bind(&q).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| decode_row(r, &query.columns, !query.lookups.is_empty()))
            .collect()
    }

    async fn count(&self, query: &SelectQuery) -> Result<u64, AppError> {
        let q = sql::count(query)?;
        let row = bind(&q).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get(0)?;
        Ok(n.max(0) as u64)
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<Record>>, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                WriteOp::Insert { table, record } => {
                    let q = sql::insert(table, record)?;
                    let row = bind(&q)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| write_error(e, Some(table)))?;
                    out.push(Some(decode_row(&row, &table.columns, false)?));
                }
                WriteOp::Update { table, id, changes } => {
                    let q = sql::update(table, *id, changes)?;
                    let row = bind(&q)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| write_error(e, Some(table)))?
                        .ok_or_else(|| AppError::NotFound(format!("record {}", id)))?;
                    out.push(Some(decode_row(&row, &table.columns, false)?));
                }
                WriteOp::SoftDelete {
                    table,
                    id,
                    deleted_at,
                    deleted_by,
                } => {
                    let mut changes = Record::new();
                    changes.insert("deleted_at".into(), Value::String(deleted_at.clone()));
                    changes.insert("deleted_by".into(), Value::String(deleted_by.clone()));
                    let q = sql::update(table, *id, &changes)?;
                    let row = bind(&q)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| write_error(e, Some(table)))?
                        .ok_or_else(|| AppError::NotFound(format!("record {}", id)))?;
                    out.push(Some(decode_row(&row, &table.columns, false)?));
                }
                WriteOp::Delete { table, id } => {
                    let q = sql::delete(table, *id)?;
                    let row = bind(&q)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| write_error(e, Some(table)))?
                        .ok_or_else(|| AppError::NotFound(format!("record {}", id)))?;
                    out.push(Some(decode_row(&row, &table.columns, false)?));
                }
                WriteOp::ReplaceLinks {
                    tenant_id,
                    schema,
                    junction,
                    local_column,
                    remote_column,
                    id,
                    targets,
                } => {
                    for q in sql::replace_links(schema, tenant_id, junction, local_column, remote_column, *id, targets)? {
                        bind(&q).execute(&mut *tx).await.map_err(|e| write_error(e, None))?;
                    }
                    out.push(None);
                }
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn migrate(&self, script: &MigrationScript) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for stmt in &script.statements {
            tracing::debug!(tenant = %script.tenant_id, sql = %stmt, "ddl");
            sqlx::query(stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::MigrationExecution(format!("{}: {}", stmt, e)))?;
        }
        tx.commit()
            .await
            .map_err(|e| AppError::MigrationExecution(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

//! `_sys_*` table DDL and metadata persistence in PostgreSQL. All `_sys_*` tables live in the
//! schema named by `Settings::metadata_schema` (default `schemaforge`).

use super::{duplicate_key, MetaKind, MetaRecord, MetadataStore};
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Returns schema-qualified table name for `_sys_*` tables (e.g. "schemaforge._sys_metadata").
pub fn qualified_sys_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), table)
}

/// Create the metadata schema if missing, then the `_sys_*` tables.
pub async fn ensure_sys_tables(pool: &PgPool, schema: &str) -> Result<(), AppError> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(pool)
        .await?;

    let q_meta = qualified_sys_table(schema, "_sys_metadata");
    let meta_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            kind TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            parent_id TEXT,
            payload JSONB NOT NULL,
            version BIGINT NOT NULL DEFAULT 1,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (kind, tenant_id, id)
        )
        "#,
        q_meta
    );
    sqlx::query(&meta_ddl).execute(pool).await?;
    let parent_idx = format!(
        "CREATE INDEX IF NOT EXISTS _sys_metadata_parent ON {} (kind, tenant_id, parent_id)",
        q_meta
    );
    sqlx::query(&parent_idx).execute(pool).await?;

    let q_history = qualified_sys_table(schema, "_sys_metadata_history");
    let history_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            kind TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            payload JSONB NOT NULL,
            version BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (kind, tenant_id, id, version)
        )
        "#,
        q_history
    );
    sqlx::query(&history_ddl).execute(pool).await?;

    let q_keys = qualified_sys_table(schema, "_sys_metadata_keys");
    let keys_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            tenant_id TEXT NOT NULL,
            key TEXT NOT NULL,
            owner_kind TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            PRIMARY KEY (tenant_id, key)
        )
        "#,
        q_keys
    );
    sqlx::query(&keys_ddl).execute(pool).await?;

    let q_audit = qualified_sys_table(schema, "_sys_audit_log");
    let audit_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            record_id TEXT,
            actor TEXT NOT NULL,
            before JSONB,
            after JSONB,
            at TIMESTAMPTZ NOT NULL
        )
        "#,
        q_audit
    );
    sqlx::query(&audit_ddl).execute(pool).await?;

    Ok(())
}

pub struct PgMetadataStore {
    pool: PgPool,
    schema: String,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        PgMetadataStore {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        qualified_sys_table(&self.schema, name)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    /// Copies the current payload to history, replaces the row with version + 1, and rewrites its unique keys.
    async fn put(&self, kind: MetaKind, tenant_id: &str, record: MetaRecord) -> Result<(), AppError> {
        let q_meta = self.table("_sys_metadata");
        let q_history = self.table("_sys_metadata_history");
        let q_keys = self.table("_sys_metadata_keys");
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT version FROM {} WHERE kind = $1 AND tenant_id = $2 AND id = $3 FOR UPDATE",
            q_meta
        ))
        .bind(kind.as_str())
        .bind(tenant_id)
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await?;

        let new_version = match current {
            Some((v,)) => {
                sqlx::query(&format!(
                    "INSERT INTO {} (kind, tenant_id, id, payload, version, created_at) \
                     SELECT kind, tenant_id, id, payload, version, updated_at FROM {} \
                     WHERE kind = $1 AND tenant_id = $2 AND id = $3",
                    q_history, q_meta
                ))
                .bind(kind.as_str())
                .bind(tenant_id)
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;
                v + 1
            }
            None => 1,
        };

        sqlx::query(&format!(
            "INSERT INTO {} (kind, tenant_id, id, parent_id, payload, version, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (kind, tenant_id, id) DO UPDATE \
             SET parent_id = EXCLUDED.parent_id, payload = EXCLUDED.payload, version = EXCLUDED.version, updated_at = NOW()",
            q_meta
        ))
        .bind(kind.as_str())
        .bind(tenant_id)
        .bind(&record.id)
        .bind(record.parent_id.as_deref())
        .bind(&record.payload)
        .bind(new_version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE tenant_id = $1 AND owner_kind = $2 AND owner_id = $3",
            q_keys
        ))
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(&record.id)
        .execute(&mut *tx)
        .await?;

        for key in &record.unique_keys {
            let inserted = sqlx::query(&format!(
                "INSERT INTO {} (tenant_id, key, owner_kind, owner_id) VALUES ($1, $2, $3, $4)",
                q_keys
            ))
            .bind(tenant_id)
            .bind(key)
            .bind(kind.as_str())
            .bind(&record.id)
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Err(duplicate_key(key)),
                Err(e) => return Err(AppError::Db(e)),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<Option<Value>, AppError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE kind = $1 AND tenant_id = $2 AND id = $3",
            self.table("_sys_metadata")
        );
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(kind.as_str())
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(&self, kind: MetaKind, tenant_id: &str, parent_id: Option<&str>) -> Result<Vec<Value>, AppError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE kind = $1 AND tenant_id = $2 AND ($3::text IS NULL OR parent_id = $3) ORDER BY id",
            self.table("_sys_metadata")
        );
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .bind(kind.as_str())
            .bind(tenant_id)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_by_key(&self, kind: MetaKind, tenant_id: &str, key: &str) -> Result<Option<Value>, AppError> {
        let sql = format!(
            "SELECT m.payload FROM {} k JOIN {} m \
             ON m.kind = k.owner_kind AND m.tenant_id = k.tenant_id AND m.id = k.owner_id \
             WHERE k.tenant_id = $1 AND k.key = $2 AND k.owner_kind = $3",
            self.table("_sys_metadata_keys"),
            self.table("_sys_metadata")
        );
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(tenant_id)
            .bind(key)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn remove(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE tenant_id = $1 AND owner_kind = $2 AND owner_id = $3",
            self.table("_sys_metadata_keys")
        ))
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE kind = $1 AND tenant_id = $2 AND id = $3",
            self.table("_sys_metadata")
        ))
        .bind(kind.as_str())
        .bind(tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await
        .map_err(AppError::Db)?;
    if !exists.0 {
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
        tracing::info!(database = %db_name, "created database");
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_database_name_from_url() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@localhost:5432/forge?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(db, "forge");
    }

    #[test]
    fn sys_tables_are_schema_qualified() {
        assert_eq!(qualified_sys_table("schemaforge", "_sys_metadata"), "\"schemaforge\"._sys_metadata");
    }
}

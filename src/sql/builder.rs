//! Renders the query IR and record writes as parameterized PostgreSQL.
//! Identifiers come from validated metadata and are always quoted; values are always parameters.

use super::params::PgBindValue;
use crate::data::TableRef;
use crate::error::AppError;
use crate::migration::ddl::{qualified, quoted};
use crate::migration::storage::StorageType;
use crate::model::{Cardinality, JoinPath, Record};
use crate::query::ir::{Column, Lookup, Predicate};
use crate::query::SelectQuery;
use serde_json::Value;
use uuid::Uuid;

const MAIN_ALIAS: &str = "main";

#[derive(Debug)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: PgBindValue) -> u32 {
        self.params.push(v);
        self.params.len() as u32
    }

    /// `$n::type` for a value bound to a column of `storage`.
    fn placeholder(&mut self, storage: &StorageType, v: &Value) -> Result<String, AppError> {
        let n = self.push_param(PgBindValue::for_storage(storage, v)?);
        Ok(format!("${}::{}", n, storage.cast()))
    }

    fn text_placeholder(&mut self, s: &str) -> String {
        let n = self.push_param(PgBindValue::String(s.to_string()));
        format!("${}::text", n)
    }
}

fn col(alias: &str, name: &str) -> String {
    format!("{}.{}", alias, quoted(name))
}

/// Numeric comes back as text so it decodes without a decimal type.
fn select_expr(alias: &str, c: &Column) -> String {
    match c.storage {
        StorageType::Numeric { .. } => format!("{}::text AS {}", col(alias, &c.name), quoted(&c.name)),
        _ => format!("{} AS {}", col(alias, &c.name), quoted(&c.name)),
    }
}

fn select_list(alias: &str, columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| select_expr(alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn predicate(q: &mut QueryBuf, p: &Predicate) -> Result<String, AppError> {
    Ok(match p {
        Predicate::And(ps) if ps.is_empty() => "TRUE".into(),
        Predicate::Or(ps) if ps.is_empty() => "FALSE".into(),
        Predicate::And(ps) | Predicate::Or(ps) => {
            let joiner = if matches!(p, Predicate::And(_)) { " AND " } else { " OR " };
            let parts = ps.iter().map(|c| predicate(q, c)).collect::<Result<Vec<_>, _>>()?;
            format!("({})", parts.join(joiner))
        }
        Predicate::Compare { column, op, value } => {
            let ph = q.placeholder(&column.storage, value)?;
            format!("{} {} {}", col(MAIN_ALIAS, &column.name), op.sql(), ph)
        }
        Predicate::InList { values, negated, .. } if values.is_empty() => {
            if *negated { "TRUE".into() } else { "FALSE".into() }
        }
        Predicate::InList { column, values, negated } => {
            let phs = values
                .iter()
                .map(|v| q.placeholder(&column.storage, v))
                .collect::<Result<Vec<_>, _>>()?;
            format!(
                "{} {}IN ({})",
                col(MAIN_ALIAS, &column.name),
                if *negated { "NOT " } else { "" },
                phs.join(", ")
            )
        }
        Predicate::IsNull { column, negated } => format!(
            "{} IS {}NULL",
            col(MAIN_ALIAS, &column.name),
            if *negated { "NOT " } else { "" }
        ),
        Predicate::Between { column, low, high } => {
            let lo = q.placeholder(&column.storage, low)?;
            let hi = q.placeholder(&column.storage, high)?;
            format!("{} BETWEEN {} AND {}", col(MAIN_ALIAS, &column.name), lo, hi)
        }
        Predicate::Like {
            column,
            pattern,
            case_insensitive,
        } => {
            let ph = q.text_placeholder(pattern);
            format!(
                "{}::text {} {}",
                col(MAIN_ALIAS, &column.name),
                if *case_insensitive { "ILIKE" } else { "LIKE" },
                ph
            )
        }
    })
}

/// Scalar subquery yielding `{id, display}` (to-one) or an array of them (to-many).
fn lookup_subquery(schema: &str, l: &Lookup) -> String {
    let target = qualified(schema, &l.target_table);
    let item = format!("json_build_object('id', t.{}, 'display', t.{})", quoted("id"), quoted(&l.display_column));
    let mut from = format!("{} t", target);
    let mut conds = vec![format!("t.{} = {}", quoted("tenant_id"), col(MAIN_ALIAS, "tenant_id"))];
    if l.target_soft_delete {
        conds.push(format!("t.{} IS NULL", quoted("deleted_at")));
    }
    match &l.join {
        JoinPath::Local { column } => conds.push(format!("t.{} = {}", quoted("id"), col(MAIN_ALIAS, column))),
        JoinPath::Remote { column } => conds.push(format!("t.{} = {}", quoted(column), col(MAIN_ALIAS, "id"))),
        JoinPath::Junction {
            table,
            local_column,
            remote_column,
        } => {
            from.push_str(&format!(
                " JOIN {} j ON j.{} = t.{} AND j.{} = {}",
                qualified(schema, table),
                quoted(remote_column),
                quoted("id"),
                quoted("tenant_id"),
                col(MAIN_ALIAS, "tenant_id")
            ));
            conds.push(format!("j.{} = {}", quoted(local_column), col(MAIN_ALIAS, "id")));
        }
    }
    let filter = conds.join(" AND ");
    match l.cardinality {
        Cardinality::ToOne => format!(
            "(SELECT {} FROM {} WHERE {} ORDER BY t.{} LIMIT 1)",
            item,
            from,
            filter,
            quoted("id")
        ),
        Cardinality::ToMany => format!(
            "(SELECT COALESCE(json_agg(x.item ORDER BY x.id), '[]'::json) FROM (SELECT t.{} AS id, {} AS item FROM {} WHERE {} ORDER BY t.{} LIMIT {}) x)",
            quoted("id"),
            item,
            from,
            filter,
            quoted("id"),
            l.limit
        ),
    }
}

pub fn select(query: &SelectQuery) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut parts = vec![select_list(MAIN_ALIAS, &query.columns)];
    if !query.lookups.is_empty() {
        let pairs: Vec<String> = query
            .lookups
            .iter()
            .map(|l| format!("'{}', {}", l.name.replace('\'', "''"), lookup_subquery(&query.schema, l)))
            .collect();
        parts.push(format!("json_build_object({}) AS {}", pairs.join(", "), quoted("_related")));
    }
    let filter = predicate(&mut q, &query.predicate)?;
    let order: Vec<String> = query
        .order_by
        .iter()
        .map(|o| format!("{} {}", col(MAIN_ALIAS, &o.column.name), if o.descending { "DESC" } else { "ASC" }))
        .collect();
    let order_clause = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    let limit_clause = query.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = if query.offset > 0 {
        format!(" OFFSET {}", query.offset)
    } else {
        String::new()
    };
    q.sql = format!(
        "SELECT {} FROM {} {} WHERE {}{}{}{}",
        parts.join(", "),
        qualified(&query.schema, &query.table),
        MAIN_ALIAS,
        filter,
        order_clause,
        limit_clause,
        offset_clause
    );
    Ok(q)
}

pub fn count(query: &SelectQuery) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let filter = predicate(&mut q, &query.predicate)?;
    q.sql = format!(
        "SELECT COUNT(*) FROM {} {} WHERE {}",
        qualified(&query.schema, &query.table),
        MAIN_ALIAS,
        filter
    );
    Ok(q)
}

fn column<'a>(table: &'a TableRef, name: &str) -> Result<&'a Column, AppError> {
    table
        .column(name)
        .ok_or_else(|| AppError::Internal(format!("column '{}' does not exist on '{}'", name, table.table)))
}

/// Row identity: id, tenant, and live-only for soft-delete tables.
fn row_scope(q: &mut QueryBuf, table: &TableRef, id: Uuid) -> Result<String, AppError> {
    let id_ph = q.placeholder(&StorageType::Uuid, &Value::String(id.to_string()))?;
    let tenant_ph = q.text_placeholder(&table.tenant_id);
    let mut scope = format!(
        "{} = {} AND {}::text = {}",
        col(MAIN_ALIAS, "id"),
        id_ph,
        col(MAIN_ALIAS, "tenant_id"),
        tenant_ph
    );
    if table.soft_delete {
        scope.push_str(&format!(" AND {} IS NULL", col(MAIN_ALIAS, "deleted_at")));
    }
    Ok(scope)
}

pub fn insert(table: &TableRef, record: &Record) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut cols = Vec::with_capacity(record.len());
    let mut placeholders = Vec::with_capacity(record.len());
    for (name, v) in record {
        let c = column(table, name)?;
        cols.push(quoted(name));
        placeholders.push(q.placeholder(&c.storage, v)?);
    }
    q.sql = format!(
        "INSERT INTO {} AS {} ({}) VALUES ({}) RETURNING {}",
        qualified(&table.schema, &table.table),
        MAIN_ALIAS,
        cols.join(", "),
        placeholders.join(", "),
        select_list(MAIN_ALIAS, &table.columns)
    );
    Ok(q)
}

/// UPDATE of the live row; `changes` must be non-empty.
pub fn update(table: &TableRef, id: Uuid, changes: &Record) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let mut sets = Vec::with_capacity(changes.len());
    for (name, v) in changes {
        let c = column(table, name)?;
        let ph = q.placeholder(&c.storage, v)?;
        sets.push(format!("{} = {}", quoted(name), ph));
    }
    if sets.is_empty() {
        return Err(AppError::Internal("update without changes".into()));
    }
    let scope = row_scope(&mut q, table, id)?;
    q.sql = format!(
        "UPDATE {} AS {} SET {} WHERE {} RETURNING {}",
        qualified(&table.schema, &table.table),
        MAIN_ALIAS,
        sets.join(", "),
        scope,
        select_list(MAIN_ALIAS, &table.columns)
    );
    Ok(q)
}

pub fn delete(table: &TableRef, id: Uuid) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let scope = row_scope(&mut q, table, id)?;
    q.sql = format!(
        "DELETE FROM {} AS {} WHERE {} RETURNING {}",
        qualified(&table.schema, &table.table),
        MAIN_ALIAS,
        scope,
        select_list(MAIN_ALIAS, &table.columns)
    );
    Ok(q)
}

/// Delete the current links of `id`, then insert the new set.
pub fn replace_links(
    schema: &str,
    tenant_id: &str,
    junction: &str,
    local_column: &str,
    remote_column: &str,
    id: Uuid,
    targets: &[Uuid],
) -> Result<Vec<QueryBuf>, AppError> {
    let table = qualified(schema, junction);
    let mut clear = QueryBuf::new();
    let tenant_ph = clear.text_placeholder(tenant_id);
    let id_ph = clear.placeholder(&StorageType::Uuid, &Value::String(id.to_string()))?;
    clear.sql = format!(
        "DELETE FROM {} WHERE {}::text = {} AND {} = {}",
        table,
        quoted("tenant_id"),
        tenant_ph,
        quoted(local_column),
        id_ph
    );
    let mut out = vec![clear];
    let mut distinct: Vec<Uuid> = targets.to_vec();
    distinct.sort();
    distinct.dedup();
    if distinct.is_empty() {
        return Ok(out);
    }
    let mut add = QueryBuf::new();
    let mut rows = Vec::with_capacity(distinct.len());
    for target in distinct {
        let t = add.text_placeholder(tenant_id);
        let l = add.placeholder(&StorageType::Uuid, &Value::String(id.to_string()))?;
        let r = add.placeholder(&StorageType::Uuid, &Value::String(target.to_string()))?;
        rows.push(format!("({}, {}, {})", t, l, r));
    }
    add.sql = format!(
        "INSERT INTO {} ({}, {}, {}) VALUES {}",
        table,
        quoted("tenant_id"),
        quoted(local_column),
        quoted(remote_column),
        rows.join(", ")
    );
    out.push(add);
    Ok(out)
}

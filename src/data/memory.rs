//! In-process record store for the development server and tests.
//!
//! Tables live per tenant schema. Every migration and write batch runs against a copy of the
//! schema that replaces the original only when all steps succeed.

use super::{RecordStore, TableRef, WriteOp};
use crate::error::AppError;
use crate::expr;
use crate::migration::shape::{ColumnShape, ForeignKeyShape, IndexShape};
use crate::migration::storage::StorageType;
use crate::migration::{MigrationScript, SchemaChange};
use crate::model::descriptor::format_datetime;
use crate::model::{Cardinality, JoinPath, Record};
use crate::query::ir::{like_matches, CompareOp, Lookup, OrderBy, Predicate};
use crate::query::SelectQuery;
use crate::schema::ReferentialAction;
use async_trait::async_trait;
use serde_json::{json, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Clone, Debug, Default)]
struct MemTable {
    columns: Vec<ColumnShape>,
    rows: Vec<Record>,
}

#[derive(Clone, Debug, Default)]
struct MemSchema {
    tables: BTreeMap<String, MemTable>,
    indexes: BTreeMap<String, IndexShape>,
    foreign_keys: BTreeMap<String, ForeignKeyShape>,
}

impl MemSchema {
    fn table(&self, name: &str) -> Result<&MemTable, AppError> {
        self.tables
            .get(name)
            .ok_or_else(|| AppError::Internal(format!("relation '{}' does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, AppError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| AppError::Internal(format!("relation '{}' does not exist", name)))
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    schemas: RwLock<HashMap<String, MemSchema>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> AppError {
    AppError::Internal("record store lock poisoned".into())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Record>, AppError> {
        let schemas = self.schemas.read().map_err(|_| poisoned())?;
        let schema = schemas
            .get(&query.schema)
            .ok_or_else(|| AppError::Internal(format!("schema '{}' does not exist", query.schema)))?;
        let table = schema.table(&query.table)?;
        let mut rows: Vec<&Record> = table.rows.iter().filter(|r| eval(&query.predicate, r)).collect();
        rows.sort_by(|a, b| order(&query.order_by, a, b));
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .map(|row| {
                let mut out: Record = query
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
                    .collect();
                if !query.lookups.is_empty() {
                    let related: Record = query
                        .lookups
                        .iter()
                        .map(|l| (l.name.clone(), lookup(schema, &query.tenant_id, row, l)))
                        .collect();
                    out.insert("_related".into(), Value::Object(related));
                }
                out
            })
            .collect())
    }

    async fn count(&self, query: &SelectQuery) -> Result<u64, AppError> {
        let schemas = self.schemas.read().map_err(|_| poisoned())?;
        let schema = schemas
            .get(&query.schema)
            .ok_or_else(|| AppError::Internal(format!("schema '{}' does not exist", query.schema)))?;
        let table = schema.table(&query.table)?;
        Ok(table.rows.iter().filter(|r| eval(&query.predicate, r)).count() as u64)
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<Vec<Option<Record>>, AppError> {
        let mut schemas = self.schemas.write().map_err(|_| poisoned())?;
        let mut work: HashMap<String, MemSchema> = HashMap::new();
        let mut out = Vec::with_capacity(ops.len());
        for op in &ops {
            let name = match op {
                WriteOp::Insert { table, .. }
                | WriteOp::Update { table, .. }
                | WriteOp::Delete { table, .. }
                | WriteOp::SoftDelete { table, .. } => &table.schema,
                WriteOp::ReplaceLinks { schema, .. } => schema,
            };
            if !work.contains_key(name) {
                let copy = schemas
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AppError::Internal(format!("schema '{}' does not exist", name)))?;
                work.insert(name.clone(), copy);
            }
            let schema = work
                .get_mut(name)
                .ok_or_else(|| AppError::Internal(format!("schema '{}' does not exist", name)))?;
            out.push(apply_write(schema, op)?);
        }
        schemas.extend(work);
        Ok(out)
    }

    async fn migrate(&self, script: &MigrationScript) -> Result<(), AppError> {
        let mut schemas = self.schemas.write().map_err(|_| poisoned())?;
        let mut schema = schemas.get(&script.schema).cloned().unwrap_or_default();
        for change in &script.changes {
            apply_change(&mut schema, change)
                .map_err(|m| AppError::MigrationExecution(format!("{} {}: {}", change.table(), change.object(), m)))?;
        }
        schemas.insert(script.schema.clone(), schema);
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.schemas.read().map(|_| ()).map_err(|_| poisoned())
    }
}

// evaluation

fn cell<'a>(row: &'a Record, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn compare_stored(storage: StorageType, a: &Value, b: &Value) -> Option<Ordering> {
    match storage {
        StorageType::Timestamptz => {
            let x = chrono::DateTime::parse_from_rfc3339(a.as_str()?).ok()?;
            let y = chrono::DateTime::parse_from_rfc3339(b.as_str()?).ok()?;
            Some(x.cmp(&y))
        }
        StorageType::Uuid => Some(a.as_str()?.to_ascii_lowercase().cmp(&b.as_str()?.to_ascii_lowercase())),
        _ => expr::compare(a, b),
    }
}

fn eval(p: &Predicate, row: &Record) -> bool {
    match p {
        Predicate::And(ps) => ps.iter().all(|p| eval(p, row)),
        Predicate::Or(ps) => ps.iter().any(|p| eval(p, row)),
        Predicate::Compare { column, op, value } => {
            let v = cell(row, &column.name);
            if v.is_null() {
                return false;
            }
            let Some(o) = compare_stored(column.storage, v, value) else { return false };
            match op {
                CompareOp::Eq => o == Ordering::Equal,
                CompareOp::Ne => o != Ordering::Equal,
                CompareOp::Gt => o == Ordering::Greater,
                CompareOp::Gte => o != Ordering::Less,
                CompareOp::Lt => o == Ordering::Less,
                CompareOp::Lte => o != Ordering::Greater,
            }
        }
        Predicate::InList { column, values, negated } => {
            let v = cell(row, &column.name);
            if v.is_null() {
                return false;
            }
            let hit = values
                .iter()
                .any(|x| compare_stored(column.storage, v, x) == Some(Ordering::Equal));
            hit != *negated
        }
        Predicate::IsNull { column, negated } => cell(row, &column.name).is_null() != *negated,
        Predicate::Between { column, low, high } => {
            let v = cell(row, &column.name);
            matches!(
                (compare_stored(column.storage, v, low), compare_stored(column.storage, v, high)),
                (Some(l), Some(h)) if l != Ordering::Less && h != Ordering::Greater
            )
        }
        Predicate::Like {
            column,
            pattern,
            case_insensitive,
        } => match cell(row, &column.name) {
            Value::Null => false,
            Value::String(s) => like_matches(pattern, s, *case_insensitive),
            other => like_matches(pattern, &other.to_string(), *case_insensitive),
        },
    }
}

/// Nulls sort last ascending and first descending.
fn order(order_by: &[OrderBy], a: &Record, b: &Record) -> Ordering {
    for o in order_by {
        let (x, y) = (cell(a, &o.column.name), cell(b, &o.column.name));
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_stored(o.column.storage, x, y).unwrap_or(Ordering::Equal),
        };
        let ord = if o.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn same_id(a: &Value, b: &Value) -> bool {
    compare_stored(StorageType::Uuid, a, b) == Some(Ordering::Equal)
}

fn lookup(schema: &MemSchema, tenant_id: &str, row: &Record, l: &Lookup) -> Value {
    let Ok(target) = schema.table(&l.target_table) else { return Value::Null };
    let live = |r: &&Record| {
        cell(r, "tenant_id").as_str() == Some(tenant_id) && (!l.target_soft_delete || cell(r, "deleted_at").is_null())
    };
    let item = |r: &Record| json!({"id": cell(r, "id"), "display": cell(r, &l.display_column)});
    let id = cell(row, "id");
    let mut found: Vec<&Record> = match &l.join {
        JoinPath::Local { column } => {
            let fk = cell(row, column);
            if fk.is_null() {
                Vec::new()
            } else {
                target.rows.iter().filter(live).filter(|r| same_id(cell(r, "id"), fk)).collect()
            }
        }
        JoinPath::Remote { column } => target
            .rows
            .iter()
            .filter(live)
            .filter(|r| same_id(cell(r, column), id))
            .collect(),
        JoinPath::Junction {
            table,
            local_column,
            remote_column,
        } => {
            let Ok(junction) = schema.table(table) else { return Value::Null };
            let linked: Vec<&Value> = junction
                .rows
                .iter()
                .filter(|j| cell(j, "tenant_id").as_str() == Some(tenant_id) && same_id(cell(j, local_column), id))
                .map(|j| cell(j, remote_column))
                .collect();
            target
                .rows
                .iter()
                .filter(live)
                .filter(|r| linked.iter().any(|t| same_id(cell(r, "id"), t)))
                .collect()
        }
    };
    found.sort_by(|a, b| compare_stored(StorageType::Uuid, cell(a, "id"), cell(b, "id")).unwrap_or(Ordering::Equal));
    match l.cardinality {
        Cardinality::ToOne => found.first().map(|r| item(*r)).unwrap_or(Value::Null),
        Cardinality::ToMany => Value::Array(found.into_iter().take(l.limit as usize).map(item).collect()),
    }
}

// writes

fn locate(schema: &MemSchema, table: &TableRef, id: &uuid::Uuid) -> Result<usize, AppError> {
    let id = Value::String(id.to_string());
    schema
        .table(&table.table)?
        .rows
        .iter()
        .position(|r| {
            same_id(cell(r, "id"), &id)
                && cell(r, "tenant_id").as_str() == Some(table.tenant_id.as_str())
                && (!table.soft_delete || cell(r, "deleted_at").is_null())
        })
        .ok_or_else(|| AppError::NotFound(format!("record {}", id.as_str().unwrap_or_default())))
}

fn fit_row(t: &MemTable, values: &Record, base: Option<&Record>) -> Result<Record, AppError> {
    if let Some(unknown) = values.keys().find(|k| t.columns.iter().all(|c| &c.name != *k)) {
        return Err(AppError::Internal(format!("column '{}' does not exist", unknown)));
    }
    let mut row = Record::new();
    for c in &t.columns {
        let v = match values.get(&c.name) {
            Some(v) => fit(&c.storage, v).map_err(|m| AppError::field(&c.name, m))?,
            None => base.and_then(|b| b.get(&c.name)).cloned().unwrap_or(Value::Null),
        };
        if v.is_null() && !c.nullable {
            return Err(AppError::field(&c.name, "must not be null"));
        }
        row.insert(c.name.clone(), v);
    }
    Ok(row)
}

fn unique_violation(table: Option<&TableRef>, index: &IndexShape) -> AppError {
    match table.and_then(|t| t.unique_constraints.get(&index.name)) {
        Some(field) => AppError::field(field, "must be unique"),
        None => AppError::validation(format!("duplicate value violates unique index '{}'", index.name)),
    }
}

fn participates(index: &IndexShape, row: &Record) -> bool {
    (!index.live_only || cell(row, "deleted_at").is_null()) && index.columns.iter().all(|c| !cell(row, c).is_null())
}

fn same_key(index: &IndexShape, a: &Record, b: &Record) -> bool {
    index.columns.iter().all(|c| {
        let (x, y) = (cell(a, c), cell(b, c));
        expr::loose_eq(x, y) || same_id(x, y)
    })
}

/// Unique indexes and outgoing foreign keys for `row` stored at `pos` of `table_name`.
fn check_row(schema: &MemSchema, table_name: &str, pos: usize, table: Option<&TableRef>) -> Result<(), AppError> {
    let rows = &schema.table(table_name)?.rows;
    let row = &rows[pos];
    for index in schema.indexes.values().filter(|i| i.table == table_name && i.unique) {
        if !participates(index, row) {
            continue;
        }
        let clash = rows
            .iter()
            .enumerate()
            .any(|(i, other)| i != pos && participates(index, other) && same_key(index, row, other));
        if clash {
            return Err(unique_violation(table, index));
        }
    }
    for fk in schema.foreign_keys.values().filter(|f| f.table == table_name) {
        let v = cell(row, &fk.column);
        if v.is_null() {
            continue;
        }
        if !schema.table(&fk.ref_table)?.rows.iter().any(|r| same_id(cell(r, "id"), v)) {
            return Err(AppError::field(&fk.column, "references a missing record"));
        }
    }
    Ok(())
}

/// Remove a row by id and apply the referential actions of foreign keys pointing at it.
fn delete_cascading(schema: &mut MemSchema, table_name: &str, id: Value) -> Result<Record, AppError> {
    let mut removed = None;
    let mut work = vec![(table_name.to_string(), id)];
    while let Some((table, id)) = work.pop() {
        let t = schema.table_mut(&table)?;
        let Some(pos) = t.rows.iter().position(|r| same_id(cell(r, "id"), &id)) else { continue };
        let row = t.rows.remove(pos);
        if removed.is_none() {
            removed = Some(row);
        }
        let inbound: Vec<ForeignKeyShape> = schema
            .foreign_keys
            .values()
            .filter(|f| f.ref_table == table)
            .cloned()
            .collect();
        for fk in inbound {
            let child = schema.table_mut(&fk.table)?;
            let has_id = child.columns.iter().any(|c| c.name == "id");
            let referencing: Vec<usize> = child
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| same_id(cell(r, &fk.column), &id))
                .map(|(i, _)| i)
                .collect();
            if referencing.is_empty() {
                continue;
            }
            match fk.on_delete {
                ReferentialAction::Cascade if has_id => {
                    for i in referencing {
                        work.push((fk.table.clone(), cell(&child.rows[i], "id").clone()));
                    }
                }
                ReferentialAction::Cascade => {
                    let mut i = 0;
                    child.rows.retain(|_| {
                        let keep = !referencing.contains(&i);
                        i += 1;
                        keep
                    });
                }
                ReferentialAction::SetNull => {
                    for i in referencing {
                        child.rows[i].insert(fk.column.clone(), Value::Null);
                    }
                }
                ReferentialAction::NoAction | ReferentialAction::Restrict | ReferentialAction::SetDefault => {
                    return Err(AppError::validation(format!(
                        "record is still referenced by '{}.{}'",
                        fk.table, fk.column
                    )));
                }
            }
        }
    }
    removed.ok_or_else(|| AppError::NotFound("record".into()))
}

fn apply_write(schema: &mut MemSchema, op: &WriteOp) -> Result<Option<Record>, AppError> {
    match op {
        WriteOp::Insert { table, record } => {
            let t = schema.table_mut(&table.table)?;
            let row = fit_row(t, record, None)?;
            if t.rows.iter().any(|r| same_id(cell(r, "id"), cell(&row, "id"))) {
                return Err(AppError::Conflict(format!("record {} already exists", cell(&row, "id"))));
            }
            t.rows.push(row.clone());
            let pos = t.rows.len() - 1;
            check_row(schema, &table.table, pos, Some(table))?;
            Ok(Some(row))
        }
        WriteOp::Update { table, id, changes } => {
            let pos = locate(schema, table, id)?;
            let t = schema.table_mut(&table.table)?;
            let row = fit_row(t, changes, Some(&t.rows[pos]))?;
            t.rows[pos] = row.clone();
            check_row(schema, &table.table, pos, Some(table))?;
            Ok(Some(row))
        }
        WriteOp::SoftDelete {
            table,
            id,
            deleted_at,
            deleted_by,
        } => {
            let pos = locate(schema, table, id)?;
            let row = &mut schema.table_mut(&table.table)?.rows[pos];
            row.insert("deleted_at".into(), Value::String(deleted_at.clone()));
            row.insert("deleted_by".into(), Value::String(deleted_by.clone()));
            Ok(Some(row.clone()))
        }
        WriteOp::Delete { table, id } => {
            locate(schema, table, id)?;
            delete_cascading(schema, &table.table, Value::String(id.to_string())).map(Some)
        }
        WriteOp::ReplaceLinks {
            tenant_id,
            junction,
            local_column,
            remote_column,
            id,
            targets,
            ..
        } => {
            let local = Value::String(id.to_string());
            let t = schema.table_mut(junction)?;
            t.rows
                .retain(|r| !(cell(r, "tenant_id").as_str() == Some(tenant_id.as_str()) && same_id(cell(r, local_column), &local)));
            let mut seen = Vec::new();
            for target in targets {
                if seen.contains(target) {
                    continue;
                }
                seen.push(*target);
                let mut row = Record::new();
                row.insert("tenant_id".into(), Value::String(tenant_id.clone()));
                row.insert(local_column.clone(), local.clone());
                row.insert(remote_column.clone(), Value::String(target.to_string()));
                let t = schema.table_mut(junction)?;
                t.rows.push(row);
                let pos = t.rows.len() - 1;
                check_row(schema, junction, pos, None).map_err(|e| match e {
                    AppError::Validation { .. } => AppError::validation(format!("linked record {} does not exist", target)),
                    other => other,
                })?;
            }
            Ok(None)
        }
    }
}

// migrations

fn apply_change(schema: &mut MemSchema, change: &SchemaChange) -> Result<(), String> {
    match change {
        SchemaChange::CreateTable { table } => {
            if schema.tables.contains_key(&table.name) {
                return Err("relation already exists".into());
            }
            schema.tables.insert(
                table.name.clone(),
                MemTable {
                    columns: table.columns.clone(),
                    rows: Vec::new(),
                },
            );
        }
        SchemaChange::DropTable { table } => {
            if let Some(fk) = schema
                .foreign_keys
                .values()
                .find(|f| f.ref_table == table.name && f.table != table.name)
            {
                return Err(format!("constraint '{}' depends on it", fk.name));
            }
            schema.tables.remove(&table.name).ok_or("relation does not exist")?;
            schema.indexes.retain(|_, i| i.table != table.name);
            schema.foreign_keys.retain(|_, f| f.table != table.name);
        }
        SchemaChange::AddColumn { table, column } => {
            let t = schema.tables.get_mut(table).ok_or("relation does not exist")?;
            if t.columns.iter().any(|c| c.name == column.name) {
                return Err("column already exists".into());
            }
            if !column.nullable && !t.rows.is_empty() {
                return Err("column contains null values".into());
            }
            t.columns.push(column.clone());
            for row in &mut t.rows {
                row.insert(column.name.clone(), Value::Null);
            }
        }
        SchemaChange::DropColumn { table, column } => {
            let t = schema.tables.get_mut(table).ok_or("relation does not exist")?;
            let before = t.columns.len();
            t.columns.retain(|c| c.name != column.name);
            if t.columns.len() == before {
                return Err("column does not exist".into());
            }
            for row in &mut t.rows {
                row.remove(&column.name);
            }
            schema
                .indexes
                .retain(|_, i| !(i.table == *table && i.columns.contains(&column.name)));
            schema
                .foreign_keys
                .retain(|_, f| !(f.table == *table && f.column == column.name));
        }
        SchemaChange::AlterColumn { table, from, to } => {
            let t = schema.tables.get_mut(table).ok_or("relation does not exist")?;
            let col = t
                .columns
                .iter_mut()
                .find(|c| c.name == from.name)
                .ok_or("column does not exist")?;
            let mut converted = Vec::with_capacity(t.rows.len());
            for row in &t.rows {
                let v = convert(&from.storage, &to.storage, cell(row, &from.name))?;
                if v.is_null() && !to.nullable {
                    return Err("column contains null values".into());
                }
                converted.push(v);
            }
            *col = to.clone();
            for (row, v) in t.rows.iter_mut().zip(converted) {
                row.insert(to.name.clone(), v);
            }
        }
        SchemaChange::AddIndex { index } => {
            if schema.indexes.contains_key(&index.name) {
                return Err("relation already exists".into());
            }
            let t = schema.tables.get(&index.table).ok_or("relation does not exist")?;
            if index.unique {
                let live: Vec<&Record> = t.rows.iter().filter(|r| participates(index, r)).collect();
                for (i, a) in live.iter().enumerate() {
                    if live[i + 1..].iter().any(|b| same_key(index, a, b)) {
                        return Err("could not create unique index: duplicate key".into());
                    }
                }
            }
            schema.indexes.insert(index.name.clone(), index.clone());
        }
        SchemaChange::DropIndex { index } => {
            schema.indexes.remove(&index.name).ok_or("index does not exist")?;
        }
        SchemaChange::AddForeignKey { foreign_key: fk } => {
            let child = schema.tables.get(&fk.table).ok_or("relation does not exist")?;
            let parent = schema.tables.get(&fk.ref_table).ok_or("referenced relation does not exist")?;
            let orphan = child.rows.iter().any(|r| {
                let v = cell(r, &fk.column);
                !v.is_null() && !parent.rows.iter().any(|p| same_id(cell(p, "id"), v))
            });
            if orphan {
                return Err("existing rows violate the foreign key".into());
            }
            schema.foreign_keys.insert(fk.name.clone(), fk.clone());
        }
        SchemaChange::DropForeignKey { foreign_key: fk } => {
            schema.foreign_keys.remove(&fk.name).ok_or("constraint does not exist")?;
        }
    }
    Ok(())
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Column type change for one stored value.
fn convert(from: &StorageType, to: &StorageType, v: &Value) -> Result<Value, String> {
    match (from, to) {
        (StorageType::Varchar { .. } | StorageType::Text, StorageType::Jsonb) => match v {
            Value::String(s) => serde_json::from_str(s).map_err(|_| format!("invalid input syntax for jsonb: {}", s)),
            other => Ok(other.clone()),
        },
        (StorageType::Jsonb, StorageType::Varchar { .. } | StorageType::Text) if !v.is_null() => {
            fit(to, &Value::String(v.to_string()))
        }
        _ => fit(to, v),
    }
}

/// Coerce a value to the representation stored in a column, rejecting values that do not fit.
fn fit(storage: &StorageType, v: &Value) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let number = |v: &Value| -> Result<f64, String> {
        match v {
            Value::Number(n) => n.as_f64().ok_or_else(|| "invalid number".to_string()),
            Value::String(s) => s.trim().parse::<f64>().map_err(|_| format!("invalid number: {}", s)),
            other => Err(format!("cannot store {} as a number", other)),
        }
    };
    Ok(match storage {
        StorageType::Varchar { length } => {
            let s = text_of(v);
            if s.chars().count() > *length as usize {
                return Err(format!("value too long for varchar({})", length));
            }
            Value::String(s)
        }
        StorageType::Text => Value::String(text_of(v)),
        StorageType::BigInt => {
            let i = match v {
                Value::Number(n) if n.is_i64() => n.as_i64().unwrap_or_default(),
                Value::String(s) if s.trim().parse::<i64>().is_ok() => s.trim().parse::<i64>().unwrap_or_default(),
                other => {
                    let f = number(other)?.round();
                    if !(i64::MIN as f64..=i64::MAX as f64).contains(&f) {
                        return Err("bigint out of range".into());
                    }
                    f as i64
                }
            };
            Value::from(i)
        }
        StorageType::Numeric { precision, scale } => {
            let m = 10f64.powi(i32::from(*scale));
            let f = (number(v)? * m).round() / m;
            let limit = 10f64.powi(i32::from(*precision) - i32::from(*scale));
            if f.abs() >= limit {
                return Err(format!("numeric field overflow for numeric({},{})", precision, scale));
            }
            Value::Number(Number::from_f64(f).ok_or("invalid number")?)
        }
        StorageType::Boolean => match v {
            Value::Bool(_) => v.clone(),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Value::Bool(true),
                "false" | "f" | "no" | "n" | "0" => Value::Bool(false),
                _ => return Err(format!("invalid input syntax for boolean: {}", s)),
            },
            other => return Err(format!("cannot store {} as boolean", other)),
        },
        StorageType::Date => {
            let s = v.as_str().ok_or_else(|| format!("cannot store {} as date", v))?;
            let d = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .or_else(|_| chrono::DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&chrono::Utc).date_naive()))
                .map_err(|_| format!("invalid input syntax for date: {}", s))?;
            Value::String(d.format("%Y-%m-%d").to_string())
        }
        StorageType::Timestamptz => {
            let s = v.as_str().ok_or_else(|| format!("cannot store {} as timestamptz", v))?;
            let dt = match chrono::DateTime::parse_from_rfc3339(s) {
                Ok(dt) => dt.with_timezone(&chrono::Utc),
                Err(_) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| d.and_utc())
                    .ok_or_else(|| format!("invalid input syntax for timestamptz: {}", s))?,
            };
            Value::String(format_datetime(&dt))
        }
        StorageType::Jsonb => v.clone(),
        StorageType::Uuid => {
            let s = v.as_str().ok_or_else(|| format!("cannot store {} as uuid", v))?;
            Value::String(
                uuid::Uuid::parse_str(s)
                    .map_err(|_| format!("invalid input syntax for uuid: {}", s))?
                    .to_string(),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::shape::{system_columns, TableShape};
    use crate::query::Column;

    fn table_ref() -> TableRef {
        let mut unique_constraints = BTreeMap::new();
        unique_constraints.insert("uq_customer_email".to_string(), "email".to_string());
        TableRef {
            tenant_id: "acme".into(),
            schema: "t_acme".into(),
            table: "customer".into(),
            columns: Vec::new(),
            soft_delete: false,
            unique_constraints,
        }
    }

    fn email() -> ColumnShape {
        ColumnShape {
            name: "email".into(),
            storage: StorageType::Varchar { length: 320 },
            nullable: true,
            system: false,
        }
    }

    async fn store_with_customer() -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        let mut columns = system_columns(false);
        columns.push(email());
        let changes = vec![
            SchemaChange::CreateTable {
                table: TableShape {
                    name: "customer".into(),
                    columns,
                    primary_key: vec!["id".into()],
                },
            },
            SchemaChange::AddIndex {
                index: IndexShape {
                    name: "uq_customer_email".into(),
                    table: "customer".into(),
                    columns: vec!["email".into()],
                    unique: true,
                    live_only: false,
                },
            },
        ];
        store
            .migrate(&MigrationScript::new("acme", "t_acme", changes))
            .await
            .unwrap();
        store
    }

    fn row(email: &str) -> Record {
        let now = "2024-01-01T00:00:00Z";
        serde_json::from_value(json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "tenant_id": "acme",
            "created_at": now, "created_by": "u", "updated_at": now, "updated_by": "u",
            "email": email,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates_atomically() {
        let store = store_with_customer().await;
        let t = table_ref();
        store
            .write(vec![WriteOp::Insert { table: t.clone(), record: row("ada@x.com") }])
            .await
            .unwrap();
        let err = store
            .write(vec![
                WriteOp::Insert { table: t.clone(), record: row("bob@x.com") },
                WriteOp::Insert { table: t.clone(), record: row("ada@x.com") },
            ])
            .await
            .unwrap_err();
        match err {
            AppError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("email")),
            other => panic!("unexpected {:?}", other),
        }
        let q = SelectQuery {
            tenant_id: "acme".into(),
            schema: "t_acme".into(),
            table: "customer".into(),
            columns: vec![Column::new("email", StorageType::Varchar { length: 320 })],
            predicate: Predicate::And(Vec::new()),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            lookups: Vec::new(),
        };
        assert_eq!(store.count(&q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_migration_leaves_schema_untouched() {
        let store = store_with_customer().await;
        let narrow = SchemaChange::AlterColumn {
            table: "customer".into(),
            from: email(),
            to: ColumnShape {
                storage: StorageType::Varchar { length: 3 },
                ..email()
            },
        };
        store
            .write(vec![WriteOp::Insert { table: table_ref(), record: row("ada@x.com") }])
            .await
            .unwrap();
        let err = store
            .migrate(&MigrationScript::new("acme", "t_acme", vec![narrow]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MigrationExecution(_)));
        // the original width still accepts long values
        store
            .write(vec![WriteOp::Insert { table: table_ref(), record: row("grace@x.com") }])
            .await
            .unwrap();
    }

    #[test]
    fn fit_converts_and_rejects() {
        assert_eq!(fit(&StorageType::BigInt, &json!("12")).unwrap(), json!(12));
        assert_eq!(
            fit(&StorageType::Numeric { precision: 5, scale: 2 }, &json!(1.005)).unwrap(),
            json!(1.0)
        );
        assert!(fit(&StorageType::Numeric { precision: 3, scale: 2 }, &json!(12.5)).is_err());
        assert_eq!(
            fit(&StorageType::Timestamptz, &json!("2024-01-02")).unwrap(),
            json!("2024-01-02T00:00:00Z")
        );
        assert!(fit(&StorageType::Uuid, &json!("nope")).is_err());
    }
}

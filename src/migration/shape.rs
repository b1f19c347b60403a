//! Physical shape of an entity: its main table, owned junction tables, indexes and foreign keys.
//! Diffing two shapes yields the migration between them.

use super::storage::StorageType;
use crate::error::AppError;
use crate::schema::types::{EntitySnapshot, ReferentialAction, RelationshipKind};
use crate::tenant::tenant_schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgreSQL truncates identifiers beyond this many bytes.
const PG_IDENTIFIER_LEN: usize = 63;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub name: String,
    pub storage: StorageType,
    pub nullable: bool,
    /// Maintained by the runtime (id, tenant_id, audit stamps); never written by callers.
    #[serde(default)]
    pub system: bool,
}

impl ColumnShape {
    fn system(name: &str, storage: StorageType, nullable: bool) -> Self {
        ColumnShape {
            name: name.into(),
            storage,
            nullable,
            system: true,
        }
    }

    fn user(name: &str, storage: StorageType) -> Self {
        ColumnShape {
            name: name.into(),
            storage,
            nullable: true,
            system: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<ColumnShape>,
    pub primary_key: Vec<String>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShape {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Only rows with `deleted_at IS NULL` participate.
    #[serde(default)]
    pub live_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyShape {
    pub name: String,
    pub table: String,
    pub column: String,
    pub ref_table: String,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaShape {
    /// Physical schema (`t_<tenant>`).
    pub schema: String,
    pub tables: BTreeMap<String, TableShape>,
    pub indexes: BTreeMap<String, IndexShape>,
    pub foreign_keys: BTreeMap<String, ForeignKeyShape>,
}

pub const TENANT_ID_LENGTH: u32 = 48;
pub const ACTOR_LENGTH: u32 = 255;

/// Columns present on every entity table, in order.
pub fn system_columns(soft_delete: bool) -> Vec<ColumnShape> {
    let mut cols = vec![
        ColumnShape::system("id", StorageType::Uuid, false),
        ColumnShape::system("tenant_id", StorageType::Varchar { length: TENANT_ID_LENGTH }, false),
        ColumnShape::system("created_at", StorageType::Timestamptz, false),
        ColumnShape::system("created_by", StorageType::Varchar { length: ACTOR_LENGTH }, false),
        ColumnShape::system("updated_at", StorageType::Timestamptz, false),
        ColumnShape::system("updated_by", StorageType::Varchar { length: ACTOR_LENGTH }, false),
    ];
    if soft_delete {
        cols.push(ColumnShape::system("deleted_at", StorageType::Timestamptz, true));
        cols.push(ColumnShape::system("deleted_by", StorageType::Varchar { length: ACTOR_LENGTH }, true));
    }
    cols
}

/// `<prefix>_<table>_<suffix>`, shortened with a stable hash when it would exceed the identifier limit.
pub fn constraint_name(prefix: &str, table: &str, suffix: &str) -> String {
    let full = format!("{}_{}_{}", prefix, table, suffix);
    if full.len() <= PG_IDENTIFIER_LEN {
        return full;
    }
    let hash = format!("{:08x}", fnv1a(full.as_bytes()) as u32);
    let keep = PG_IDENTIFIER_LEN - hash.len() - 1;
    let mut cut = keep;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &full[..cut], hash)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Physical name of a relationship's FK column.
pub fn relationship_column(snapshot: &EntitySnapshot, rel_index: usize) -> Option<String> {
    let rel = snapshot.relationships.get(rel_index)?;
    if let Some(fk) = &rel.foreign_key {
        return Some(fk.clone());
    }
    let source = if rel.source_entity_id == snapshot.entity.id {
        snapshot.entity.name.clone()
    } else {
        snapshot.related(rel.source_entity_id)?.name.clone()
    };
    let target = if rel.target_entity_id == snapshot.entity.id {
        snapshot.entity.name.clone()
    } else {
        snapshot.related(rel.target_entity_id)?.name.clone()
    };
    match rel.kind {
        RelationshipKind::OneToMany => Some(format!("{}_id", source)),
        RelationshipKind::OneToOne => Some(format!("{}_id", target)),
        RelationshipKind::ManyToMany => None,
    }
}

fn table_of(snapshot: &EntitySnapshot, entity_id: uuid::Uuid) -> Result<String, AppError> {
    if entity_id == snapshot.entity.id {
        return Ok(snapshot.entity.table_name.clone());
    }
    snapshot
        .related(entity_id)
        .map(|r| r.table_name.clone())
        .ok_or_else(|| AppError::NotFound(format!("entity {}", entity_id)))
}

/// Build the physical shape an entity snapshot requires.
pub fn shape_of(snapshot: &EntitySnapshot) -> Result<SchemaShape, AppError> {
    let entity = &snapshot.entity;
    let table = entity.table_name.clone();
    let mut shape = SchemaShape {
        schema: tenant_schema(&entity.tenant_id),
        ..Default::default()
    };
    let mut columns = system_columns(entity.soft_delete);

    let mut fields: Vec<_> = snapshot.fields.iter().collect();
    fields.sort_by_key(|f| (f.position, f.name.clone()));
    for f in fields {
        let Some(storage) = StorageType::for_field(&f.field_type, &f.constraints) else {
            continue;
        };
        columns.push(ColumnShape::user(&f.name, storage));
        if f.constraints.unique {
            add_index(&mut shape, &table, &f.name, true, entity.soft_delete);
        } else if f.constraints.indexed || f.reference_entity_id().is_some() {
            add_index(&mut shape, &table, &f.name, false, false);
        }
        if let Some(target) = f.reference_entity_id() {
            let fk = ForeignKeyShape {
                name: constraint_name("fk", &table, &f.name),
                table: table.clone(),
                column: f.name.clone(),
                ref_table: table_of(snapshot, target)?,
                on_delete: ReferentialAction::NoAction,
                on_update: ReferentialAction::NoAction,
            };
            shape.foreign_keys.insert(fk.name.clone(), fk);
        }
    }

    for (i, rel) in snapshot.relationships.iter().enumerate() {
        let owns_column = match rel.kind {
            RelationshipKind::OneToMany => rel.target_entity_id == entity.id,
            RelationshipKind::OneToOne => rel.source_entity_id == entity.id,
            RelationshipKind::ManyToMany => false,
        };
        if owns_column {
            let col = relationship_column(snapshot, i)
                .ok_or_else(|| AppError::Internal(format!("relationship '{}' has no column", rel.name)))?;
            let ref_entity = if rel.kind == RelationshipKind::OneToMany {
                rel.source_entity_id
            } else {
                rel.target_entity_id
            };
            columns.push(ColumnShape::user(&col, StorageType::Uuid));
            add_index(
                &mut shape,
                &table,
                &col,
                rel.kind == RelationshipKind::OneToOne,
                entity.soft_delete,
            );
            let fk = ForeignKeyShape {
                name: constraint_name("fk", &table, &col),
                table: table.clone(),
                column: col,
                ref_table: table_of(snapshot, ref_entity)?,
                on_delete: rel.on_delete,
                on_update: rel.on_update,
            };
            shape.foreign_keys.insert(fk.name.clone(), fk);
        }
        if rel.kind == RelationshipKind::ManyToMany && rel.source_entity_id == entity.id {
            let junction = rel
                .junction_table
                .clone()
                .ok_or_else(|| AppError::Internal(format!("relationship '{}' has no junction table", rel.name)))?;
            shape.tables.insert(
                junction.clone(),
                TableShape {
                    name: junction.clone(),
                    columns: vec![
                        ColumnShape::system("tenant_id", StorageType::Varchar { length: TENANT_ID_LENGTH }, false),
                        ColumnShape::system("source_id", StorageType::Uuid, false),
                        ColumnShape::system("target_id", StorageType::Uuid, false),
                    ],
                    primary_key: vec!["source_id".into(), "target_id".into()],
                },
            );
            for (col, target) in [("source_id", rel.source_entity_id), ("target_id", rel.target_entity_id)] {
                let fk = ForeignKeyShape {
                    name: constraint_name("fk", &junction, col),
                    table: junction.clone(),
                    column: col.into(),
                    ref_table: table_of(snapshot, target)?,
                    on_delete: ReferentialAction::Cascade,
                    on_update: ReferentialAction::NoAction,
                };
                shape.foreign_keys.insert(fk.name.clone(), fk);
            }
            add_index(&mut shape, &junction, "target_id", false, false);
        }
    }

    for idx in &snapshot.indexes {
        let unique = idx.unique;
        let index = IndexShape {
            name: idx.name.clone(),
            table: table.clone(),
            columns: idx.fields.clone(),
            unique,
            live_only: unique && entity.soft_delete,
        };
        shape.indexes.insert(index.name.clone(), index);
    }

    shape.tables.insert(
        table.clone(),
        TableShape {
            name: table,
            columns,
            primary_key: vec!["id".into()],
        },
    );
    Ok(shape)
}

fn add_index(shape: &mut SchemaShape, table: &str, column: &str, unique: bool, live_only: bool) {
    let prefix = if unique { "uq" } else { "ix" };
    let index = IndexShape {
        name: constraint_name(prefix, table, column),
        table: table.into(),
        columns: vec![column.into()],
        unique,
        live_only: unique && live_only,
    };
    shape.indexes.insert(index.name.clone(), index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_constraint_names_are_shortened_stably() {
        let table = "a".repeat(48);
        let col = "b".repeat(48);
        let name = constraint_name("uq", &table, &col);
        assert!(name.len() <= PG_IDENTIFIER_LEN);
        assert_eq!(name, constraint_name("uq", &table, &col));
        assert_ne!(name, constraint_name("ix", &table, &col));
        assert_eq!(constraint_name("uq", "customers", "email"), "uq_customers_email");
    }

    #[test]
    fn soft_delete_adds_system_columns() {
        assert_eq!(system_columns(false).len(), 6);
        let cols = system_columns(true);
        assert_eq!(cols.len(), 8);
        assert!(cols.iter().all(|c| c.system));
        assert!(cols.iter().find(|c| c.name == "deleted_at").unwrap().nullable);
    }
}

//! Set difference between two schema shapes, statement ordering, and inversion.

use super::shape::{ColumnShape, ForeignKeyShape, IndexShape, SchemaShape, TableShape};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AlterColumn,
    AddIndex,
    DropIndex,
    #[serde(rename = "ADD_FK")]
    AddFk,
    #[serde(rename = "DROP_FK")]
    DropFk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Destructive,
}

/// One structural change. Dropping variants capture the prior definition so the change can be inverted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaChange {
    CreateTable { table: TableShape },
    DropTable { table: TableShape },
    AddColumn { table: String, column: ColumnShape },
    DropColumn { table: String, column: ColumnShape },
    AlterColumn { table: String, from: ColumnShape, to: ColumnShape },
    AddIndex { index: IndexShape },
    DropIndex { index: IndexShape },
    #[serde(rename = "ADD_FK")]
    AddForeignKey { foreign_key: ForeignKeyShape },
    #[serde(rename = "DROP_FK")]
    DropForeignKey { foreign_key: ForeignKeyShape },
}

impl SchemaChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            SchemaChange::CreateTable { .. } => ChangeKind::CreateTable,
            SchemaChange::DropTable { .. } => ChangeKind::DropTable,
            SchemaChange::AddColumn { .. } => ChangeKind::AddColumn,
            SchemaChange::DropColumn { .. } => ChangeKind::DropColumn,
            SchemaChange::AlterColumn { .. } => ChangeKind::AlterColumn,
            SchemaChange::AddIndex { .. } => ChangeKind::AddIndex,
            SchemaChange::DropIndex { .. } => ChangeKind::DropIndex,
            SchemaChange::AddForeignKey { .. } => ChangeKind::AddFk,
            SchemaChange::DropForeignKey { .. } => ChangeKind::DropFk,
        }
    }

    /// Table the change applies to.
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table } | SchemaChange::DropTable { table } => &table.name,
            SchemaChange::AddColumn { table, .. }
            | SchemaChange::DropColumn { table, .. }
            | SchemaChange::AlterColumn { table, .. } => table,
            SchemaChange::AddIndex { index } | SchemaChange::DropIndex { index } => &index.table,
            SchemaChange::AddForeignKey { foreign_key } | SchemaChange::DropForeignKey { foreign_key } => {
                &foreign_key.table
            }
        }
    }

    /// Name of the column, index or constraint affected (table name for table changes).
    pub fn object(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table } | SchemaChange::DropTable { table } => &table.name,
            SchemaChange::AddColumn { column, .. } | SchemaChange::DropColumn { column, .. } => &column.name,
            SchemaChange::AlterColumn { to, .. } => &to.name,
            SchemaChange::AddIndex { index } | SchemaChange::DropIndex { index } => &index.name,
            SchemaChange::AddForeignKey { foreign_key } | SchemaChange::DropForeignKey { foreign_key } => {
                &foreign_key.name
            }
        }
    }

    pub fn risk(&self) -> RiskLevel {
        match self {
            SchemaChange::DropTable { .. } | SchemaChange::DropColumn { .. } => RiskLevel::Destructive,
            SchemaChange::AlterColumn { from, to, .. } => {
                if from.storage.widens_to(&to.storage) && (to.nullable || !from.nullable) {
                    RiskLevel::Safe
                } else {
                    RiskLevel::Destructive
                }
            }
            _ => RiskLevel::Safe,
        }
    }

    /// False when applying the inverse after this change cannot restore the prior data
    /// (type narrowing or a cross-family conversion).
    pub fn exact_inverse(&self) -> bool {
        match self {
            SchemaChange::AlterColumn { from, to, .. } => from.storage.widens_to(&to.storage),
            _ => true,
        }
    }

    pub fn invert(&self) -> SchemaChange {
        match self.clone() {
            SchemaChange::CreateTable { table } => SchemaChange::DropTable { table },
            SchemaChange::DropTable { table } => SchemaChange::CreateTable { table },
            SchemaChange::AddColumn { table, column } => SchemaChange::DropColumn { table, column },
            SchemaChange::DropColumn { table, column } => SchemaChange::AddColumn { table, column },
            SchemaChange::AlterColumn { table, from, to } => SchemaChange::AlterColumn { table, from: to, to: from },
            SchemaChange::AddIndex { index } => SchemaChange::DropIndex { index },
            SchemaChange::DropIndex { index } => SchemaChange::AddIndex { index },
            SchemaChange::AddForeignKey { foreign_key } => SchemaChange::DropForeignKey { foreign_key },
            SchemaChange::DropForeignKey { foreign_key } => SchemaChange::AddForeignKey { foreign_key },
        }
    }

    /// Execution phase: constraint drops first, then tables and columns, then new indexes and FKs
    /// once the columns they reference exist.
    fn phase(&self) -> u8 {
        match self.kind() {
            ChangeKind::DropFk => 0,
            ChangeKind::DropIndex => 1,
            ChangeKind::CreateTable => 2,
            ChangeKind::AddColumn => 3,
            ChangeKind::AlterColumn => 4,
            ChangeKind::DropColumn => 5,
            ChangeKind::DropTable => 6,
            ChangeKind::AddIndex => 7,
            ChangeKind::AddFk => 8,
        }
    }
}

/// Changes that turn `old` into `new`, in execution order. `old = None` means nothing exists yet.
pub fn diff(old: Option<&SchemaShape>, new: &SchemaShape) -> Vec<SchemaChange> {
    let empty = SchemaShape::default();
    let old = old.unwrap_or(&empty);
    let mut changes = Vec::new();

    for (name, table) in &new.tables {
        match old.tables.get(name) {
            None => changes.push(SchemaChange::CreateTable { table: table.clone() }),
            Some(prev) => diff_columns(prev, table, &mut changes),
        }
    }
    for (name, table) in &old.tables {
        if !new.tables.contains_key(name) {
            changes.push(SchemaChange::DropTable { table: table.clone() });
        }
    }

    for (name, index) in &new.indexes {
        match old.indexes.get(name) {
            None => changes.push(SchemaChange::AddIndex { index: index.clone() }),
            Some(prev) if prev != index => {
                changes.push(SchemaChange::DropIndex { index: prev.clone() });
                changes.push(SchemaChange::AddIndex { index: index.clone() });
            }
            Some(_) => {}
        }
    }
    for (name, index) in &old.indexes {
        if !new.indexes.contains_key(name) {
            changes.push(SchemaChange::DropIndex { index: index.clone() });
        }
    }

    for (name, fk) in &new.foreign_keys {
        match old.foreign_keys.get(name) {
            None => changes.push(SchemaChange::AddForeignKey { foreign_key: fk.clone() }),
            Some(prev) if prev != fk => {
                changes.push(SchemaChange::DropForeignKey { foreign_key: prev.clone() });
                changes.push(SchemaChange::AddForeignKey { foreign_key: fk.clone() });
            }
            Some(_) => {}
        }
    }
    for (name, fk) in &old.foreign_keys {
        if !new.foreign_keys.contains_key(name) {
            changes.push(SchemaChange::DropForeignKey { foreign_key: fk.clone() });
        }
    }

    order(&mut changes);
    changes
}

fn diff_columns(old: &TableShape, new: &TableShape, changes: &mut Vec<SchemaChange>) {
    for col in &new.columns {
        match old.column(&col.name) {
            None => changes.push(SchemaChange::AddColumn {
                table: new.name.clone(),
                column: col.clone(),
            }),
            Some(prev) if prev.storage != col.storage || prev.nullable != col.nullable => {
                changes.push(SchemaChange::AlterColumn {
                    table: new.name.clone(),
                    from: prev.clone(),
                    to: col.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for col in &old.columns {
        if new.column(&col.name).is_none() {
            changes.push(SchemaChange::DropColumn {
                table: old.name.clone(),
                column: col.clone(),
            });
        }
    }
}

/// Stable sort by phase, then table, then object name.
pub fn order(changes: &mut [SchemaChange]) {
    changes.sort_by(|a, b| {
        (a.phase(), a.table(), a.object()).cmp(&(b.phase(), b.table(), b.object()))
    });
}

/// Down script: inverse of every change, in reverse execution order.
pub fn invert_all(changes: &[SchemaChange]) -> Vec<SchemaChange> {
    changes.iter().rev().map(SchemaChange::invert).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::storage::StorageType;
    use crate::schema::types::ReferentialAction;
    use std::collections::BTreeMap;

    fn col(name: &str, storage: StorageType) -> ColumnShape {
        ColumnShape {
            name: name.into(),
            storage,
            nullable: true,
            system: false,
        }
    }

    fn shape(columns: Vec<ColumnShape>) -> SchemaShape {
        let mut tables = BTreeMap::new();
        tables.insert(
            "customers".to_string(),
            TableShape {
                name: "customers".into(),
                columns,
                primary_key: vec!["id".into()],
            },
        );
        SchemaShape {
            schema: "t_acme".into(),
            tables,
            ..Default::default()
        }
    }

    #[test]
    fn identical_shapes_have_no_changes() {
        let s = shape(vec![col("name", StorageType::Text)]);
        assert!(diff(Some(&s), &s).is_empty());
    }

    #[test]
    fn new_column_is_single_add() {
        let old = shape(vec![col("name", StorageType::Text)]);
        let new = shape(vec![
            col("name", StorageType::Text),
            col("loyalty_tier", StorageType::Varchar { length: 255 }),
        ]);
        let changes = diff(Some(&old), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind(), ChangeKind::AddColumn);
        assert_eq!(changes[0].risk(), RiskLevel::Safe);
    }

    #[test]
    fn narrowing_is_destructive_and_not_exactly_invertible() {
        let old = shape(vec![col("code", StorageType::Varchar { length: 100 })]);
        let new = shape(vec![col("code", StorageType::Varchar { length: 10 })]);
        let changes = diff(Some(&old), &new);
        assert_eq!(changes[0].kind(), ChangeKind::AlterColumn);
        assert_eq!(changes[0].risk(), RiskLevel::Destructive);
        assert!(!changes[0].exact_inverse());
        // the widening direction is fine
        let back = diff(Some(&new), &old);
        assert!(back[0].exact_inverse());
        assert_eq!(back[0].risk(), RiskLevel::Safe);
    }

    #[test]
    fn fk_drops_come_first_and_adds_last() {
        let fk = ForeignKeyShape {
            name: "fk_customers_org_id".into(),
            table: "customers".into(),
            column: "org_id".into(),
            ref_table: "orgs".into(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        };
        let mut old = shape(vec![col("org_id", StorageType::Uuid)]);
        old.foreign_keys.insert(fk.name.clone(), fk.clone());
        let mut new = shape(vec![col("owner_id", StorageType::Uuid)]);
        let fk2 = ForeignKeyShape {
            name: "fk_customers_owner_id".into(),
            column: "owner_id".into(),
            ..fk
        };
        new.foreign_keys.insert(fk2.name.clone(), fk2);
        let kinds: Vec<_> = diff(Some(&old), &new).iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::DropFk, ChangeKind::AddColumn, ChangeKind::DropColumn, ChangeKind::AddFk]
        );
    }

    #[test]
    fn inverse_undoes_forward() {
        let old = shape(vec![col("a", StorageType::Text)]);
        let new = shape(vec![col("b", StorageType::BigInt)]);
        let up = diff(Some(&old), &new);
        let down = invert_all(&up);
        let kinds: Vec<_> = down.iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec![ChangeKind::AddColumn, ChangeKind::DropColumn]);
        assert_eq!(down[0].object(), "a");
        assert_eq!(invert_all(&down), up);
    }

    #[test]
    fn change_kind_wire_names() {
        assert_eq!(serde_json::to_value(ChangeKind::AddColumn).unwrap(), "ADD_COLUMN");
        assert_eq!(serde_json::to_value(ChangeKind::AddFk).unwrap(), "ADD_FK");
    }
}

//! PostgreSQL DDL for schema changes. Identifiers come from validated metadata and are always quoted.

use super::diff::SchemaChange;
use super::shape::ColumnShape;
use crate::schema::types::ReferentialAction;

pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(name))
}

fn column_def(c: &ColumnShape) -> String {
    let mut def = format!("{} {}", quoted(&c.name), c.storage.sql());
    if !c.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

fn referential(label: &str, action: ReferentialAction) -> String {
    if action == ReferentialAction::NoAction {
        String::new()
    } else {
        format!(" {} {}", label, action.sql())
    }
}

/// Statements for one change.
pub fn render(schema: &str, change: &SchemaChange) -> Vec<String> {
    match change {
        SchemaChange::CreateTable { table } => {
            let mut defs: Vec<String> = table.columns.iter().map(column_def).collect();
            let pk: Vec<String> = table.primary_key.iter().map(|c| quoted(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
            vec![
                format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)),
                format!("CREATE TABLE {} ({})", qualified(schema, &table.name), defs.join(", ")),
            ]
        }
        SchemaChange::DropTable { table } => {
            vec![format!("DROP TABLE {}", qualified(schema, &table.name))]
        }
        SchemaChange::AddColumn { table, column } => vec![format!(
            "ALTER TABLE {} ADD COLUMN {}",
            qualified(schema, table),
            column_def(column)
        )],
        SchemaChange::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified(schema, table),
            quoted(&column.name)
        )],
        SchemaChange::AlterColumn { table, from, to } => {
            let t = qualified(schema, table);
            let col = quoted(&to.name);
            let mut out = Vec::new();
            if from.storage != to.storage {
                // same-family changes use the assignment cast, which rejects values that no longer fit
                let using = if from.storage.same_family(&to.storage) {
                    String::new()
                } else {
                    format!(" USING {}::{}", col, to.storage.sql())
                };
                out.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}{}",
                    t,
                    col,
                    to.storage.sql(),
                    using
                ));
            }
            if from.nullable != to.nullable {
                let op = if to.nullable { "DROP" } else { "SET" };
                out.push(format!("ALTER TABLE {} ALTER COLUMN {} {} NOT NULL", t, col, op));
            }
            out
        }
        SchemaChange::AddIndex { index } => {
            let cols: Vec<String> = index.columns.iter().map(|c| quoted(c)).collect();
            let filter = if index.live_only {
                format!(" WHERE {} IS NULL", quoted("deleted_at"))
            } else {
                String::new()
            };
            vec![format!(
                "CREATE {}INDEX {} ON {} ({}){}",
                if index.unique { "UNIQUE " } else { "" },
                quoted(&index.name),
                qualified(schema, &index.table),
                cols.join(", "),
                filter
            )]
        }
        SchemaChange::DropIndex { index } => {
            vec![format!("DROP INDEX {}", qualified(schema, &index.name))]
        }
        SchemaChange::AddForeignKey { foreign_key: fk } => vec![format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}{}",
            qualified(schema, &fk.table),
            quoted(&fk.name),
            quoted(&fk.column),
            qualified(schema, &fk.ref_table),
            quoted("id"),
            referential("ON DELETE", fk.on_delete),
            referential("ON UPDATE", fk.on_update)
        )],
        SchemaChange::DropForeignKey { foreign_key: fk } => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            qualified(schema, &fk.table),
            quoted(&fk.name)
        )],
    }
}

/// Statements for an ordered change list.
pub fn render_all(schema: &str, changes: &[SchemaChange]) -> Vec<String> {
    changes.iter().flat_map(|c| render(schema, c)).collect()
}

/// Script text as stored on the migration record.
pub fn script_text(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::shape::{ForeignKeyShape, IndexShape, TableShape};
    use crate::migration::storage::StorageType;

    fn col(name: &str, storage: StorageType, nullable: bool) -> ColumnShape {
        ColumnShape {
            name: name.into(),
            storage,
            nullable,
            system: false,
        }
    }

    #[test]
    fn create_table_renders_schema_and_pk() {
        let change = SchemaChange::CreateTable {
            table: TableShape {
                name: "customers".into(),
                columns: vec![
                    col("id", StorageType::Uuid, false),
                    col("email", StorageType::Varchar { length: 320 }, true),
                ],
                primary_key: vec!["id".into()],
            },
        };
        let sql = render("t_acme", &change);
        assert_eq!(sql[0], "CREATE SCHEMA IF NOT EXISTS \"t_acme\"");
        assert_eq!(
            sql[1],
            "CREATE TABLE \"t_acme\".\"customers\" (\"id\" uuid NOT NULL, \"email\" varchar(320), PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn alter_uses_cast_only_across_families() {
        let widen = SchemaChange::AlterColumn {
            table: "t".into(),
            from: col("c", StorageType::Varchar { length: 10 }, true),
            to: col("c", StorageType::Text, true),
        };
        assert_eq!(
            render("s", &widen),
            vec!["ALTER TABLE \"s\".\"t\" ALTER COLUMN \"c\" TYPE text".to_string()]
        );
        let convert = SchemaChange::AlterColumn {
            table: "t".into(),
            from: col("c", StorageType::Text, true),
            to: col("c", StorageType::BigInt, true),
        };
        assert!(render("s", &convert)[0].ends_with("USING \"c\"::bigint"));
    }

    #[test]
    fn partial_unique_index_and_fk() {
        let idx = SchemaChange::AddIndex {
            index: IndexShape {
                name: "uq_customers_email".into(),
                table: "customers".into(),
                columns: vec!["email".into()],
                unique: true,
                live_only: true,
            },
        };
        assert_eq!(
            render("t_acme", &idx)[0],
            "CREATE UNIQUE INDEX \"uq_customers_email\" ON \"t_acme\".\"customers\" (\"email\") WHERE \"deleted_at\" IS NULL"
        );
        let fk = SchemaChange::AddForeignKey {
            foreign_key: ForeignKeyShape {
                name: "fk_orders_customer_id".into(),
                table: "orders".into(),
                column: "customer_id".into(),
                ref_table: "customers".into(),
                on_delete: ReferentialAction::Cascade,
                on_update: ReferentialAction::NoAction,
            },
        };
        assert_eq!(
            render("t_acme", &fk)[0],
            "ALTER TABLE \"t_acme\".\"orders\" ADD CONSTRAINT \"fk_orders_customer_id\" FOREIGN KEY (\"customer_id\") REFERENCES \"t_acme\".\"customers\" (\"id\") ON DELETE CASCADE"
        );
    }
}

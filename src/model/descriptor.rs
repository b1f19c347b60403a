//! Immutable runtime model of one published entity version.

use crate::error::AppError;
use crate::expr::{self, Expr};
use crate::migration::shape::{constraint_name, relationship_column, system_columns};
use crate::migration::storage::StorageType;
use crate::schema::types::*;
use crate::tenant::tenant_schema;
use chrono::SecondsFormat;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type Record = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    Declared,
    /// FK column created by a relationship.
    Relationship,
}

#[derive(Clone, Debug)]
pub enum CompiledRule {
    Regex {
        pattern: Regex,
        message: Option<String>,
    },
    Range {
        min: Option<f64>,
        max: Option<f64>,
        message: Option<String>,
    },
    Length {
        min: Option<u32>,
        max: Option<u32>,
        message: Option<String>,
    },
    Expression {
        expr: Expr,
        fields: BTreeSet<String>,
        message: Option<String>,
    },
}

impl PartialEq for CompiledRule {
    fn eq(&self, other: &Self) -> bool {
        use CompiledRule::*;
        match (self, other) {
            (Regex { pattern: a, message: m1 }, Regex { pattern: b, message: m2 }) => a.as_str() == b.as_str() && m1 == m2,
            (Range { min: a, max: b, message: m1 }, Range { min: c, max: d, message: m2 }) => a == c && b == d && m1 == m2,
            (Length { min: a, max: b, message: m1 }, Length { min: c, max: d, message: m2 }) => a == c && b == d && m1 == m2,
            (Expression { expr: a, message: m1, .. }, Expression { expr: b, message: m2, .. }) => a == b && m1 == m2,
            _ => false,
        }
    }
}

impl CompiledRule {
    fn compile(rule: &ValidationRule) -> Result<Self, AppError> {
        Ok(match rule {
            ValidationRule::Regex { pattern, message } => CompiledRule::Regex {
                pattern: Regex::new(pattern).map_err(|e| AppError::Internal(format!("stored regex: {}", e)))?,
                message: message.clone(),
            },
            ValidationRule::Range { min, max, message } => CompiledRule::Range {
                min: *min,
                max: *max,
                message: message.clone(),
            },
            ValidationRule::Length { min, max, message } => CompiledRule::Length {
                min: *min,
                max: *max,
                message: message.clone(),
            },
            ValidationRule::Expression { expression, message } => {
                let expr = expr::parse(expression).map_err(|e| AppError::Internal(format!("stored expression: {}", e)))?;
                CompiledRule::Expression {
                    fields: expr.fields(),
                    expr,
                    message: message.clone(),
                }
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldModel {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    /// `None` for calculated fields.
    pub storage: Option<StorageType>,
    pub constraints: FieldConstraints,
    pub default_value: Option<Value>,
    pub rules: Vec<CompiledRule>,
    pub calculated: Option<Expr>,
    pub origin: FieldOrigin,
}

impl FieldModel {
    pub fn is_stored(&self) -> bool {
        self.storage.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// How a related row is reached in one hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinPath {
    /// `column` on this table holds the related id.
    Local { column: String },
    /// `column` on the related table holds this row's id.
    Remote { column: String },
    /// Rows of `table` pair `local_column` (this id) with `remote_column` (related id).
    Junction {
        table: String,
        local_column: String,
        remote_column: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationModel {
    pub name: String,
    pub target_entity_id: Uuid,
    pub target_name: String,
    pub target_table: String,
    pub target_display: String,
    pub target_soft_delete: bool,
    pub cardinality: Cardinality,
    pub join: JoinPath,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub entity_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub label: String,
    pub schema: String,
    pub table: String,
    pub version: i64,
    pub version_id: Uuid,
    pub soft_delete: bool,
    pub display_field: String,
    pub fields: Vec<FieldModel>,
    pub relations: BTreeMap<String, RelationModel>,
    /// Single-column unique index name -> field name.
    pub unique_constraints: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProjectedField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: &'static str,
    pub required: bool,
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Uuid>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProjectedRelation {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
}

/// Read-only view of a published schema for form and table renderers.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaProjection {
    pub entity_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub label: String,
    pub version: i64,
    pub display_field: String,
    pub fields: Vec<ProjectedField>,
    pub relations: Vec<ProjectedRelation>,
}

/// Type of a system column as seen by filters; `tenant_id` is not exposed.
pub fn system_field_type(name: &str) -> Option<FieldType> {
    match name {
        "id" => Some(FieldType::Uuid),
        "created_at" | "updated_at" | "deleted_at" => Some(FieldType::DateTime),
        "created_by" | "updated_by" | "deleted_by" => Some(FieldType::String),
        _ => None,
    }
}

/// Canonical JSON form of a value for a field type. Strings are accepted for numbers, booleans,
/// dates and ids so query-string input coerces.
pub fn normalize(field_type: &FieldType, v: &Value) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(match field_type {
        FieldType::Integer => match v {
            Value::Number(n) if n.is_i64() => v.clone(),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
                _ => return Err("must be an integer".into()),
            },
            Value::String(s) => Value::from(s.trim().parse::<i64>().map_err(|_| "must be an integer")?),
            _ => return Err("must be an integer".into()),
        },
        FieldType::Decimal { .. } => {
            let f = match v {
                Value::Number(n) => n.as_f64().ok_or("must be a number")?,
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| "must be a number")?,
                _ => return Err("must be a number".into()),
            };
            Value::Number(Number::from_f64(f).ok_or("must be a finite number")?)
        }
        FieldType::Boolean => match v {
            Value::Bool(_) => v.clone(),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
            _ => return Err("must be a boolean".into()),
        },
        FieldType::Date => {
            let s = v.as_str().ok_or("must be a date string")?;
            let d = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| "must be a YYYY-MM-DD date")?;
            Value::String(d.format("%Y-%m-%d").to_string())
        }
        FieldType::DateTime => {
            let s = v.as_str().ok_or("must be a datetime string")?;
            let dt = chrono::DateTime::parse_from_rfc3339(s).map_err(|_| "must be an RFC 3339 datetime")?;
            Value::String(format_datetime(&dt.with_timezone(&chrono::Utc)))
        }
        FieldType::Uuid | FieldType::Reference { .. } => {
            let s = v.as_str().ok_or("must be a UUID string")?;
            Value::String(Uuid::parse_str(s).map_err(|_| "must be a valid UUID")?.to_string())
        }
        FieldType::Calculated { .. } => return Err("is calculated and cannot be written".into()),
        FieldType::String
        | FieldType::Text
        | FieldType::Email
        | FieldType::Url
        | FieldType::Select { .. }
        | FieldType::Json => v.clone(),
    })
}

pub fn format_datetime(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl ModelDescriptor {
    /// Build from a published version. Fails only on metadata that should have been rejected at registry time.
    pub fn build(version: &SchemaVersion) -> Result<Self, AppError> {
        let snap = &version.snapshot;
        let entity = &snap.entity;
        let mut fields = Vec::new();
        let mut relations = BTreeMap::new();
        let mut unique_constraints = BTreeMap::new();

        let mut declared: Vec<&FieldDefinition> = snap.fields.iter().collect();
        declared.sort_by_key(|f| (f.position, f.name.clone()));
        for f in declared {
            let storage = StorageType::for_field(&f.field_type, &f.constraints);
            let calculated = match &f.field_type {
                FieldType::Calculated { expression } => Some(
                    expr::parse(expression).map_err(|e| AppError::Internal(format!("stored expression: {}", e)))?,
                ),
                _ => None,
            };
            let rules = f
                .validation_rules
                .iter()
                .map(CompiledRule::compile)
                .collect::<Result<Vec<_>, _>>()?;
            if f.constraints.unique {
                unique_constraints.insert(constraint_name("uq", &entity.table_name, &f.name), f.name.clone());
            }
            if let Some(target_id) = f.reference_entity_id() {
                let target = Target::resolve(snap, target_id)?;
                relations.insert(
                    f.name.clone(),
                    target.relation(&f.name, Cardinality::ToOne, JoinPath::Local { column: f.name.clone() }),
                );
            }
            fields.push(FieldModel {
                name: f.name.clone(),
                label: f.label.clone(),
                field_type: f.field_type.clone(),
                storage,
                constraints: f.constraints.clone(),
                default_value: f.default_value.clone(),
                rules,
                calculated,
                origin: FieldOrigin::Declared,
            });
        }

        for idx in snap.indexes.iter().filter(|i| i.unique && i.fields.len() == 1) {
            unique_constraints.insert(idx.name.clone(), idx.fields[0].clone());
        }

        for (i, rel) in snap.relationships.iter().enumerate() {
            let is_source = rel.source_entity_id == entity.id;
            let is_target = rel.target_entity_id == entity.id;
            let source = Target::resolve(snap, rel.source_entity_id)?;
            let target = Target::resolve(snap, rel.target_entity_id)?;
            match rel.kind {
                RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                    let column = relationship_column(snap, i)
                        .ok_or_else(|| AppError::Internal(format!("relationship '{}' has no column", rel.name)))?;
                    let one_to_one = rel.kind == RelationshipKind::OneToOne;
                    // the side holding the FK column
                    let (owner_is_self, other) = if one_to_one {
                        (is_source, &target)
                    } else {
                        (is_target, &source)
                    };
                    if owner_is_self {
                        fields.push(FieldModel {
                            name: column.clone(),
                            label: column.clone(),
                            field_type: FieldType::Reference { entity_id: other.id },
                            storage: Some(StorageType::Uuid),
                            constraints: FieldConstraints {
                                unique: one_to_one,
                                indexed: true,
                                ..Default::default()
                            },
                            default_value: None,
                            rules: Vec::new(),
                            calculated: None,
                            origin: FieldOrigin::Relationship,
                        });
                        if one_to_one {
                            unique_constraints.insert(constraint_name("uq", &entity.table_name, &column), column.clone());
                        }
                    }
                    if is_source {
                        let (card, join) = if one_to_one {
                            (Cardinality::ToOne, JoinPath::Local { column: column.clone() })
                        } else {
                            (Cardinality::ToMany, JoinPath::Remote { column: column.clone() })
                        };
                        relations
                            .entry(rel.name.clone())
                            .or_insert_with(|| target.relation(&rel.name, card, join));
                    }
                    if is_target {
                        let join = if one_to_one {
                            JoinPath::Remote { column: column.clone() }
                        } else {
                            JoinPath::Local { column: column.clone() }
                        };
                        relations
                            .entry(source.name.clone())
                            .or_insert_with(|| source.relation(&source.name, Cardinality::ToOne, join));
                    }
                }
                RelationshipKind::ManyToMany => {
                    let table = rel
                        .junction_table
                        .clone()
                        .ok_or_else(|| AppError::Internal(format!("relationship '{}' has no junction table", rel.name)))?;
                    if is_source {
                        relations.entry(rel.name.clone()).or_insert_with(|| {
                            target.relation(
                                &rel.name,
                                Cardinality::ToMany,
                                JoinPath::Junction {
                                    table: table.clone(),
                                    local_column: "source_id".into(),
                                    remote_column: "target_id".into(),
                                },
                            )
                        });
                    }
                    if is_target {
                        relations.entry(rel.name.clone()).or_insert_with(|| {
                            source.relation(
                                &rel.name,
                                Cardinality::ToMany,
                                JoinPath::Junction {
                                    table: table.clone(),
                                    local_column: "target_id".into(),
                                    remote_column: "source_id".into(),
                                },
                            )
                        });
                    }
                }
            }
        }

        // relation keys must not shadow field names
        let names: BTreeSet<String> = fields.iter().map(|f| f.name.clone()).collect();
        relations.retain(|k, r| !names.contains(k) || matches!(r.join, JoinPath::Local { ref column } if column == k));

        Ok(ModelDescriptor {
            entity_id: entity.id,
            tenant_id: entity.tenant_id.clone(),
            name: entity.name.clone(),
            label: entity.label.clone(),
            schema: tenant_schema(&entity.tenant_id),
            table: entity.table_name.clone(),
            version: version.version,
            version_id: version.id,
            soft_delete: entity.soft_delete,
            display_field: entity.display_field.clone().unwrap_or_else(|| "id".into()),
            fields,
            relations,
            unique_constraints,
        })
    }

    pub fn field(&self, name: &str) -> Option<&FieldModel> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldModel> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    /// Every physical column with its storage type, system columns first.
    pub fn columns(&self) -> Vec<(String, StorageType)> {
        system_columns(self.soft_delete)
            .into_iter()
            .map(|c| (c.name, c.storage))
            .chain(self.stored_fields().filter_map(|f| f.storage.map(|s| (f.name.clone(), s))))
            .collect()
    }

    pub fn column_storage(&self, name: &str) -> Option<StorageType> {
        self.columns().into_iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn searchable(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.constraints.searchable && f.is_stored())
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Many-to-many relations whose link sets are written through record bodies.
    pub fn link_relation(&self, name: &str) -> Option<&RelationModel> {
        self.relations
            .get(name)
            .filter(|r| matches!(r.join, JoinPath::Junction { .. }))
    }

    /// Fill calculated fields. Evaluation errors yield null.
    pub fn compute(&self, record: &mut Record) {
        for f in &self.fields {
            if let Some(expr) = &f.calculated {
                let v = match expr.eval(record) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(field = %f.name, error = %e, "calculated field evaluation failed");
                        Value::Null
                    }
                };
                record.insert(f.name.clone(), v);
            }
        }
    }

    pub fn projection(&self) -> SchemaProjection {
        SchemaProjection {
            entity_id: self.entity_id,
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            label: self.label.clone(),
            version: self.version,
            display_field: self.display_field.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| ProjectedField {
                    name: f.name.clone(),
                    label: f.label.clone(),
                    field_type: f.field_type.name(),
                    required: f.constraints.required,
                    read_only: f.calculated.is_some(),
                    options: match &f.field_type {
                        FieldType::Select { options } => Some(options.clone()),
                        _ => None,
                    },
                    reference: f.field_type_reference(),
                })
                .collect(),
            relations: self
                .relations
                .values()
                .map(|r| ProjectedRelation {
                    name: r.name.clone(),
                    target: r.target_name.clone(),
                    cardinality: r.cardinality,
                })
                .collect(),
        }
    }
}

impl FieldModel {
    fn field_type_reference(&self) -> Option<Uuid> {
        match self.field_type {
            FieldType::Reference { entity_id } => Some(entity_id),
            _ => None,
        }
    }
}

/// The entity on the far side of a relation, resolved from the snapshot.
struct Target {
    id: Uuid,
    name: String,
    table: String,
    display: String,
    soft_delete: bool,
}

impl Target {
    fn resolve(snap: &EntitySnapshot, id: Uuid) -> Result<Self, AppError> {
        if id == snap.entity.id {
            let e = &snap.entity;
            return Ok(Target {
                id,
                name: e.name.clone(),
                table: e.table_name.clone(),
                display: e.display_field.clone().unwrap_or_else(|| "id".into()),
                soft_delete: e.soft_delete,
            });
        }
        let r = snap
            .related(id)
            .ok_or_else(|| AppError::Internal(format!("snapshot lacks related entity {}", id)))?;
        Ok(Target {
            id,
            name: r.name.clone(),
            table: r.table_name.clone(),
            display: r.display_field.clone().unwrap_or_else(|| "id".into()),
            soft_delete: r.soft_delete,
        })
    }

    fn relation(&self, name: &str, cardinality: Cardinality, join: JoinPath) -> RelationModel {
        RelationModel {
            name: name.to_string(),
            target_entity_id: self.id,
            target_name: self.name.clone(),
            target_table: self.table.clone(),
            target_display: self.display.clone(),
            target_soft_delete: self.soft_delete,
            cardinality,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_coerces_query_strings() {
        assert_eq!(normalize(&FieldType::Integer, &json!("42")).unwrap(), json!(42));
        assert_eq!(normalize(&FieldType::Integer, &json!(3.0)).unwrap(), json!(3));
        assert!(normalize(&FieldType::Integer, &json!(3.5)).is_err());
        assert_eq!(normalize(&FieldType::Boolean, &json!("TRUE")).unwrap(), json!(true));
        assert_eq!(
            normalize(&FieldType::DateTime, &json!("2024-05-01T12:00:00+02:00")).unwrap(),
            json!("2024-05-01T10:00:00Z")
        );
        assert_eq!(
            normalize(&FieldType::Uuid, &json!("6F9619FF-8B86-D011-B42D-00CF4FC964FF")).unwrap(),
            json!("6f9619ff-8b86-d011-b42d-00cf4fc964ff")
        );
        assert_eq!(normalize(&FieldType::Text, &Value::Null).unwrap(), Value::Null);
    }
}

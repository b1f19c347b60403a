//! Metadata records owned by the schema registry, plus request payloads for editing them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Draft,
    Published,
    Migrating,
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "draft",
            EntityStatus::Published => "published",
            EntityStatus::Migrating => "migrating",
            EntityStatus::Archived => "archived",
        }
    }
}

/// Pending edits on top of a published version. The live version keeps serving data until the next publish.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftGeneration {
    pub parent_version_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub label: String,
    pub table_name: String,
    pub status: EntityStatus,
    /// Number of the live published version; 0 until first publish.
    pub version: i64,
    /// Records are soft-deleted (`deleted_at`) instead of removed.
    pub soft_delete: bool,
    /// Field shown when other entities traverse a relationship to this one.
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub published_version_id: Option<Uuid>,
    #[serde(default)]
    pub draft: Option<DraftGeneration>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityDefinition {
    pub fn is_published(&self) -> bool {
        self.status == EntityStatus::Published
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn default_precision() -> u8 {
    18
}

fn default_scale() -> u8 {
    2
}

/// Abstract field type. Storage mapping lives in `migration::storage`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Integer,
    Decimal {
        #[serde(default = "default_precision")]
        precision: u8,
        #[serde(default = "default_scale")]
        scale: u8,
    },
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Json,
    Uuid,
    Email,
    Url,
    Select {
        options: Vec<String>,
    },
    Reference {
        entity_id: Uuid,
    },
    /// Derived at read time from other fields; has no column.
    Calculated {
        expression: String,
    },
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal { .. } => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Json => "json",
            FieldType::Uuid => "uuid",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Select { .. } => "select",
            FieldType::Reference { .. } => "reference",
            FieldType::Calculated { .. } => "calculated",
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldType::String
                | FieldType::Text
                | FieldType::Email
                | FieldType::Url
                | FieldType::Select { .. }
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Decimal { .. })
    }

    pub fn is_stored(&self) -> bool {
        !matches!(self, FieldType::Calculated { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    /// Included in free-text search.
    #[serde(default)]
    pub searchable: bool,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Regex {
        pattern: String,
        #[serde(default)]
        message: Option<String>,
    },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Length {
        #[serde(default)]
        min: Option<u32>,
        #[serde(default)]
        max: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Must not evaluate to `false`; may reference other fields of the record.
    Expression {
        expression: String,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub constraints: FieldConstraints,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    pub position: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FieldDefinition {
    pub fn reference_entity_id(&self) -> Option<Uuid> {
        match self.field_type {
            FieldType::Reference { entity_id } => Some(entity_id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    OneToMany,
    ManyToMany,
    OneToOne,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// one-to-many: `foreign_key` column lives on the target table.
/// one-to-one: `foreign_key` column lives on the source table.
/// many-to-many: `junction_table` is owned by the source entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub source_entity_id: Uuid,
    pub target_entity_id: Uuid,
    pub kind: RelationshipKind,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default)]
    pub junction_table: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RelationshipDefinition {
    pub fn involves(&self, entity_id: Uuid) -> bool {
        self.source_entity_id == entity_id || self.target_entity_id == entity_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    pub created_at: DateTime<Utc>,
}

/// Summary of an entity on the other side of a relationship, frozen into a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub id: Uuid,
    pub name: String,
    pub table_name: String,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default)]
    pub soft_delete: bool,
}

/// Everything needed to rebuild an entity's physical shape and runtime model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: EntityDefinition,
    pub fields: Vec<FieldDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub relationships: Vec<RelationshipDefinition>,
    pub related: Vec<RelatedEntity>,
}

impl EntitySnapshot {
    pub fn related(&self, id: Uuid) -> Option<&RelatedEntity> {
        self.related.iter().find(|r| r.id == id)
    }
}

/// Immutable record of one published version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub tenant_id: String,
    pub version: i64,
    #[serde(default)]
    pub parent_version_id: Option<Uuid>,
    pub snapshot: EntitySnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewEntity {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub display_field: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EntityPatch {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub soft_delete: Option<bool>,
    #[serde(default)]
    pub display_field: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewField {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub field_type: FieldType,
    #[serde(default)]
    pub constraints: FieldConstraints,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FieldPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub constraints: Option<FieldConstraints>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation_rules: Option<Vec<ValidationRule>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewRelationship {
    pub name: String,
    pub source_entity_id: Uuid,
    pub target_entity_id: Uuid,
    pub kind: RelationshipKind,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default)]
    pub junction_table: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewIndex {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_type_json_shape() {
        let t: FieldType = serde_json::from_value(json!({"type": "decimal", "precision": 10})).unwrap();
        assert_eq!(t, FieldType::Decimal { precision: 10, scale: 2 });
        let t: FieldType = serde_json::from_value(json!({"type": "datetime"})).unwrap();
        assert_eq!(t, FieldType::DateTime);
        let t: FieldType =
            serde_json::from_value(json!({"type": "select", "options": ["bronze", "silver"]})).unwrap();
        assert_eq!(t.name(), "select");
        assert!(serde_json::from_value::<FieldType>(json!({"type": "blob"})).is_err());
    }

    #[test]
    fn validation_rules_are_tagged() {
        let r: ValidationRule =
            serde_json::from_value(json!({"rule": "range", "min": 0, "max": 10})).unwrap();
        assert_eq!(
            r,
            ValidationRule::Range {
                min: Some(0.0),
                max: Some(10.0),
                message: None
            }
        );
    }
}

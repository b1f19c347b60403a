//! Schema registry operations. Writes metadata only; physical tables change on publish.

use crate::error::AppError;
use crate::migration::shape::constraint_name;
use crate::migration::EntityLocks;
use crate::schema::catalog::Catalog;
use crate::schema::types::*;
use crate::schema::validator::{self, validate_identifier};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Index name prefixes generated for field constraints; user indexes may not use them.
const RESERVED_INDEX_PREFIXES: &[&str] = &["uq_", "ix_", "fk_"];
const MAX_INDEX_FIELDS: usize = 16;

pub struct SchemaRegistry {
    catalog: Catalog,
    locks: Arc<EntityLocks>,
}

impl SchemaRegistry {
    pub fn new(catalog: Catalog, locks: Arc<EntityLocks>) -> Self {
        SchemaRegistry { catalog, locks }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Load an entity that may still be edited.
    async fn editable(&self, tenant_id: &str, id: Uuid) -> Result<EntityDefinition, AppError> {
        let e = self.catalog.require_entity(tenant_id, id).await?;
        match e.status {
            EntityStatus::Archived => Err(AppError::Conflict(format!("entity '{}' is archived", e.name))),
            EntityStatus::Migrating => Err(AppError::Conflict(format!("entity '{}' is being migrated", e.name))),
            _ => Ok(e),
        }
    }

    /// Record the edit; a published entity gains a draft generation while its live version keeps serving.
    async fn touch(&self, mut e: EntityDefinition) -> Result<EntityDefinition, AppError> {
        let now = Utc::now();
        if let (true, None, Some(parent)) = (e.is_published(), &e.draft, e.published_version_id) {
            e.draft = Some(DraftGeneration {
                parent_version_id: parent,
                started_at: now,
            });
            tracing::debug!(entity = %e.name, "draft generation started");
        }
        e.updated_at = now;
        self.catalog.save_entity(&e).await?;
        Ok(e)
    }

    // entities

    pub async fn create_entity(&self, tenant_id: &str, input: NewEntity) -> Result<EntityDefinition, AppError> {
        validate_identifier("name", &input.name)?;
        let table_name = input.table_name.unwrap_or_else(|| input.name.clone());
        validate_identifier("table_name", &table_name)?;
        if let Some(d) = &input.display_field {
            validate_identifier("display_field", d)?;
        }
        let now = Utc::now();
        let e = EntityDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            label: input.label.unwrap_or_else(|| input.name.clone()),
            name: input.name,
            table_name,
            status: EntityStatus::Draft,
            version: 0,
            soft_delete: input.soft_delete,
            display_field: input.display_field,
            published_version_id: None,
            draft: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.catalog.save_entity(&e).await?;
        tracing::info!(tenant = %tenant_id, entity = %e.name, "entity created");
        Ok(e)
    }

    pub async fn list_entities(&self, tenant_id: &str) -> Result<Vec<EntityDefinition>, AppError> {
        Ok(self
            .catalog
            .entities(tenant_id)
            .await?
            .into_iter()
            .filter(|e| !e.is_deleted())
            .collect())
    }

    pub async fn get_entity(&self, tenant_id: &str, id: Uuid) -> Result<EntityDefinition, AppError> {
        self.catalog.require_entity(tenant_id, id).await
    }

    pub async fn update_entity(&self, tenant_id: &str, id: Uuid, patch: EntityPatch) -> Result<EntityDefinition, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, id)?;
        let mut e = self.editable(tenant_id, id).await?;
        if let Some(label) = patch.label {
            e.label = label;
        }
        if let Some(table) = patch.table_name {
            if table != e.table_name {
                if e.published_version_id.is_some() {
                    return Err(AppError::field("table_name", "cannot change after the entity has been published"));
                }
                validate_identifier("table_name", &table)?;
                e.table_name = table;
            }
        }
        if let Some(soft) = patch.soft_delete {
            e.soft_delete = soft;
        }
        if let Some(display) = patch.display_field {
            validate_identifier("display_field", &display)?;
            let fields = self.catalog.fields(tenant_id, id).await?;
            if display != "id" && !fields.iter().any(|f| f.name == display && f.field_type.is_stored()) {
                return Err(AppError::field("display_field", format!("unknown field '{}'", display)));
            }
            e.display_field = Some(display);
        }
        self.touch(e).await
    }

    /// Drafts are removed outright; archived entities are marked deleted and keep their history.
    pub async fn delete_entity(&self, tenant_id: &str, id: Uuid) -> Result<(), AppError> {
        let _guard = self.locks.try_acquire(tenant_id, id)?;
        let mut e = self.catalog.require_entity(tenant_id, id).await?;
        match e.status {
            EntityStatus::Published | EntityStatus::Migrating => Err(AppError::Conflict(format!(
                "entity '{}' is {}; archive it before deleting",
                e.name,
                e.status.as_str()
            ))),
            EntityStatus::Archived => {
                e.deleted_at = Some(Utc::now());
                e.updated_at = Utc::now();
                self.catalog.save_entity(&e).await?;
                tracing::info!(tenant = %tenant_id, entity = %e.name, "archived entity deleted");
                Ok(())
            }
            EntityStatus::Draft => {
                if let Some(r) = self.catalog.relationships_of(tenant_id, id).await?.first() {
                    return Err(AppError::Conflict(format!(
                        "entity '{}' is used by relationship '{}'",
                        e.name, r.name
                    )));
                }
                for other in self.catalog.entities(tenant_id).await? {
                    if other.id == id || other.is_deleted() {
                        continue;
                    }
                    let fields = self.catalog.fields(tenant_id, other.id).await?;
                    if let Some(f) = fields.iter().find(|f| f.reference_entity_id() == Some(id)) {
                        return Err(AppError::Conflict(format!(
                            "entity '{}' is referenced by {}.{}",
                            e.name, other.name, f.name
                        )));
                    }
                }
                for f in self.catalog.fields(tenant_id, id).await? {
                    self.catalog.remove_field(tenant_id, f.id).await?;
                }
                for i in self.catalog.indexes(tenant_id, id).await? {
                    self.catalog.remove_index(tenant_id, i.id).await?;
                }
                self.catalog.remove_entity(tenant_id, id).await?;
                tracing::info!(tenant = %tenant_id, entity = %e.name, "draft entity deleted");
                Ok(())
            }
        }
    }

    // fields

    /// Names claimed on the entity by relationships: FK columns on its table and, for sources, the relation name.
    async fn relationship_names(&self, tenant_id: &str, e: &EntityDefinition) -> Result<BTreeSet<String>, AppError> {
        let mut names = BTreeSet::new();
        for r in self.catalog.relationships_of(tenant_id, e.id).await? {
            let owns_column = match r.kind {
                RelationshipKind::OneToMany => r.target_entity_id == e.id,
                RelationshipKind::OneToOne => r.source_entity_id == e.id,
                RelationshipKind::ManyToMany => false,
            };
            if owns_column {
                if let Some(fk) = r.foreign_key {
                    names.insert(fk);
                }
            }
            if r.source_entity_id == e.id {
                names.insert(r.name);
            }
        }
        Ok(names)
    }

    async fn check_field(
        &self,
        tenant_id: &str,
        e: &EntityDefinition,
        field: &FieldDefinition,
        siblings: &[FieldDefinition],
    ) -> Result<(), AppError> {
        validator::validate_field(field, siblings)?;
        if self.relationship_names(tenant_id, e).await?.contains(&field.name) {
            return Err(AppError::field(
                "name",
                format!("'{}' is already used by a relationship", field.name),
            ));
        }
        if let Some(target_id) = field.reference_entity_id() {
            let target = self.catalog.require_entity(tenant_id, target_id).await?;
            if target.status == EntityStatus::Archived {
                return Err(AppError::field(
                    "field_type.entity_id",
                    format!("entity '{}' is archived", target.name),
                ));
            }
        }
        Ok(())
    }

    pub async fn add_field(&self, tenant_id: &str, entity_id: Uuid, input: NewField) -> Result<FieldDefinition, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let e = self.editable(tenant_id, entity_id).await?;
        let siblings = self.catalog.fields(tenant_id, entity_id).await?;
        let now = Utc::now();
        let field = FieldDefinition {
            id: Uuid::new_v4(),
            entity_id,
            tenant_id: tenant_id.to_string(),
            label: input.label.unwrap_or_else(|| input.name.clone()),
            name: input.name,
            field_type: input.field_type,
            constraints: input.constraints,
            default_value: input.default_value,
            validation_rules: input.validation_rules,
            position: siblings.iter().map(|f| f.position + 1).max().unwrap_or(0),
            created_at: now,
            updated_at: now,
        };
        self.check_field(tenant_id, &e, &field, &siblings).await?;
        self.catalog.save_field(&field).await?;
        self.touch(e).await?;
        tracing::info!(tenant = %tenant_id, field = %field.name, entity_id = %entity_id, "field added");
        Ok(field)
    }

    pub async fn list_fields(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<FieldDefinition>, AppError> {
        self.catalog.require_entity(tenant_id, entity_id).await?;
        self.catalog.fields(tenant_id, entity_id).await
    }

    pub async fn get_field(&self, tenant_id: &str, entity_id: Uuid, field_id: Uuid) -> Result<FieldDefinition, AppError> {
        self.catalog
            .field(tenant_id, field_id)
            .await?
            .filter(|f| f.entity_id == entity_id)
            .ok_or_else(|| AppError::NotFound(format!("field {}", field_id)))
    }

    /// Names of things that depend on a field by name.
    async fn field_dependents(
        &self,
        tenant_id: &str,
        e: &EntityDefinition,
        field: &FieldDefinition,
    ) -> Result<Vec<String>, AppError> {
        let mut out = Vec::new();
        if e.display_field.as_deref() == Some(field.name.as_str()) {
            out.push("display_field".to_string());
        }
        for i in self.catalog.indexes(tenant_id, e.id).await? {
            if i.fields.contains(&field.name) {
                out.push(format!("index {}", i.name));
            }
        }
        for other in self.catalog.fields(tenant_id, e.id).await? {
            if other.id == field.id {
                continue;
            }
            let mut refs = BTreeSet::new();
            if let FieldType::Calculated { expression } = &other.field_type {
                if let Ok(parsed) = crate::expr::parse(expression) {
                    refs.extend(parsed.fields());
                }
            }
            for rule in &other.validation_rules {
                if let ValidationRule::Expression { expression, .. } = rule {
                    if let Ok(parsed) = crate::expr::parse(expression) {
                        refs.extend(parsed.fields());
                    }
                }
            }
            if refs.contains(&field.name) {
                out.push(format!("field {}", other.name));
            }
        }
        Ok(out)
    }

    pub async fn update_field(
        &self,
        tenant_id: &str,
        entity_id: Uuid,
        field_id: Uuid,
        patch: FieldPatch,
    ) -> Result<FieldDefinition, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let e = self.editable(tenant_id, entity_id).await?;
        let current = self.get_field(tenant_id, entity_id, field_id).await?;
        let mut field = current.clone();
        if let Some(name) = patch.name {
            if name != current.name {
                let deps = self.field_dependents(tenant_id, &e, &current).await?;
                if !deps.is_empty() {
                    return Err(AppError::field(
                        "name",
                        format!("cannot rename '{}': used by {}", current.name, deps.join(", ")),
                    ));
                }
                field.name = name;
            }
        }
        if let Some(label) = patch.label {
            field.label = label;
        }
        if let Some(t) = patch.field_type {
            field.field_type = t;
        }
        if let Some(c) = patch.constraints {
            field.constraints = c;
        }
        if let Some(d) = patch.default_value {
            field.default_value = if d.is_null() { None } else { Some(d) };
        }
        if let Some(rules) = patch.validation_rules {
            field.validation_rules = rules;
        }
        field.updated_at = Utc::now();
        let siblings: Vec<FieldDefinition> = self
            .catalog
            .fields(tenant_id, entity_id)
            .await?
            .into_iter()
            .filter(|f| f.id != field_id)
            .collect();
        self.check_field(tenant_id, &e, &field, &siblings).await?;
        self.catalog.save_field(&field).await?;
        self.touch(e).await?;
        Ok(field)
    }

    pub async fn delete_field(&self, tenant_id: &str, entity_id: Uuid, field_id: Uuid) -> Result<(), AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let e = self.editable(tenant_id, entity_id).await?;
        let field = self.get_field(tenant_id, entity_id, field_id).await?;
        let deps = self.field_dependents(tenant_id, &e, &field).await?;
        if !deps.is_empty() {
            return Err(AppError::field(
                "name",
                format!("cannot delete '{}': used by {}", field.name, deps.join(", ")),
            ));
        }
        self.catalog.remove_field(tenant_id, field_id).await?;
        self.touch(e).await?;
        tracing::info!(tenant = %tenant_id, field = %field.name, entity_id = %entity_id, "field deleted");
        Ok(())
    }

    // relationships

    pub async fn add_relationship(&self, tenant_id: &str, input: NewRelationship) -> Result<RelationshipDefinition, AppError> {
        validate_identifier("name", &input.name)?;
        let _source_guard = self.locks.try_acquire(tenant_id, input.source_entity_id)?;
        let _target_guard = if input.target_entity_id != input.source_entity_id {
            Some(self.locks.try_acquire(tenant_id, input.target_entity_id)?)
        } else {
            None
        };
        let source = self.editable(tenant_id, input.source_entity_id).await?;
        let target = self.editable(tenant_id, input.target_entity_id).await?;
        if input.on_delete == ReferentialAction::SetDefault || input.on_update == ReferentialAction::SetDefault {
            return Err(AppError::field("on_delete", "set_default is not supported; columns have no defaults"));
        }

        let source_names: BTreeSet<String> = self
            .catalog
            .fields(tenant_id, source.id)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();
        if source_names.contains(&input.name) || validator::is_system_field(&input.name) {
            return Err(AppError::field(
                "name",
                format!("'{}' clashes with a field of '{}'", input.name, source.name),
            ));
        }

        let (foreign_key, junction_table) = match input.kind {
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                if input.junction_table.is_some() {
                    return Err(AppError::field("junction_table", "only many_to_many relationships use a junction table"));
                }
                let (owner, default) = if input.kind == RelationshipKind::OneToMany {
                    (&target, format!("{}_id", source.name))
                } else {
                    (&source, format!("{}_id", target.name))
                };
                let fk = input.foreign_key.unwrap_or(default);
                validate_identifier("foreign_key", &fk)?;
                let taken = self.relationship_names(tenant_id, owner).await?;
                let owner_fields = self.catalog.fields(tenant_id, owner.id).await?;
                if taken.contains(&fk) || validator::is_system_field(&fk) || owner_fields.iter().any(|f| f.name == fk) {
                    return Err(AppError::field(
                        "foreign_key",
                        format!("column '{}' already exists on '{}'", fk, owner.name),
                    ));
                }
                (Some(fk), None)
            }
            RelationshipKind::ManyToMany => {
                if input.foreign_key.is_some() {
                    return Err(AppError::field("foreign_key", "many_to_many relationships use a junction table"));
                }
                let junction = input
                    .junction_table
                    .unwrap_or_else(|| format!("{}_{}", source.table_name, input.name));
                validate_identifier("junction_table", &junction)?;
                (None, Some(junction))
            }
        };

        let rel = RelationshipDefinition {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: input.name,
            source_entity_id: source.id,
            target_entity_id: target.id,
            kind: input.kind,
            foreign_key,
            on_delete: input.on_delete,
            on_update: input.on_update,
            junction_table,
            created_at: Utc::now(),
        };
        self.catalog.save_relationship(&rel).await?;
        let same = source.id == target.id;
        self.touch(source).await?;
        if !same {
            self.touch(target).await?;
        }
        tracing::info!(tenant = %tenant_id, relationship = %rel.name, "relationship added");
        Ok(rel)
    }

    pub async fn list_relationships(&self, tenant_id: &str) -> Result<Vec<RelationshipDefinition>, AppError> {
        self.catalog.relationships(tenant_id).await
    }

    pub async fn get_relationship(&self, tenant_id: &str, id: Uuid) -> Result<RelationshipDefinition, AppError> {
        self.catalog
            .relationship(tenant_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("relationship {}", id)))
    }

    pub async fn delete_relationship(&self, tenant_id: &str, id: Uuid) -> Result<(), AppError> {
        let rel = self.get_relationship(tenant_id, id).await?;
        let _source_guard = self.locks.try_acquire(tenant_id, rel.source_entity_id)?;
        let _target_guard = if rel.target_entity_id != rel.source_entity_id {
            Some(self.locks.try_acquire(tenant_id, rel.target_entity_id)?)
        } else {
            None
        };
        let source = self.editable(tenant_id, rel.source_entity_id).await?;
        let target = self.editable(tenant_id, rel.target_entity_id).await?;
        self.catalog.remove_relationship(tenant_id, id).await?;
        let same = source.id == target.id;
        self.touch(source).await?;
        if !same {
            self.touch(target).await?;
        }
        tracing::info!(tenant = %tenant_id, relationship = %rel.name, "relationship deleted");
        Ok(())
    }

    // indexes

    pub async fn add_index(&self, tenant_id: &str, entity_id: Uuid, input: NewIndex) -> Result<IndexDefinition, AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let e = self.editable(tenant_id, entity_id).await?;
        if input.fields.is_empty() || input.fields.len() > MAX_INDEX_FIELDS {
            return Err(AppError::field(
                "fields",
                format!("an index needs between 1 and {} fields", MAX_INDEX_FIELDS),
            ));
        }
        let fields = self.catalog.fields(tenant_id, entity_id).await?;
        let mut seen = BTreeSet::new();
        for (i, name) in input.fields.iter().enumerate() {
            let path = format!("fields[{}]", i);
            if !seen.insert(name.as_str()) {
                return Err(AppError::field(path, format!("'{}' is listed twice", name)));
            }
            let indexable_system = matches!(name.as_str(), "created_at" | "created_by" | "updated_at" | "updated_by");
            let indexable_field = fields.iter().any(|f| {
                &f.name == name && f.field_type.is_stored() && !matches!(f.field_type, FieldType::Json)
            });
            if !indexable_system && !indexable_field {
                return Err(AppError::field(path, format!("'{}' is not an indexable field", name)));
            }
        }
        let name = match input.name {
            Some(n) => {
                validate_identifier("name", &n)?;
                if RESERVED_INDEX_PREFIXES.iter().any(|p| n.starts_with(p)) {
                    return Err(AppError::field(
                        "name",
                        format!("prefixes {} are reserved", RESERVED_INDEX_PREFIXES.join(", ")),
                    ));
                }
                n
            }
            None => constraint_name("idx", &e.table_name, &input.fields.join("_")),
        };
        let index = IndexDefinition {
            id: Uuid::new_v4(),
            entity_id,
            tenant_id: tenant_id.to_string(),
            name,
            fields: input.fields,
            unique: input.unique,
            created_at: Utc::now(),
        };
        self.catalog.save_index(&index).await?;
        self.touch(e).await?;
        Ok(index)
    }

    pub async fn list_indexes(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<IndexDefinition>, AppError> {
        self.catalog.require_entity(tenant_id, entity_id).await?;
        self.catalog.indexes(tenant_id, entity_id).await
    }

    pub async fn delete_index(&self, tenant_id: &str, entity_id: Uuid, index_id: Uuid) -> Result<(), AppError> {
        let _guard = self.locks.try_acquire(tenant_id, entity_id)?;
        let e = self.editable(tenant_id, entity_id).await?;
        let index = self
            .catalog
            .index(tenant_id, index_id)
            .await?
            .filter(|i| i.entity_id == entity_id)
            .ok_or_else(|| AppError::NotFound(format!("index {}", index_id)))?;
        self.catalog.remove_index(tenant_id, index.id).await?;
        self.touch(e).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetadataStore;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(
            Catalog::new(Arc::new(MemoryMetadataStore::new())),
            Arc::new(EntityLocks::default()),
        )
    }

    fn new_entity(name: &str) -> NewEntity {
        NewEntity {
            name: name.into(),
            label: None,
            table_name: None,
            soft_delete: false,
            display_field: None,
        }
    }

    fn new_field(name: &str, field_type: FieldType) -> NewField {
        NewField {
            name: name.into(),
            label: None,
            field_type,
            constraints: FieldConstraints::default(),
            default_value: None,
            validation_rules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn names_are_unique_per_tenant() {
        let reg = registry();
        reg.create_entity("acme", new_entity("customer")).await.unwrap();
        let err = reg.create_entity("acme", new_entity("customer")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        reg.create_entity("globex", new_entity("customer")).await.unwrap();
        let err = reg.create_entity("acme", new_entity("Customer")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "name"));
    }

    #[tokio::test]
    async fn entities_resolve_by_name_within_tenant() {
        let reg = registry();
        let e = reg.create_entity("acme", new_entity("customer")).await.unwrap();
        let found = reg.catalog().entity_by_name("acme", "customer").await.unwrap().unwrap();
        assert_eq!(found.id, e.id);
        assert!(reg.catalog().entity_by_name("globex", "customer").await.unwrap().is_none());
        assert!(reg.catalog().entity_by_name("acme", "order").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn field_names_unique_and_positions_increase() {
        let reg = registry();
        let e = reg.create_entity("acme", new_entity("customer")).await.unwrap();
        let a = reg.add_field("acme", e.id, new_field("name", FieldType::String)).await.unwrap();
        let b = reg.add_field("acme", e.id, new_field("email", FieldType::Email)).await.unwrap();
        assert!(b.position > a.position);
        let err = reg
            .add_field("acme", e.id, new_field("email", FieldType::Text))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        let err = reg
            .add_field("acme", e.id, new_field("created_at", FieldType::Text))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn reference_to_missing_entity_is_not_found() {
        let reg = registry();
        let e = reg.create_entity("acme", new_entity("order")).await.unwrap();
        let err = reg
            .add_field(
                "acme",
                e.id,
                new_field("customer", FieldType::Reference { entity_id: Uuid::new_v4() }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn many_to_many_gets_default_junction_and_blocks_table_name() {
        let reg = registry();
        let s = reg.create_entity("acme", new_entity("student")).await.unwrap();
        let c = reg.create_entity("acme", new_entity("course")).await.unwrap();
        let rel = reg
            .add_relationship(
                "acme",
                NewRelationship {
                    name: "courses".into(),
                    source_entity_id: s.id,
                    target_entity_id: c.id,
                    kind: RelationshipKind::ManyToMany,
                    foreign_key: None,
                    on_delete: ReferentialAction::NoAction,
                    on_update: ReferentialAction::NoAction,
                    junction_table: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(rel.junction_table.as_deref(), Some("student_courses"));
        let err = reg
            .create_entity(
                "acme",
                NewEntity {
                    table_name: Some("student_courses".into()),
                    ..new_entity("enrolment")
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        // a draft with relationships cannot be deleted
        assert!(matches!(reg.delete_entity("acme", s.id).await, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn fields_used_by_indexes_cannot_be_deleted() {
        let reg = registry();
        let e = reg.create_entity("acme", new_entity("customer")).await.unwrap();
        let f = reg.add_field("acme", e.id, new_field("email", FieldType::Email)).await.unwrap();
        reg.add_index(
            "acme",
            e.id,
            NewIndex {
                name: None,
                fields: vec!["email".into()],
                unique: false,
            },
        )
        .await
        .unwrap();
        let err = reg.delete_field("acme", e.id, f.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}

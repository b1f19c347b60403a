//! Typed access to schema metadata held in a [`MetadataStore`].

use crate::error::AppError;
use crate::migration::EntityMigration;
use crate::schema::types::*;
use crate::store::{MetaKind, MetaRecord, MetadataStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn MetadataStore>,
}

fn decode<T: DeserializeOwned>(kind: MetaKind, v: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(v).map_err(|e| AppError::Internal(format!("corrupt {} metadata: {}", kind.as_str(), e)))
}

fn encode<T: Serialize>(v: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(v).map_err(|e| AppError::Internal(e.to_string()))
}

fn entity_key(name: &str) -> String {
    format!("entity:{}", name)
}

impl Catalog {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Catalog { store }
    }

    async fn put<T: Serialize>(
        &self,
        kind: MetaKind,
        tenant_id: &str,
        id: Uuid,
        parent: Option<Uuid>,
        unique_keys: Vec<String>,
        value: &T,
    ) -> Result<(), AppError> {
        let record = MetaRecord {
            id: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            unique_keys,
            payload: encode(value)?,
        };
        self.store.put(kind, tenant_id, record).await
    }

    async fn get<T: DeserializeOwned>(&self, kind: MetaKind, tenant_id: &str, id: Uuid) -> Result<Option<T>, AppError> {
        match self.store.get(kind, tenant_id, &id.to_string()).await? {
            Some(v) => Ok(Some(decode(kind, v)?)),
            None => Ok(None),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        kind: MetaKind,
        tenant_id: &str,
        parent: Option<Uuid>,
    ) -> Result<Vec<T>, AppError> {
        let parent = parent.map(|p| p.to_string());
        self.store
            .list(kind, tenant_id, parent.as_deref())
            .await?
            .into_iter()
            .map(|v| decode(kind, v))
            .collect()
    }

    async fn remove(&self, kind: MetaKind, tenant_id: &str, id: Uuid) -> Result<bool, AppError> {
        self.store.remove(kind, tenant_id, &id.to_string()).await
    }

    // entities

    pub async fn entity(&self, tenant_id: &str, id: Uuid) -> Result<Option<EntityDefinition>, AppError> {
        self.get(MetaKind::Entity, tenant_id, id).await
    }

    pub async fn require_entity(&self, tenant_id: &str, id: Uuid) -> Result<EntityDefinition, AppError> {
        self.entity(tenant_id, id)
            .await?
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| AppError::NotFound(format!("entity {}", id)))
    }

    /// Entities of a tenant, including deleted ones, ordered by name.
    pub async fn entities(&self, tenant_id: &str) -> Result<Vec<EntityDefinition>, AppError> {
        let mut all: Vec<EntityDefinition> = self.list(MetaKind::Entity, tenant_id, None).await?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    /// Live entity holding `name`, resolved through its unique name key.
    pub async fn entity_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<EntityDefinition>, AppError> {
        let found = self
            .store
            .find_by_key(MetaKind::Entity, tenant_id, &entity_key(name))
            .await?;
        match found {
            Some(v) => Ok(Some(decode::<EntityDefinition>(MetaKind::Entity, v)?).filter(|e| !e.is_deleted())),
            None => Ok(None),
        }
    }

    pub async fn save_entity(&self, e: &EntityDefinition) -> Result<(), AppError> {
        let keys = vec![entity_key(&e.name), format!("table:{}", e.table_name)];
        self.put(MetaKind::Entity, &e.tenant_id, e.id, None, keys, e).await
    }

    pub async fn remove_entity(&self, tenant_id: &str, id: Uuid) -> Result<bool, AppError> {
        self.remove(MetaKind::Entity, tenant_id, id).await
    }

    // fields

    /// Fields of an entity ordered by position.
    pub async fn fields(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<FieldDefinition>, AppError> {
        let mut fields: Vec<FieldDefinition> = self.list(MetaKind::Field, tenant_id, Some(entity_id)).await?;
        fields.sort_by_key(|f| (f.position, f.created_at));
        Ok(fields)
    }

    pub async fn field(&self, tenant_id: &str, id: Uuid) -> Result<Option<FieldDefinition>, AppError> {
        self.get(MetaKind::Field, tenant_id, id).await
    }

    pub async fn save_field(&self, f: &FieldDefinition) -> Result<(), AppError> {
        let keys = vec![format!("field:{}:{}", f.entity_id, f.name)];
        self.put(MetaKind::Field, &f.tenant_id, f.id, Some(f.entity_id), keys, f).await
    }

    pub async fn remove_field(&self, tenant_id: &str, id: Uuid) -> Result<bool, AppError> {
        self.remove(MetaKind::Field, tenant_id, id).await
    }

    // relationships

    pub async fn relationships(&self, tenant_id: &str) -> Result<Vec<RelationshipDefinition>, AppError> {
        let mut all: Vec<RelationshipDefinition> = self.list(MetaKind::Relationship, tenant_id, None).await?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    pub async fn relationships_of(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<RelationshipDefinition>, AppError> {
        Ok(self
            .relationships(tenant_id)
            .await?
            .into_iter()
            .filter(|r| r.involves(entity_id))
            .collect())
    }

    pub async fn relationship(&self, tenant_id: &str, id: Uuid) -> Result<Option<RelationshipDefinition>, AppError> {
        self.get(MetaKind::Relationship, tenant_id, id).await
    }

    pub async fn save_relationship(&self, r: &RelationshipDefinition) -> Result<(), AppError> {
        let mut keys = vec![format!("relationship:{}", r.name)];
        if let Some(j) = &r.junction_table {
            keys.push(format!("table:{}", j));
        }
        self.put(MetaKind::Relationship, &r.tenant_id, r.id, None, keys, r).await
    }

    pub async fn remove_relationship(&self, tenant_id: &str, id: Uuid) -> Result<bool, AppError> {
        self.remove(MetaKind::Relationship, tenant_id, id).await
    }

    // indexes

    pub async fn indexes(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<IndexDefinition>, AppError> {
        let mut all: Vec<IndexDefinition> = self.list(MetaKind::Index, tenant_id, Some(entity_id)).await?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    pub async fn index(&self, tenant_id: &str, id: Uuid) -> Result<Option<IndexDefinition>, AppError> {
        self.get(MetaKind::Index, tenant_id, id).await
    }

    pub async fn save_index(&self, i: &IndexDefinition) -> Result<(), AppError> {
        let keys = vec![format!("pgindex:{}", i.name)];
        self.put(MetaKind::Index, &i.tenant_id, i.id, Some(i.entity_id), keys, i).await
    }

    pub async fn remove_index(&self, tenant_id: &str, id: Uuid) -> Result<bool, AppError> {
        self.remove(MetaKind::Index, tenant_id, id).await
    }

    // versions and migrations

    pub async fn version(&self, tenant_id: &str, id: Uuid) -> Result<Option<SchemaVersion>, AppError> {
        self.get(MetaKind::Version, tenant_id, id).await
    }

    pub async fn save_version(&self, v: &SchemaVersion) -> Result<(), AppError> {
        self.put(MetaKind::Version, &v.tenant_id, v.id, Some(v.entity_id), Vec::new(), v)
            .await
    }

    /// Migrations of an entity, oldest first.
    pub async fn migrations(&self, tenant_id: &str, entity_id: Uuid) -> Result<Vec<EntityMigration>, AppError> {
        let mut all: Vec<EntityMigration> = self.list(MetaKind::Migration, tenant_id, Some(entity_id)).await?;
        all.sort_by_key(|m| m.created_at);
        Ok(all)
    }

    pub async fn migration(&self, tenant_id: &str, id: Uuid) -> Result<Option<EntityMigration>, AppError> {
        self.get(MetaKind::Migration, tenant_id, id).await
    }

    pub async fn save_migration(&self, m: &EntityMigration) -> Result<(), AppError> {
        self.put(MetaKind::Migration, &m.tenant_id, m.id, Some(m.entity_id), Vec::new(), m)
            .await
    }

    // snapshots

    /// Current working definition of an entity: its fields, indexes, the relationships touching it,
    /// and summaries of the entities on their other side.
    pub async fn working_snapshot(&self, tenant_id: &str, entity: &EntityDefinition) -> Result<EntitySnapshot, AppError> {
        let fields = self.fields(tenant_id, entity.id).await?;
        let indexes = self.indexes(tenant_id, entity.id).await?;
        let relationships = self.relationships_of(tenant_id, entity.id).await?;

        let mut other_ids: BTreeSet<Uuid> = fields.iter().filter_map(|f| f.reference_entity_id()).collect();
        for r in &relationships {
            other_ids.insert(r.source_entity_id);
            other_ids.insert(r.target_entity_id);
        }
        other_ids.remove(&entity.id);
        let mut related = Vec::with_capacity(other_ids.len());
        for id in other_ids {
            let other = self.require_entity(tenant_id, id).await?;
            related.push(RelatedEntity {
                id: other.id,
                name: other.name,
                table_name: other.table_name,
                display_field: other.display_field,
                soft_delete: other.soft_delete,
            });
        }
        Ok(EntitySnapshot {
            entity: entity.clone(),
            fields,
            indexes,
            relationships,
            related,
        })
    }

    /// Snapshot stored by the entity's live published version, if any.
    pub async fn published_snapshot(&self, entity: &EntityDefinition) -> Result<Option<SchemaVersion>, AppError> {
        match entity.published_version_id {
            Some(vid) => {
                let v = self.version(&entity.tenant_id, vid).await?.ok_or_else(|| {
                    AppError::Internal(format!("version {} of entity {} is missing", vid, entity.id))
                })?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
}

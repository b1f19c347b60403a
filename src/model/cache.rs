//! Descriptor cache shared by the query and CRUD layers.
//!
//! Entries are keyed by (tenant, entity) and stamped with the published version id they were
//! built from. A publish changes the entity's version id, so the next lookup builds a new
//! descriptor and swaps it in; readers holding the previous `Arc` keep using it. Concurrent
//! lookups for the same version share one build.

use crate::error::AppError;
use crate::model::descriptor::ModelDescriptor;
use crate::schema::{Catalog, EntityDefinition};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use uuid::Uuid;

type Key = (String, Uuid);
type Flight = Arc<OnceCell<Arc<ModelDescriptor>>>;

struct Entry {
    descriptor: Arc<ModelDescriptor>,
    loaded_at: Instant,
    fresh: bool,
}

pub struct ModelCache {
    catalog: Catalog,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<Key, Entry>>,
    inflight: Mutex<HashMap<(Key, Uuid), Flight>>,
    unusable: Mutex<HashSet<Key>>,
    builds: AtomicU64,
}

impl ModelCache {
    pub fn new(catalog: Catalog, ttl: Option<Duration>) -> Self {
        ModelCache {
            catalog,
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            unusable: Mutex::new(HashSet::new()),
            builds: AtomicU64::new(0),
        }
    }

    /// Descriptor of the entity's live published version.
    ///
    /// When a build fails the entity is marked unusable for writes and the last descriptor that
    /// was built for it, if any, keeps serving reads.
    pub async fn get(&self, entity: &EntityDefinition) -> Result<Arc<ModelDescriptor>, AppError> {
        let key: Key = (entity.tenant_id.clone(), entity.id);
        let vid = match entity.published_version_id {
            Some(vid) if !entity.is_deleted() => vid,
            _ => return Err(AppError::NotFound(format!("entity '{}' is not published", entity.name))),
        };
        if let Some(d) = self.cached(&key, vid) {
            return Ok(d);
        }

        let flight = {
            let mut inflight = lock(&self.inflight);
            inflight.entry((key.clone(), vid)).or_default().clone()
        };
        let result = flight
            .get_or_try_init(|| self.build(&entity.tenant_id, vid))
            .await
            .cloned();
        {
            let mut inflight = lock(&self.inflight);
            if inflight.get(&(key.clone(), vid)).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                inflight.remove(&(key.clone(), vid));
            }
        }

        match result {
            Ok(descriptor) => {
                // a write block set by an earlier failure stays until `recover`
                self.install(key, descriptor.clone());
                Ok(descriptor)
            }
            Err(e) => {
                tracing::error!(
                    tenant = %entity.tenant_id,
                    entity = %entity.name,
                    version_id = %vid,
                    error = %e,
                    "descriptor build failed; entity marked unusable for writes"
                );
                lock(&self.unusable).insert(key.clone());
                let last_good = read(&self.entries).get(&key).map(|e| e.descriptor.clone());
                last_good.ok_or(e)
            }
        }
    }

    fn cached(&self, key: &Key, vid: Uuid) -> Option<Arc<ModelDescriptor>> {
        let entries = read(&self.entries);
        let entry = entries.get(key)?;
        let expired = self.ttl.is_some_and(|ttl| entry.loaded_at.elapsed() > ttl);
        (entry.fresh && !expired && entry.descriptor.version_id == vid).then(|| entry.descriptor.clone())
    }

    fn install(&self, key: Key, descriptor: Arc<ModelDescriptor>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key,
            Entry {
                descriptor,
                loaded_at: Instant::now(),
                fresh: true,
            },
        );
    }

    async fn build(&self, tenant_id: &str, version_id: Uuid) -> Result<Arc<ModelDescriptor>, AppError> {
        self.builds.fetch_add(1, Ordering::Relaxed);
        let version = self
            .catalog
            .version(tenant_id, version_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("published version {} is missing", version_id)))?;
        let descriptor = ModelDescriptor::build(&version)?;
        tracing::debug!(tenant = %tenant_id, entity = %descriptor.name, version = descriptor.version, "descriptor built");
        Ok(Arc::new(descriptor))
    }

    /// Force the next lookup to rebuild. The current descriptor stays as last-known-good.
    pub fn invalidate(&self, tenant_id: &str, entity_id: Uuid) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = entries.get_mut(&(tenant_id.to_string(), entity_id)) {
            e.fresh = false;
        }
    }

    pub fn is_writable(&self, tenant_id: &str, entity_id: Uuid) -> bool {
        !lock(&self.unusable).contains(&(tenant_id.to_string(), entity_id))
    }

    /// Operator reset after a build failure.
    pub fn recover(&self, tenant_id: &str, entity_id: Uuid) {
        lock(&self.unusable).remove(&(tenant_id.to_string(), entity_id));
        self.invalidate(tenant_id, entity_id);
    }

    /// Number of descriptor builds started since creation.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn read<T>(m: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySnapshot, EntityStatus, SchemaVersion};
    use crate::store::MemoryMetadataStore;
    use chrono::Utc;

    async fn published(catalog: &Catalog) -> EntityDefinition {
        let now = Utc::now();
        let vid = Uuid::new_v4();
        let entity = EntityDefinition {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            name: "customer".into(),
            label: "Customer".into(),
            table_name: "customer".into(),
            status: EntityStatus::Published,
            version: 1,
            soft_delete: false,
            display_field: None,
            published_version_id: Some(vid),
            draft: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        catalog
            .save_version(&SchemaVersion {
                id: vid,
                entity_id: entity.id,
                tenant_id: "acme".into(),
                version: 1,
                parent_version_id: None,
                snapshot: EntitySnapshot {
                    entity: entity.clone(),
                    fields: Vec::new(),
                    indexes: Vec::new(),
                    relationships: Vec::new(),
                    related: Vec::new(),
                },
                created_at: now,
            })
            .await
            .unwrap();
        entity
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_build() {
        let catalog = Catalog::new(Arc::new(MemoryMetadataStore::new()));
        let entity = published(&catalog).await;
        let cache = Arc::new(ModelCache::new(catalog, None));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let entity = entity.clone();
            tasks.push(tokio::spawn(async move { cache.get(&entity).await.map(|d| d.version_id) }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), entity.published_version_id.unwrap());
        }
        assert_eq!(cache.builds(), 1);
        cache.get(&entity).await.unwrap();
        assert_eq!(cache.builds(), 1);
    }

    #[tokio::test]
    async fn unpublished_entity_is_not_found() {
        let catalog = Catalog::new(Arc::new(MemoryMetadataStore::new()));
        let mut entity = published(&catalog).await;
        entity.published_version_id = None;
        entity.status = EntityStatus::Draft;
        let cache = ModelCache::new(catalog, None);
        assert!(matches!(cache.get(&entity).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_build_blocks_writes_until_recovered() {
        let catalog = Catalog::new(Arc::new(MemoryMetadataStore::new()));
        let mut entity = published(&catalog).await;
        let cache = ModelCache::new(catalog, None);
        let good = cache.get(&entity).await.unwrap();

        entity.published_version_id = Some(Uuid::new_v4());
        let served = cache.get(&entity).await.unwrap();
        assert_eq!(served.version_id, good.version_id);
        assert!(!cache.is_writable("acme", entity.id));

        cache.recover("acme", entity.id);
        assert!(cache.is_writable("acme", entity.id));
    }

    #[tokio::test]
    async fn later_successful_read_keeps_writes_blocked() {
        let catalog = Catalog::new(Arc::new(MemoryMetadataStore::new()));
        let mut entity = published(&catalog).await;
        let cache = ModelCache::new(catalog.clone(), None);
        let good_vid = entity.published_version_id;

        entity.published_version_id = Some(Uuid::new_v4());
        assert!(cache.get(&entity).await.is_err());
        assert!(!cache.is_writable("acme", entity.id));

        entity.published_version_id = good_vid;
        cache.get(&entity).await.unwrap();
        assert!(!cache.is_writable("acme", entity.id));

        cache.recover("acme", entity.id);
        cache.get(&entity).await.unwrap();
        assert!(cache.is_writable("acme", entity.id));
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let catalog = Catalog::new(Arc::new(MemoryMetadataStore::new()));
        let entity = published(&catalog).await;
        let cache = ModelCache::new(catalog, None);
        cache.get(&entity).await.unwrap();
        cache.invalidate("acme", entity.id);
        cache.get(&entity).await.unwrap();
        assert_eq!(cache.builds(), 2);
    }
}

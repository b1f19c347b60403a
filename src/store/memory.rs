//! In-process metadata store used by the development server and tests.

use super::{duplicate_key, MetaKind, MetaRecord, MetadataStore};
use crate::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type RecordKey = (MetaKind, String, String);

#[derive(Default)]
struct Inner {
    records: BTreeMap<RecordKey, MetaRecord>,
    /// (tenant, unique key) -> owning record.
    keys: HashMap<(String, String), RecordKey>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> AppError {
    AppError::Internal("metadata store lock poisoned".into())
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, kind: MetaKind, tenant_id: &str, record: MetaRecord) -> Result<(), AppError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let rk: RecordKey = (kind, tenant_id.to_string(), record.id.clone());
        for key in &record.unique_keys {
            if let Some(owner) = inner.keys.get(&(tenant_id.to_string(), key.clone())) {
                if *owner != rk {
                    return Err(duplicate_key(key));
                }
            }
        }
        if let Some(old) = inner.records.get(&rk) {
            let stale: Vec<String> = old.unique_keys.clone();
            for key in stale {
                inner.keys.remove(&(tenant_id.to_string(), key));
            }
        }
        for key in &record.unique_keys {
            inner
                .keys
                .insert((tenant_id.to_string(), key.clone()), rk.clone());
        }
        inner.records.insert(rk, record);
        Ok(())
    }

    async fn get(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<Option<Value>, AppError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .records
            .get(&(kind, tenant_id.to_string(), id.to_string()))
            .map(|r| r.payload.clone()))
    }

    async fn list(&self, kind: MetaKind, tenant_id: &str, parent_id: Option<&str>) -> Result<Vec<Value>, AppError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .records
            .iter()
            .filter(|((k, t, _), r)| {
                *k == kind && t == tenant_id && parent_id.map_or(true, |p| r.parent_id.as_deref() == Some(p))
            })
            .map(|(_, r)| r.payload.clone())
            .collect())
    }

    async fn find_by_key(&self, kind: MetaKind, tenant_id: &str, key: &str) -> Result<Option<Value>, AppError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .keys
            .get(&(tenant_id.to_string(), key.to_string()))
            .filter(|owner| owner.0 == kind)
            .and_then(|owner| inner.records.get(owner))
            .map(|r| r.payload.clone()))
    }

    async fn remove(&self, kind: MetaKind, tenant_id: &str, id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let Some(old) = inner.records.remove(&(kind, tenant_id.to_string(), id.to_string())) else {
            return Ok(false);
        };
        for key in old.unique_keys {
            inner.keys.remove(&(tenant_id.to_string(), key));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: &str, keys: &[&str]) -> MetaRecord {
        MetaRecord {
            id: id.into(),
            parent_id: Some("p".into()),
            unique_keys: keys.iter().map(|k| k.to_string()).collect(),
            payload: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn unique_keys_are_per_tenant() {
        let store = MemoryMetadataStore::new();
        store.put(MetaKind::Entity, "a", rec("1", &["table:customers"])).await.unwrap();
        let err = store
            .put(MetaKind::Entity, "a", rec("2", &["table:customers"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        store.put(MetaKind::Entity, "b", rec("2", &["table:customers"])).await.unwrap();
        // re-putting the owner with the same key is fine
        store.put(MetaKind::Entity, "a", rec("1", &["table:customers"])).await.unwrap();
    }

    #[tokio::test]
    async fn remove_releases_keys() {
        let store = MemoryMetadataStore::new();
        store.put(MetaKind::Field, "a", rec("1", &["field:x"])).await.unwrap();
        assert!(store.remove(MetaKind::Field, "a", "1").await.unwrap());
        assert!(!store.remove(MetaKind::Field, "a", "1").await.unwrap());
        store.put(MetaKind::Field, "a", rec("2", &["field:x"])).await.unwrap();
        assert_eq!(store.list(MetaKind::Field, "a", Some("p")).await.unwrap().len(), 1);
        assert!(store.list(MetaKind::Field, "a", Some("q")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn records_are_found_by_unique_key() {
        let store = MemoryMetadataStore::new();
        store.put(MetaKind::Entity, "a", rec("1", &["entity:customer"])).await.unwrap();
        let found = store.find_by_key(MetaKind::Entity, "a", "entity:customer").await.unwrap();
        assert_eq!(found, Some(json!({ "id": "1" })));
        assert!(store.find_by_key(MetaKind::Field, "a", "entity:customer").await.unwrap().is_none());
        assert!(store.find_by_key(MetaKind::Entity, "b", "entity:customer").await.unwrap().is_none());

        store.put(MetaKind::Entity, "a", rec("1", &["entity:client"])).await.unwrap();
        assert!(store.find_by_key(MetaKind::Entity, "a", "entity:customer").await.unwrap().is_none());
        assert!(store.find_by_key(MetaKind::Entity, "a", "entity:client").await.unwrap().is_some());
    }
}

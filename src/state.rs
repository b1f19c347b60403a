//! Shared application state: the services behind every route, wired to one backend.

use crate::data::{MemoryRecordStore, PgRecordStore, RecordStore};
use crate::error::AppError;
use crate::migration::{EntityLocks, MigrationService};
use crate::model::ModelCache;
use crate::schema::{Catalog, SchemaRegistry};
use crate::service::{
    AccessControl, AllowAll, AuditLog, AuditSink, CrudLimits, CrudService, EventBus, PgAuditSink, StaticAccessControl,
    TracingAuditSink,
};
use crate::settings::Settings;
use crate::store::{ensure_database_exists, ensure_sys_tables, MemoryMetadataStore, MetadataStore, PgMetadataStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<SchemaRegistry>,
    pub migrations: Arc<MigrationService>,
    pub crud: Arc<CrudService>,
    pub models: Arc<ModelCache>,
    pub records: Arc<dyn RecordStore>,
    pub access: Arc<dyn AccessControl>,
    pub audit: AuditLog,
    pub events: EventBus,
}

impl AppState {
    /// Wire services over the given stores. Spawns the audit writer, so call inside a runtime.
    pub fn new(
        settings: Settings,
        metadata: Arc<dyn MetadataStore>,
        records: Arc<dyn RecordStore>,
        access: Arc<dyn AccessControl>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let catalog = Catalog::new(metadata);
        let locks = Arc::new(EntityLocks::default());
        let models = Arc::new(ModelCache::new(catalog.clone(), settings.model_ttl));
        let (audit, _writer) = AuditLog::start(audit_sink, settings.audit_queue_capacity);
        let events = EventBus::default();
        let migrations = MigrationService::new(
            catalog.clone(),
            records.clone(),
            models.clone(),
            locks.clone(),
            audit.clone(),
            events.clone(),
            settings.migration_timeout,
        );
        let crud = CrudService::new(
            catalog.clone(),
            models.clone(),
            records.clone(),
            access.clone(),
            audit.clone(),
            events.clone(),
            CrudLimits::from(&settings),
        );
        AppState {
            settings: Arc::new(settings),
            registry: Arc::new(SchemaRegistry::new(catalog, locks)),
            migrations: Arc::new(migrations),
            crud: Arc::new(crud),
            models,
            records,
            access,
            audit,
            events,
        }
    }

    /// In-memory backends with every permission granted and audit to tracing.
    pub fn in_memory(settings: Settings) -> Self {
        AppState::new(
            settings,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(AllowAll),
            Arc::new(TracingAuditSink),
        )
    }

    /// PostgreSQL when `database_url` is set, in-memory otherwise. The role policy file is loaded
    /// when configured; without one every permission is granted.
    pub async fn from_settings(settings: Settings) -> Result<Self, AppError> {
        let access: Arc<dyn AccessControl> = match &settings.policy_path {
            Some(path) => Arc::new(StaticAccessControl::from_path(path)?),
            None => Arc::new(AllowAll),
        };
        let Some(url) = settings.database_url.clone() else {
            tracing::warn!("DATABASE_URL not set; using in-memory storage");
            return Ok(AppState::in_memory(settings).with_access(access));
        };
        ensure_database_exists(&url).await?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await?;
        ensure_sys_tables(&pool, &settings.metadata_schema).await?;
        let metadata = Arc::new(PgMetadataStore::new(pool.clone(), settings.metadata_schema.clone()));
        let audit_sink = Arc::new(PgAuditSink::new(pool.clone(), &settings.metadata_schema));
        Ok(AppState::new(
            settings,
            metadata,
            Arc::new(PgRecordStore::new(pool)),
            access,
            audit_sink,
        ))
    }

    fn rebuild_crud(&mut self) {
        self.crud = Arc::new(CrudService::new(
            self.registry.catalog().clone(),
            self.models.clone(),
            self.records.clone(),
            self.access.clone(),
            self.audit.clone(),
            self.events.clone(),
            CrudLimits::from(self.settings.as_ref()),
        ));
    }

    /// Replace the access policy, e.g. in tests.
    pub fn with_access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self.rebuild_crud();
        self
    }
}

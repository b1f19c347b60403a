//! SchemaForge: user-defined entities, generated reversible migrations and dynamic CRUD.
//!
//! Metadata is edited through the [`schema::SchemaRegistry`], turned into physical tables by the
//! [`migration::MigrationService`], compiled into cached [`model::ModelDescriptor`]s and served by
//! the [`service::CrudService`]. [`routes::app`] exposes all of it over HTTP.

pub mod data;
pub mod error;
pub mod expr;
pub mod extractors;
pub mod handlers;
pub mod migration;
pub mod model;
pub mod query;
pub mod response;
pub mod routes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;
pub mod store;
pub mod tenant;

pub use data::{MemoryRecordStore, PgRecordStore, RecordStore};
pub use error::{AppError, ConfigError};
pub use migration::{MigrationService, PublishOutcome};
pub use model::{ModelCache, ModelDescriptor};
pub use response::{success_many, success_one};
pub use routes::app;
pub use schema::{Catalog, SchemaRegistry};
pub use service::{AccessControl, CrudService, RequestContext};
pub use settings::Settings;
pub use state::AppState;
pub use store::{ensure_database_exists, ensure_sys_tables, MemoryMetadataStore, MetadataStore, PgMetadataStore};

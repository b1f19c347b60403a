//! CRUD execution over published entities, plus the access, audit and event collaborators.

pub mod access;
pub mod audit;
mod crud;
pub mod events;
mod validation;

pub use access::{AccessControl, AllowAll, FieldAccess, RequestContext, StaticAccessControl};
pub use audit::{AuditLog, AuditRecord, AuditSink, MemoryAuditSink, PgAuditSink, TracingAuditSink};
pub use crud::{BulkItemResult, BulkResult, CrudLimits, CrudService, ListPage};
pub use events::{DomainEvent, EventBus, RecordEvent, RecordEventType};
pub use validation::{validate_create, validate_update};

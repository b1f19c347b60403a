//! Schema registry: entity, field, relationship and index metadata.

pub mod catalog;
pub mod registry;
pub mod types;
pub mod validator;

pub use catalog::Catalog;
pub use registry::SchemaRegistry;
pub use types::*;

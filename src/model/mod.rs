//! Runtime model generator and descriptor cache.

pub mod cache;
pub mod descriptor;

pub use cache::ModelCache;
pub use descriptor::{
    Cardinality, FieldModel, JoinPath, ModelDescriptor, Record, RelationModel, SchemaProjection,
};

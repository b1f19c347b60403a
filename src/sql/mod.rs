//! PostgreSQL rendering: identifiers from validated metadata only, values as parameters.

mod builder;
pub mod params;
pub use builder::*;
pub use params::*;

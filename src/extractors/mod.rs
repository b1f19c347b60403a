//! Axum extractors.

mod json;
mod tenant;

pub use json::JsonBody;
pub use tenant::{DEFAULT_ROLE, DEFAULT_USER, TENANT_ID_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};

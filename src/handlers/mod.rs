//! HTTP handlers for the schema registry, entity lifecycle and runtime records.

pub mod migration;
pub mod records;
pub mod schema;

use crate::error::AppError;
use uuid::Uuid;

pub(crate) fn parse_id(id_str: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id_str).map_err(|_| AppError::BadRequest(format!("invalid uuid: {}", id_str)))
}

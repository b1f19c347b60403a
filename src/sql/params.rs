//! Bind values for PostgreSQL. Everything is sent as text and cast by the placeholder
//! (`$1::numeric`), so one bind type covers every column type.

use crate::error::AppError;
use crate::migration::storage::StorageType;
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

#[derive(Clone, Debug, PartialEq)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Uuid(uuid::Uuid),
    Json(Value),
}

impl PgBindValue {
    /// Convert a normalized value for a column of `storage`.
    pub fn for_storage(storage: &StorageType, v: &Value) -> Result<Self, AppError> {
        if v.is_null() {
            return Ok(PgBindValue::Null);
        }
        let mismatch = || AppError::Internal(format!("value {} does not match column type {}", v, storage));
        Ok(match storage {
            StorageType::Jsonb => PgBindValue::Json(v.clone()),
            StorageType::Boolean => PgBindValue::Bool(v.as_bool().ok_or_else(mismatch)?),
            StorageType::BigInt => PgBindValue::I64(v.as_i64().ok_or_else(mismatch)?),
            StorageType::Numeric { .. } => PgBindValue::F64(v.as_f64().ok_or_else(mismatch)?),
            StorageType::Uuid => {
                PgBindValue::Uuid(uuid::Uuid::parse_str(v.as_str().ok_or_else(mismatch)?).map_err(|_| mismatch())?)
            }
            StorageType::Varchar { .. }
            | StorageType::Text
            | StorageType::Date
            | StorageType::Timestamptz => match v {
                Value::String(s) => PgBindValue::String(s.clone()),
                other => PgBindValue::String(other.to_string()),
            },
        })
    }

    pub fn text(&self) -> Option<String> {
        match self {
            PgBindValue::Null => None,
            PgBindValue::Bool(b) => Some(b.to_string()),
            PgBindValue::I64(n) => Some(n.to_string()),
            PgBindValue::F64(n) => Some(n.to_string()),
            PgBindValue::String(s) => Some(s.clone()),
            PgBindValue::Uuid(u) => Some(u.to_string()),
            PgBindValue::Json(v) => Some(v.to_string()),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        match self.text() {
            None => <Option<&str> as Encode<Postgres>>::encode_by_ref(&None, buf),
            Some(s) => <&str as Encode<Postgres>>::encode_by_ref(&s.as_str(), buf),
        }
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_decides_bind_form() {
        assert_eq!(
            PgBindValue::for_storage(&StorageType::Jsonb, &json!("x")).unwrap().text().as_deref(),
            Some("\"x\"")
        );
        assert_eq!(
            PgBindValue::for_storage(&StorageType::Numeric { precision: 10, scale: 2 }, &json!(2)).unwrap(),
            PgBindValue::F64(2.0)
        );
        assert_eq!(PgBindValue::for_storage(&StorageType::Text, &Value::Null).unwrap(), PgBindValue::Null);
        assert!(PgBindValue::for_storage(&StorageType::BigInt, &json!("x")).is_err());
    }
}

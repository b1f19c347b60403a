//! Abstract field type to PostgreSQL storage type. The match in [`StorageType::for_field`] is the
//! single lookup table; adding a `FieldType` variant fails to compile until it is mapped here.

use crate::schema::types::{FieldConstraints, FieldType};
use crate::schema::validator::DEFAULT_STRING_LENGTH;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const EMAIL_LENGTH: u32 = 320;
pub const URL_LENGTH: u32 = 2048;
pub const SELECT_LENGTH: u32 = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageType {
    Varchar { length: u32 },
    Text,
    BigInt,
    Numeric { precision: u8, scale: u8 },
    Boolean,
    Date,
    Timestamptz,
    Jsonb,
    Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    Character,
    Number,
    Boolean,
    Date,
    Timestamp,
    Json,
    Uuid,
}

impl StorageType {
    /// `None` for fields without a column (calculated).
    pub fn for_field(field_type: &FieldType, constraints: &FieldConstraints) -> Option<StorageType> {
        Some(match field_type {
            FieldType::String => StorageType::Varchar {
                length: constraints.max_length.unwrap_or(DEFAULT_STRING_LENGTH),
            },
            FieldType::Text => StorageType::Text,
            FieldType::Integer => StorageType::BigInt,
            FieldType::Decimal { precision, scale } => StorageType::Numeric {
                precision: *precision,
                scale: *scale,
            },
            FieldType::Boolean => StorageType::Boolean,
            FieldType::Date => StorageType::Date,
            FieldType::DateTime => StorageType::Timestamptz,
            FieldType::Json => StorageType::Jsonb,
            FieldType::Uuid => StorageType::Uuid,
            FieldType::Email => StorageType::Varchar { length: EMAIL_LENGTH },
            FieldType::Url => StorageType::Varchar { length: URL_LENGTH },
            FieldType::Select { .. } => StorageType::Varchar { length: SELECT_LENGTH },
            FieldType::Reference { .. } => StorageType::Uuid,
            FieldType::Calculated { .. } => return None,
        })
    }

    /// Column type as written in DDL.
    pub fn sql(&self) -> String {
        match self {
            StorageType::Varchar { length } => format!("varchar({})", length),
            StorageType::Numeric { precision, scale } => format!("numeric({},{})", precision, scale),
            other => other.cast().to_string(),
        }
    }

    /// Unparameterized type used for placeholder casts (`$1::numeric`).
    pub fn cast(&self) -> &'static str {
        match self {
            StorageType::Varchar { .. } => "varchar",
            StorageType::Text => "text",
            StorageType::BigInt => "bigint",
            StorageType::Numeric { .. } => "numeric",
            StorageType::Boolean => "boolean",
            StorageType::Date => "date",
            StorageType::Timestamptz => "timestamptz",
            StorageType::Jsonb => "jsonb",
            StorageType::Uuid => "uuid",
        }
    }

    fn family(&self) -> Family {
        match self {
            StorageType::Varchar { .. } | StorageType::Text => Family::Character,
            StorageType::BigInt | StorageType::Numeric { .. } => Family::Number,
            StorageType::Boolean => Family::Boolean,
            StorageType::Date => Family::Date,
            StorageType::Timestamptz => Family::Timestamp,
            StorageType::Jsonb => Family::Json,
            StorageType::Uuid => Family::Uuid,
        }
    }

    /// Same family: the database can convert implicitly and no `USING` clause is needed.
    pub fn same_family(&self, other: &StorageType) -> bool {
        self.family() == other.family()
    }

    /// Every value of `self` is representable in `other` without loss.
    pub fn widens_to(&self, other: &StorageType) -> bool {
        use StorageType::*;
        match (self, other) {
            (a, b) if a == b => true,
            (Varchar { length: a }, Varchar { length: b }) => b >= a,
            (Varchar { .. }, Text) => true,
            (Numeric { precision: p1, scale: s1 }, Numeric { precision: p2, scale: s2 }) => {
                s2 >= s1 && (i32::from(*p2) - i32::from(*s2)) >= (i32::from(*p1) - i32::from(*s1))
            }
            // i64 needs 19 integer digits
            (BigInt, Numeric { precision, scale }) => i32::from(*precision) - i32::from(*scale) >= 19,
            (Date, Timestamptz) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

//! Metadata validation: identifiers, type-specific constraint sanity, and value type checks shared with the CRUD layer.

use crate::error::AppError;
use crate::expr;
use crate::schema::types::*;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

pub const MAX_IDENTIFIER_LEN: usize = 48;
pub const MAX_STRING_LENGTH: u32 = 10_485_760;
pub const DEFAULT_STRING_LENGTH: u32 = 255;

/// Columns every entity table carries; user fields may not reuse these names.
pub const SYSTEM_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "created_at",
    "created_by",
    "updated_at",
    "updated_by",
    "deleted_at",
    "deleted_by",
];

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("static regex"))
}

/// Lowercase, starts with a letter, then letters, digits or underscores.
pub fn is_identifier(s: &str) -> bool {
    s.len() <= MAX_IDENTIFIER_LEN && identifier_re().is_match(s)
}

pub fn validate_identifier(path: &str, value: &str) -> Result<(), AppError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(AppError::field(
            path,
            format!(
                "'{}' is not a valid identifier (lowercase letter, then [a-z0-9_], at most {} chars)",
                value, MAX_IDENTIFIER_LEN
            ),
        ))
    }
}

pub fn is_system_field(name: &str) -> bool {
    SYSTEM_FIELDS.contains(&name)
}

/// Validate one field definition against its siblings.
/// `siblings` holds the other stored fields of the entity (excluding this one).
pub fn validate_field(field: &FieldDefinition, siblings: &[FieldDefinition]) -> Result<(), AppError> {
    validate_identifier("name", &field.name)?;
    if is_system_field(&field.name) {
        return Err(AppError::field("name", format!("'{}' is a reserved system field", field.name)));
    }
    if siblings.iter().any(|s| s.name == field.name) {
        return Err(AppError::field("name", format!("field '{}' already exists", field.name)));
    }

    let c = &field.constraints;
    match &field.field_type {
        FieldType::Decimal { precision, scale } => {
            if *precision == 0 || *precision > 38 {
                return Err(AppError::field("field_type.precision", "must be between 1 and 38"));
            }
            if scale > precision {
                return Err(AppError::field("field_type.scale", "must not exceed precision"));
            }
        }
        FieldType::Select { options } => {
            if options.is_empty() {
                return Err(AppError::field("field_type.options", "select needs at least one option"));
            }
            let mut seen = HashSet::new();
            for o in options {
                if o.is_empty() || !seen.insert(o.as_str()) {
                    return Err(AppError::field(
                        "field_type.options",
                        format!("options must be non-empty and distinct ('{}')", o),
                    ));
                }
            }
        }
        FieldType::Calculated { expression } => {
            if c.required || c.unique || c.indexed || c.searchable {
                return Err(AppError::field(
                    "constraints",
                    "calculated fields cannot be required, unique, indexed or searchable",
                ));
            }
            if field.default_value.is_some() {
                return Err(AppError::field("default_value", "calculated fields have no default"));
            }
            let parsed = expr::parse(expression)
                .map_err(|e| AppError::field("field_type.expression", e.to_string()))?;
            let known = stored_field_names(siblings);
            for name in parsed.fields() {
                if name == field.name || !known.contains(&name) {
                    return Err(AppError::field(
                        "field_type.expression",
                        format!("unknown field '{}' in expression", name),
                    ));
                }
            }
        }
        FieldType::Json => {
            if c.unique || c.indexed || c.searchable {
                return Err(AppError::field("constraints", "json fields cannot be unique, indexed or searchable"));
            }
        }
        _ => {}
    }

    if c.min_length.is_some() || c.max_length.is_some() {
        if !field.field_type.is_textual() {
            return Err(AppError::field(
                "constraints",
                format!("min_length/max_length do not apply to {} fields", field.field_type.name()),
            ));
        }
        if c.max_length == Some(0) || c.max_length.map(|m| m > MAX_STRING_LENGTH).unwrap_or(false) {
            return Err(AppError::field(
                "constraints.max_length",
                format!("must be between 1 and {}", MAX_STRING_LENGTH),
            ));
        }
        if let (Some(min), Some(max)) = (c.min_length, c.max_length) {
            if min > max {
                return Err(AppError::field("constraints.min_length", "must not exceed max_length"));
            }
        }
    }
    if c.min_value.is_some() || c.max_value.is_some() {
        if !field.field_type.is_numeric() {
            return Err(AppError::field(
                "constraints",
                format!("min_value/max_value do not apply to {} fields", field.field_type.name()),
            ));
        }
        if let (Some(min), Some(max)) = (c.min_value, c.max_value) {
            if min > max {
                return Err(AppError::field("constraints.min_value", "must not exceed max_value"));
            }
        }
    }
    if c.searchable && !field.field_type.is_textual() {
        return Err(AppError::field("constraints.searchable", "only text-like fields are searchable"));
    }

    if let Some(default) = &field.default_value {
        if !default.is_null() {
            check_value(&field.field_type, c, default)
                .map_err(|m| AppError::field("default_value", m))?;
        }
    }

    let mut known = stored_field_names(siblings);
    known.insert(field.name.clone());
    validate_rules(&field.validation_rules, &known)
}

fn stored_field_names(fields: &[FieldDefinition]) -> BTreeSet<String> {
    fields
        .iter()
        .filter(|f| f.field_type.is_stored())
        .map(|f| f.name.clone())
        .chain(SYSTEM_FIELDS.iter().map(|s| s.to_string()))
        .collect()
}

pub fn validate_rules(rules: &[ValidationRule], known_fields: &BTreeSet<String>) -> Result<(), AppError> {
    for (i, rule) in rules.iter().enumerate() {
        let path = format!("validation_rules[{}]", i);
        match rule {
            ValidationRule::Regex { pattern, .. } => {
                Regex::new(pattern).map_err(|e| AppError::field(&path, format!("invalid regex: {}", e)))?;
            }
            ValidationRule::Range { min, max, .. } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(AppError::field(path, "min must not exceed max"));
                    }
                }
            }
            ValidationRule::Length { min, max, .. } => {
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(AppError::field(path, "min must not exceed max"));
                    }
                }
            }
            ValidationRule::Expression { expression, .. } => {
                let parsed = expr::parse(expression).map_err(|e| AppError::field(&path, e.to_string()))?;
                for name in parsed.fields() {
                    if !known_fields.contains(&name) {
                        return Err(AppError::field(path, format!("unknown field '{}' in expression", name)));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Type and constraint check for a non-null value. Returns a human-readable reason on failure.
pub fn check_value(field_type: &FieldType, c: &FieldConstraints, v: &Value) -> Result<(), String> {
    match field_type {
        FieldType::String | FieldType::Text => {
            let s = v.as_str().ok_or("must be a string")?;
            check_length(s, c)?;
        }
        FieldType::Email => {
            let s = v.as_str().ok_or("must be a string")?;
            if !email_re().is_match(s) {
                return Err("must be a valid email".into());
            }
            check_length(s, c)?;
        }
        FieldType::Url => {
            let s = v.as_str().ok_or("must be a string")?;
            if !url_re().is_match(s) {
                return Err("must be an http(s) URL".into());
            }
            check_length(s, c)?;
        }
        FieldType::Select { options } => {
            let s = v.as_str().ok_or("must be a string")?;
            if !options.iter().any(|o| o == s) {
                return Err(format!("must be one of: {}", options.join(", ")));
            }
        }
        FieldType::Integer => {
            let n = v.as_i64().ok_or("must be an integer")?;
            check_range(n as f64, c)?;
        }
        FieldType::Decimal { precision, scale } => {
            let n = v.as_f64().ok_or("must be a number")?;
            let int_digits = i32::from(*precision) - i32::from(*scale);
            if n.abs() >= 10f64.powi(int_digits) {
                return Err(format!(
                    "must have at most {} digits before the decimal point",
                    int_digits
                ));
            }
            check_range(n, c)?;
        }
        FieldType::Boolean => {
            v.as_bool().ok_or("must be a boolean")?;
        }
        FieldType::Date => {
            let s = v.as_str().ok_or("must be a date string")?;
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| "must be a YYYY-MM-DD date")?;
        }
        FieldType::DateTime => {
            let s = v.as_str().ok_or("must be a datetime string")?;
            chrono::DateTime::parse_from_rfc3339(s).map_err(|_| "must be an RFC 3339 datetime")?;
        }
        FieldType::Json => {}
        FieldType::Uuid | FieldType::Reference { .. } => {
            let s = v.as_str().ok_or("must be a UUID string")?;
            uuid::Uuid::parse_str(s).map_err(|_| "must be a valid UUID")?;
        }
        FieldType::Calculated { .. } => return Err("is calculated and cannot be written".into()),
    }
    Ok(())
}

fn check_length(s: &str, c: &FieldConstraints) -> Result<(), String> {
    let len = s.chars().count() as u32;
    if let Some(max) = c.max_length {
        if len > max {
            return Err(format!("must be at most {} characters", max));
        }
    }
    if let Some(min) = c.min_length {
        if len < min {
            return Err(format!("must be at least {} characters", min));
        }
    }
    Ok(())
}

fn check_range(n: f64, c: &FieldConstraints) -> Result<(), String> {
    if let Some(min) = c.min_value {
        if n < min {
            return Err(format!("must be at least {}", min));
        }
    }
    if let Some(max) = c.max_value {
        if n > max {
            return Err(format!("must be at most {}", max));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn field(name: &str, field_type: FieldType) -> FieldDefinition {
        FieldDefinition {
            id: Uuid::new_v4(),
            entity_id: Uuid::nil(),
            tenant_id: "acme".into(),
            name: name.into(),
            label: name.into(),
            field_type,
            constraints: FieldConstraints::default(),
            default_value: None,
            validation_rules: Vec::new(),
            position: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("customer"));
        assert!(is_identifier("order_line2"));
        assert!(!is_identifier("Customer"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("_hidden"));
        assert!(!is_identifier("with-dash"));
        assert!(!is_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)));
    }

    #[test]
    fn rejects_system_and_duplicate_names() {
        let err = validate_field(&field("id", FieldType::String), &[]).unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        let existing = field("email", FieldType::Email);
        assert!(validate_field(&field("email", FieldType::String), &[existing]).is_err());
    }

    #[test]
    fn constraint_sanity() {
        let mut f = field("name", FieldType::String);
        f.constraints.max_length = Some(0);
        assert!(validate_field(&f, &[]).is_err());

        let mut f = field("age", FieldType::Integer);
        f.constraints.max_length = Some(10);
        assert!(validate_field(&f, &[]).is_err());

        let mut f = field("age", FieldType::Integer);
        f.constraints.min_value = Some(10.0);
        f.constraints.max_value = Some(1.0);
        assert!(validate_field(&f, &[]).is_err());

        let f = field("price", FieldType::Decimal { precision: 4, scale: 6 });
        assert!(validate_field(&f, &[]).is_err());

        let f = field("tier", FieldType::Select { options: vec![] });
        assert!(validate_field(&f, &[]).is_err());
    }

    #[test]
    fn default_must_type_check() {
        let mut f = field("tier", FieldType::Select { options: vec!["bronze".into(), "gold".into()] });
        f.default_value = Some(json!("platinum"));
        assert!(validate_field(&f, &[]).is_err());
        f.default_value = Some(json!("gold"));
        assert!(validate_field(&f, &[]).is_ok());
    }

    #[test]
    fn calculated_expression_must_reference_known_fields() {
        let qty = field("quantity", FieldType::Integer);
        let ok = field("total", FieldType::Calculated { expression: "quantity * 2".into() });
        assert!(validate_field(&ok, &[qty.clone()]).is_ok());
        let bad = field("total", FieldType::Calculated { expression: "missing * 2".into() });
        assert!(validate_field(&bad, &[qty]).is_err());
    }

    #[test]
    fn rules_are_checked_at_definition_time() {
        let mut f = field("code", FieldType::String);
        f.validation_rules = vec![ValidationRule::Regex {
            pattern: "([a-z".into(),
            message: None,
        }];
        assert!(validate_field(&f, &[]).is_err());
    }

    #[test]
    fn value_checks() {
        let c = FieldConstraints::default();
        assert!(check_value(&FieldType::Email, &c, &json!("ada@x.com")).is_ok());
        assert!(check_value(&FieldType::Email, &c, &json!("nope")).is_err());
        assert!(check_value(&FieldType::Integer, &c, &json!(1.5)).is_err());
        assert!(check_value(&FieldType::Date, &c, &json!("2024-02-30")).is_err());
        assert!(check_value(&FieldType::DateTime, &c, &json!("2024-02-01T10:00:00Z")).is_ok());
        assert!(check_value(&FieldType::Url, &c, &json!("https://example.com/a")).is_ok());
        let d = FieldType::Decimal { precision: 5, scale: 2 };
        assert!(check_value(&d, &c, &json!(999.99)).is_ok());
        assert!(check_value(&d, &c, &json!(1000.0)).is_err());
    }
}

//! Record validation against a model descriptor: types, constraints, then declared rules.

use crate::error::AppError;
use crate::model::descriptor::{normalize, CompiledRule, FieldModel};
use crate::model::{ModelDescriptor, Record};
use crate::schema::validator::{check_value, is_system_field};
use serde_json::Value;
use std::collections::BTreeSet;

/// Reject keys that are not writable stored fields. Link relations must be split off first.
fn check_keys(model: &ModelDescriptor, input: &Record) -> Result<(), AppError> {
    for key in input.keys() {
        if is_system_field(key) {
            return Err(AppError::field(key, "is managed by the system"));
        }
        match model.field(key) {
            None => return Err(AppError::field(key, "unknown field")),
            Some(f) if !f.is_stored() => return Err(AppError::field(key, "is calculated and cannot be written")),
            Some(_) => {}
        }
    }
    Ok(())
}

/// Normalized value after type and constraint checks.
fn check_field(f: &FieldModel, v: &Value) -> Result<Value, AppError> {
    let v = normalize(&f.field_type, v).map_err(|m| AppError::field(&f.name, m))?;
    if v.is_null() {
        if f.constraints.required {
            return Err(AppError::field(&f.name, "is required"));
        }
        return Ok(v);
    }
    check_value(&f.field_type, &f.constraints, &v).map_err(|m| AppError::field(&f.name, m))?;
    Ok(v)
}

fn check_rule(f: &FieldModel, rule: &CompiledRule, record: &Record) -> Result<(), AppError> {
    let v = record.get(&f.name).unwrap_or(&Value::Null);
    let fail = |message: &Option<String>, default: String| Err(AppError::field(&f.name, message.clone().unwrap_or(default)));
    match rule {
        CompiledRule::Regex { pattern, message } => match v.as_str() {
            Some(s) if !pattern.is_match(s) => fail(message, format!("must match {}", pattern.as_str())),
            _ => Ok(()),
        },
        CompiledRule::Range { min, max, message } => match v.as_f64() {
            Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => fail(
                message,
                match (min, max) {
                    (Some(a), Some(b)) => format!("must be between {} and {}", a, b),
                    (Some(a), None) => format!("must be at least {}", a),
                    (_, Some(b)) => format!("must be at most {}", b),
                    (None, None) => String::new(),
                },
            ),
            _ => Ok(()),
        },
        CompiledRule::Length { min, max, message } => {
            let len = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                _ => return Ok(()),
            };
            let len = u32::try_from(len).unwrap_or(u32::MAX);
            if min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m) {
                let bound = match (min, max) {
                    (Some(a), Some(b)) => format!("between {} and {}", a, b),
                    (Some(a), None) => format!("at least {}", a),
                    (_, Some(b)) => format!("at most {}", b),
                    (None, None) => String::new(),
                };
                return fail(message, format!("length must be {}", bound));
            }
            Ok(())
        }
        CompiledRule::Expression { expr, message, .. } => match expr.eval(record) {
            Ok(Value::Bool(false)) => fail(message, "failed validation rule".into()),
            Ok(_) => Ok(()),
            Err(e) => fail(message, format!("rule could not be evaluated: {}", e)),
        },
    }
}

/// Check a full record for insert. Absent fields take their default. Returns every stored field.
pub fn validate_create(model: &ModelDescriptor, input: &Record) -> Result<Record, AppError> {
    check_keys(model, input)?;
    let mut out = Record::new();
    for f in model.stored_fields() {
        let raw = match input.get(&f.name) {
            Some(v) => v.clone(),
            None => f.default_value.clone().unwrap_or(Value::Null),
        };
        out.insert(f.name.clone(), check_field(f, &raw)?);
    }
    for f in model.stored_fields() {
        if out.get(&f.name).map_or(true, Value::is_null) {
            continue;
        }
        for rule in &f.rules {
            check_rule(f, rule, &out)?;
        }
    }
    Ok(out)
}

/// Check a partial update against the current stored record. Only supplied fields are checked,
/// plus expression rules of other fields that read a supplied one. Returns the normalized changes.
pub fn validate_update(model: &ModelDescriptor, current: &Record, changes: &Record) -> Result<Record, AppError> {
    check_keys(model, changes)?;
    let mut out = Record::new();
    for (name, v) in changes {
        if let Some(f) = model.field(name) {
            out.insert(name.clone(), check_field(f, v)?);
        }
    }
    let mut merged = current.clone();
    merged.extend(out.clone());
    let supplied: BTreeSet<&str> = out.keys().map(String::as_str).collect();
    for f in model.stored_fields() {
        if merged.get(&f.name).map_or(true, Value::is_null) {
            continue;
        }
        let own = supplied.contains(f.name.as_str());
        for rule in &f.rules {
            let reads_supplied = match rule {
                CompiledRule::Expression { fields, .. } => fields.iter().any(|n| supplied.contains(n.as_str())),
                _ => false,
            };
            if own || reads_supplied {
                check_rule(f, rule, &merged)?;
            }
        }
    }
    Ok(out)
}

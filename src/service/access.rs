//! Caller identity and role-based access decisions.

use crate::error::{AppError, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;

pub const SCHEMA_MANAGE: &str = "schema.manage";

/// Who is calling, on behalf of which tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: String,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>, role: impl Into<String>) -> Self {
        RequestContext {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            role: role.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldAccess {
    #[default]
    Write,
    Read,
    Hidden,
}

impl FieldAccess {
    pub fn can_read(&self) -> bool {
        !matches!(self, FieldAccess::Hidden)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, FieldAccess::Write)
    }
}

pub trait AccessControl: Send + Sync {
    fn has_permission(&self, ctx: &RequestContext, permission: &str) -> bool;

    /// Visibility of one field of an entity for a role. Unlisted fields are writable.
    fn field_access(&self, role: &str, entity: &str, field: &str) -> FieldAccess;
}

pub fn require(access: &dyn AccessControl, ctx: &RequestContext, permission: &str) -> Result<(), AppError> {
    if access.has_permission(ctx, permission) {
        Ok(())
    } else {
        tracing::debug!(tenant = %ctx.tenant_id, user = %ctx.user_id, role = %ctx.role, permission, "permission denied");
        Err(AppError::Permission(format!("role '{}' lacks '{}'", ctx.role, permission)))
    }
}

pub struct AllowAll;

impl AccessControl for AllowAll {
    fn has_permission(&self, _ctx: &RequestContext, _permission: &str) -> bool {
        true
    }

    fn field_access(&self, _role: &str, _entity: &str, _field: &str) -> FieldAccess {
        FieldAccess::Write
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RolePolicy {
    /// Permission codes; `*` grants everything and `<entity>.*` every action on one entity.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// entity -> field -> access
    #[serde(default)]
    pub fields: HashMap<String, HashMap<String, FieldAccess>>,
}

/// In-process role policy, usually loaded from a JSON file:
/// `{"roles": {"user": {"permissions": ["customer.*"], "fields": {"customer": {"ssn": "hidden"}}}}}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StaticAccessControl {
    #[serde(default)]
    pub roles: HashMap<String, RolePolicy>,
}

impl StaticAccessControl {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
            name: "SCHEMAFORGE_POLICY",
            reason: e.to_string(),
        })
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            name: "SCHEMAFORGE_POLICY",
            reason: format!("{}: {}", path, e),
        })?;
        Self::from_json(&raw)
    }

    pub fn grant(mut self, role: &str, permission: &str) -> Self {
        self.roles
            .entry(role.to_string())
            .or_default()
            .permissions
            .push(permission.to_string());
        self
    }

    pub fn restrict(mut self, role: &str, entity: &str, field: &str, access: FieldAccess) -> Self {
        self.roles
            .entry(role.to_string())
            .or_default()
            .fields
            .entry(entity.to_string())
            .or_default()
            .insert(field.to_string(), access);
        self
    }
}

fn grants(held: &str, wanted: &str) -> bool {
    if held == "*" || held == wanted {
        return true;
    }
    match (held.strip_suffix(".*"), wanted.split_once('.')) {
        (Some(scope), Some((entity, _))) => scope == entity,
        _ => false,
    }
}

impl AccessControl for StaticAccessControl {
    fn has_permission(&self, ctx: &RequestContext, permission: &str) -> bool {
        self.roles
            .get(&ctx.role)
            .is_some_and(|p| p.permissions.iter().any(|h| grants(h, permission)))
    }

    fn field_access(&self, role: &str, entity: &str, field: &str) -> FieldAccess {
        self.roles
            .get(role)
            .and_then(|p| p.fields.get(entity))
            .and_then(|f| f.get(field))
            .copied()
            .unwrap_or_default()
    }
}

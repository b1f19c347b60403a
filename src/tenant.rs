//! Tenant identifiers and their physical isolation boundary.
//!
//! Every tenant's entity tables live in a dedicated PostgreSQL schema named
//! `t_<tenant_id>`; rows additionally carry a `tenant_id` column that every
//! generated query filters on.

use crate::error::AppError;
use regex::Regex;
use std::sync::OnceLock;

pub const MAX_TENANT_ID_LEN: usize = 48;

fn tenant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]{1,48}$").expect("static regex"))
}

/// Validate a tenant id: lowercase ascii letters, digits and underscores.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), AppError> {
    if tenant_re().is_match(tenant_id) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "invalid tenant id '{}' (expected [a-z0-9_]{{1,{}}})",
            tenant_id, MAX_TENANT_ID_LEN
        )))
    }
}

/// Physical schema holding a tenant's entity tables.
pub fn tenant_schema(tenant_id: &str) -> String {
    format!("t_{}", tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_ids() {
        assert!(validate_tenant_id("acme").is_ok());
        assert!(validate_tenant_id("tenant_42").is_ok());
        assert!(validate_tenant_id(&"a".repeat(MAX_TENANT_ID_LEN)).is_ok());
    }

    #[test]
    fn rejects_ids_that_could_escape_schema_names() {
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("Acme").is_err());
        assert!(validate_tenant_id("a\"b").is_err());
        assert!(validate_tenant_id("a-b").is_err());
        assert!(validate_tenant_id(&"a".repeat(49)).is_err());
        assert!(validate_tenant_id("acme\n").is_err());
    }

    #[test]
    fn schema_name_is_prefixed() {
        assert_eq!(tenant_schema("acme"), "t_acme");
    }
}

//! Runtime settings read from the environment.

use crate::error::ConfigError;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    /// PostgreSQL URL. `None` selects the in-memory backend.
    pub database_url: Option<String>,
    pub bind_addr: String,
    /// Schema holding the `_sys_*` metadata tables.
    pub metadata_schema: String,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub bulk_limit: usize,
    pub migration_timeout: Duration,
    pub bulk_timeout: Duration,
    pub audit_queue_capacity: usize,
    pub model_ttl: Option<Duration>,
    pub body_limit_bytes: usize,
    /// JSON role policy file; unset grants every permission.
    pub policy_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            bind_addr: "0.0.0.0:3000".into(),
            metadata_schema: "schemaforge".into(),
            default_page_size: 100,
            max_page_size: 1000,
            bulk_limit: 100,
            migration_timeout: Duration::from_secs(60),
            bulk_timeout: Duration::from_secs(30),
            audit_queue_capacity: 1024,
            model_ttl: None,
            body_limit_bytes: 2 * 1024 * 1024,
            policy_path: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Settings::default();
        let metadata_schema = std::env::var("SCHEMAFORGE_SCHEMA").unwrap_or(d.metadata_schema);
        if !crate::schema::validator::is_identifier(&metadata_schema) {
            return Err(ConfigError::Invalid {
                name: "SCHEMAFORGE_SCHEMA",
                reason: format!("'{}' is not a valid identifier", metadata_schema),
            });
        }
        let settings = Settings {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            bind_addr: std::env::var("SCHEMAFORGE_BIND").unwrap_or(d.bind_addr),
            metadata_schema,
            default_page_size: parse_var("SCHEMAFORGE_DEFAULT_PAGE_SIZE")?.unwrap_or(d.default_page_size),
            max_page_size: parse_var("SCHEMAFORGE_MAX_PAGE_SIZE")?.unwrap_or(d.max_page_size),
            bulk_limit: parse_var("SCHEMAFORGE_BULK_LIMIT")?.unwrap_or(d.bulk_limit),
            migration_timeout: parse_var("SCHEMAFORGE_MIGRATION_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.migration_timeout),
            bulk_timeout: parse_var("SCHEMAFORGE_BULK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.bulk_timeout),
            audit_queue_capacity: parse_var("SCHEMAFORGE_AUDIT_QUEUE")?.unwrap_or(d.audit_queue_capacity),
            model_ttl: parse_var("SCHEMAFORGE_MODEL_TTL_SECS")?.map(Duration::from_secs),
            body_limit_bytes: parse_var("SCHEMAFORGE_BODY_LIMIT_BYTES")?.unwrap_or(d.body_limit_bytes),
            policy_path: std::env::var("SCHEMAFORGE_POLICY").ok().filter(|s| !s.is_empty()),
        };
        if settings.default_page_size == 0 || settings.default_page_size > settings.max_page_size {
            return Err(ConfigError::Invalid {
                name: "SCHEMAFORGE_DEFAULT_PAGE_SIZE",
                reason: format!("must be between 1 and {}", settings.max_page_size),
            });
        }
        // a bulk call reserves one audit slot per item before writing
        if settings.audit_queue_capacity == 0 || settings.audit_queue_capacity < settings.bulk_limit {
            return Err(ConfigError::Invalid {
                name: "SCHEMAFORGE_AUDIT_QUEUE",
                reason: format!("must be at least 1 and at least SCHEMAFORGE_BULK_LIMIT ({})", settings.bulk_limit),
            });
        }
        Ok(settings)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

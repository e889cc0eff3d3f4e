//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

const SSL_MODES: &[&str] = &["disable", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }
    if config.target.schema.is_empty() {
        return Err(MigrateError::Config("target.schema cannot be empty".into()));
    }
    if !SSL_MODES.contains(&config.target.ssl_mode.to_lowercase().as_str()) {
        return Err(MigrateError::Config(format!(
            "target.ssl_mode must be one of {:?}, got '{}'",
            SSL_MODES, config.target.ssl_mode
        )));
    }

    // Cannot migrate to the same database
    if config.source.host == config.target.host
        && config.source.port() == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    if let Some(0) = config.migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(kinds) = &config.migration.routine_kinds {
        if kinds.is_empty() && config.migration.get_migrate_routines() {
            return Err(MigrateError::Config(
                "migration.routine_kinds is empty; set migrate_routines: false instead".into(),
            ));
        }
    }

    Ok(())
}

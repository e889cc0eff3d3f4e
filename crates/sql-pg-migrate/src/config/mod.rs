//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration with passwords removed, recorded in run reports.
    pub fn fingerprint(&self) -> String {
        let mut redacted = self.clone();
        redacted.source.password.clear();
        redacted.target.password.clear();
        let yaml = serde_yaml::to_string(&redacted).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Commented configuration template written by `init`.
pub const CONFIG_TEMPLATE: &str = r#"# sql-pg-migrate configuration
source:
  type: mssql            # mssql | mysql
  host: localhost
  # port: 1433           # default 1433 (mssql) / 3306 (mysql)
  database: source_db
  user: sa
  password: changeme
  # schema: dbo          # default dbo (mssql) / database name (mysql)
  encrypt: true
  trust_server_cert: false

target:
  type: postgres
  host: localhost
  port: 5432
  database: target_db
  user: postgres
  password: changeme
  schema: public
  ssl_mode: require      # disable | require | verify-ca | verify-full

migration:
  batch_size: 1000
  include_tables: []
  exclude_tables: []
  migrate_data: true
  migrate_constraints: true
  migrate_routines: true
  # routine_kinds: [view, procedure, function, trigger]
  stub_comment_limit: 500
  create_target_schema: true
"#;

//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::schema::RoutineKind;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (SQL Server or MySQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Supported source engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mssql,
    Mysql,
}

impl SourceType {
    /// Default listening port for the engine.
    pub fn default_port(self) -> u16 {
        match self {
            SourceType::Mssql => 1433,
            SourceType::Mysql => 3306,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Mssql => write!(f, "mssql"),
            SourceType::Mysql => write!(f, "mysql"),
        }
    }
}

/// Source database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database engine: "mssql" or "mysql".
    pub r#type: SourceType,

    /// Database host.
    pub host: String,

    /// Database port (default: 1433 for mssql, 3306 for mysql).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Source schema (default: "dbo" for mssql, the database name for mysql).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Encrypt connection (mssql only, default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (mssql only, default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl SourceConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.r#type.default_port())
    }

    /// Effective schema to migrate.
    pub fn schema(&self) -> &str {
        match (&self.schema, self.r#type) {
            (Some(schema), _) => schema,
            (None, SourceType::Mssql) => "dbo",
            (None, SourceType::Mysql) => &self.database,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema())
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
///
/// Optional fields distinguish "not set" from "explicitly set"; use the
/// `get_*` accessors for effective values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Rows per transfer batch (default: 1000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Tables to include (glob patterns, `*` and `?`).
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (glob patterns, `*` and `?`).
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Copy table rows (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_data: Option<bool>,

    /// Migrate primary and foreign keys (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_constraints: Option<bool>,

    /// Translate views, procedures, functions and triggers (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_routines: Option<bool>,

    /// Routine kinds to translate (default: all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine_kinds: Option<Vec<RoutineKind>>,

    /// Characters of original source kept in stub comments (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub_comment_limit: Option<usize>,

    /// Issue CREATE SCHEMA IF NOT EXISTS for the target schema (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_target_schema: Option<bool>,
}

impl MigrationConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1000)
    }

    pub fn get_migrate_data(&self) -> bool {
        self.migrate_data.unwrap_or(true)
    }

    pub fn get_migrate_constraints(&self) -> bool {
        self.migrate_constraints.unwrap_or(true)
    }

    pub fn get_migrate_routines(&self) -> bool {
        self.migrate_routines.unwrap_or(true)
    }

    pub fn get_routine_kinds(&self) -> Vec<RoutineKind> {
        self.routine_kinds
            .clone()
            .unwrap_or_else(|| RoutineKind::ALL.to_vec())
    }

    pub fn get_stub_comment_limit(&self) -> usize {
        self.stub_comment_limit.unwrap_or(500)
    }

    pub fn get_create_target_schema(&self) -> bool {
        self.create_target_schema.unwrap_or(true)
    }

    /// Whether a table name passes the include/exclude filters.
    pub fn table_selected(&self, table: &str) -> bool {
        let included = self.include_tables.is_empty()
            || self.include_tables.iter().any(|p| glob_matches(p, table));
        included && !self.exclude_tables.iter().any(|p| glob_matches(p, table))
    }
}

/// Case-insensitive glob match supporting `*` and `?`.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    let (mut p, mut n) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = n;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            n = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

fn default_true() -> bool {
    true
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

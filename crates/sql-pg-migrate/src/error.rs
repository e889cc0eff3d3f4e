//! Error types for the migration library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQL Server source connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// MySQL source connection or query error
    #[error("Source database error: {0}")]
    MySql(#[from] sqlx::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Table or routine disappeared between listing and description
    #[error("{kind} {name} not found in source catalog")]
    NotFound { kind: String, name: String },

    /// Source metadata could not be read
    #[error("Introspection failed for {item}: {message}")]
    Introspection { item: String, message: String },

    /// CREATE TABLE or CREATE SCHEMA failed
    #[error("DDL failed for {table}: {message}")]
    Ddl { table: String, message: String },

    /// Uniqueness repair or foreign key application failed
    #[error("Constraint {constraint} failed: {message}")]
    Constraint { constraint: String, message: String },

    /// Routine rewrite or validation failed
    #[error("Translation failed for {object}: {message}")]
    Translation { object: String, message: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Row count validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Category of a per-item failure, as reported in outcome records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Introspection,
    Ddl,
    Constraint,
    Translation,
    Transfer,
    Validation,
    Io,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        MigrateError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an Introspection error
    pub fn introspection(item: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Introspection {
            item: item.into(),
            message: message.to_string(),
        }
    }

    /// Create a Ddl error
    pub fn ddl(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Ddl {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a Constraint error
    pub fn constraint(constraint: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Constraint {
            constraint: constraint.into(),
            message: message.to_string(),
        }
    }

    /// Create a Translation error
    pub fn translation(object: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Translation {
            object: object.into(),
            message: message.to_string(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Failure category for outcome records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => {
                ErrorKind::Config
            }
            MigrateError::Pool { .. } => ErrorKind::Connection,
            MigrateError::Source(_)
            | MigrateError::MySql(_)
            | MigrateError::NotFound { .. }
            | MigrateError::Introspection { .. } => ErrorKind::Introspection,
            MigrateError::Target(_) | MigrateError::Ddl { .. } => ErrorKind::Ddl,
            MigrateError::Constraint { .. } => ErrorKind::Constraint,
            MigrateError::Translation { .. } => ErrorKind::Translation,
            MigrateError::Transfer { .. } => ErrorKind::Transfer,
            MigrateError::Validation(_) => ErrorKind::Validation,
            MigrateError::Io(_) => ErrorKind::Io,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => 1,
            MigrateError::Pool { .. } => 2,
            MigrateError::Source(_)
            | MigrateError::MySql(_)
            | MigrateError::NotFound { .. }
            | MigrateError::Introspection { .. } => 3,
            MigrateError::Target(_) | MigrateError::Ddl { .. } => 4,
            MigrateError::Constraint { .. }
            | MigrateError::Translation { .. }
            | MigrateError::Transfer { .. }
            | MigrateError::Validation(_) => 5,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

//! # sql-pg-migrate
//!
//! SQL Server and MySQL to PostgreSQL migration library.
//!
//! This library migrates a source schema in one pass:
//!
//! - **Tables** with dialect-aware type mapping and idempotent DDL
//! - **Primary and foreign keys**, repairing missing uniqueness on referenced columns
//! - **Row data** in fixed-size batches, parents before children
//! - **Views, procedures, functions and triggers** rewritten to PL/pgSQL, with
//!   an inert stub left in place of anything that cannot be translated
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_pg_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> sql_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let report = orchestrator.run().await?;
//!     println!("Migrated {} rows ({})", report.rows_transferred, report.status());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constraints;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod target;
pub mod transfer;
pub mod translate;
pub mod typemap;

#[cfg(test)]
pub mod testing;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, SourceType, TargetConfig};
pub use error::{ErrorKind, MigrateError, Result};
pub use orchestrator::{
    HealthCheckResult, ItemCategory, ItemOutcome, ItemStatus, MigrationPlan, MigrationReport,
    Orchestrator, TableValidation,
};
pub use progress::{JsonLinesListener, Phase, ProgressEvent, ProgressListener, TracingListener};
pub use source::SchemaIntrospector;
pub use target::{DdlSynthesizer, PgTarget};
pub use transfer::{DataTransferPipeline, JobStatus, TransferJob};
pub use translate::{ObjectTranslator, TranslationOutcome, TranslationState};
pub use typemap::TypeMapper;

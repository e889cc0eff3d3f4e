//! The two interfaces the migration core consumes: a read-only source
//! catalog and a target execution handle.
//!
//! Concrete implementations live in [`crate::source`] (SQL Server, MySQL) and
//! [`crate::target`] (PostgreSQL). Tests drive the core through in-memory
//! fakes of the same traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SourceType;
use crate::core::schema::{ConstraintDescriptor, RoutineDescriptor, RoutineKind, Table, TableRef};
use crate::core::value::Batch;
use crate::error::Result;

/// Where a routine definition is read from, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionSource {
    /// Direct retrieval (`SHOW CREATE ...`, `OBJECT_DEFINITION`).
    Direct,
    /// Catalog metadata views (`information_schema`, `sys.sql_modules`).
    CatalogMetadata,
    /// Legacy/internal tables (`mysql.proc`, `syscomments`).
    LegacyCatalog,
}

impl DefinitionSource {
    pub const FALLBACK_ORDER: [DefinitionSource; 3] = [
        DefinitionSource::Direct,
        DefinitionSource::CatalogMetadata,
        DefinitionSource::LegacyCatalog,
    ];
}

/// Receives row batches from [`SourceCatalog::stream_rows`].
#[async_trait]
pub trait BatchSink: Send {
    /// Persist one batch. An error stops the stream.
    async fn write_batch(&mut self, batch: Batch) -> Result<()>;
}

/// Read-only access to a source database's catalog and rows.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Source engine of this catalog.
    fn source_type(&self) -> SourceType;

    /// Base tables in `schema`, ordered by name.
    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>>;

    /// Columns and primary key of one table.
    ///
    /// Returns `MigrateError::NotFound` if the table no longer exists.
    async fn describe_table(&self, table: &TableRef) -> Result<Table>;

    /// Primary and foreign keys declared on one table.
    async fn describe_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>>;

    /// Views, procedures, functions and triggers in `schema`, with parameters
    /// and return types but without source text.
    async fn list_routines(&self, schema: &str) -> Result<Vec<RoutineDescriptor>>;

    /// Definition text from one source; `Ok(None)` when that source is empty
    /// or unavailable.
    async fn fetch_definition(
        &self,
        routine: &RoutineDescriptor,
        source: DefinitionSource,
    ) -> Result<Option<String>>;

    /// Exact row count.
    async fn count_rows(&self, table: &Table) -> Result<i64>;

    /// Stream every row through a cursor, handing `batch_size` rows at a time
    /// to `sink`. Returns the number of rows read.
    async fn stream_rows(
        &self,
        table: &Table,
        batch_size: usize,
        sink: &mut dyn BatchSink,
    ) -> Result<u64>;
}

/// Statement execution and catalog verification on the target.
#[async_trait]
pub trait TargetExecutor: Send + Sync {
    /// Execute one auto-committed statement, returning affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute statements in one transaction; any failure rolls back all of them.
    async fn execute_transaction(&self, statements: &[String]) -> Result<()>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool>;

    /// Whether exactly this column set carries a primary key or unique constraint.
    async fn has_unique_or_pk(&self, schema: &str, table: &str, columns: &[String])
        -> Result<bool>;

    async fn constraint_exists(&self, schema: &str, table: &str, name: &str) -> Result<bool>;

    /// Whether an object with `name` is registered with the given kind.
    async fn object_exists(&self, schema: &str, name: &str, kind: RoutineKind) -> Result<bool>;

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64>;

    /// `MAX(column)` as bigint, `None` for an empty table.
    async fn max_value(&self, schema: &str, table: &str, column: &str) -> Result<Option<i64>>;
}

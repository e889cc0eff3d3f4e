//! PostgreSQL DDL synthesis from table descriptors.

use std::sync::Arc;

use tracing::warn;

use crate::core::identifier::{qualify_pg, quote_pg, quote_pg_list};
use crate::core::schema::{Column, Table};
use crate::error::Result;
use crate::typemap::TypeMapper;

/// Integer targets that can carry `GENERATED ... AS IDENTITY`.
const IDENTITY_TYPES: &[&str] = &["smallint", "integer", "bigint"];

/// Builds idempotent CREATE statements in the target schema.
pub struct DdlSynthesizer {
    mapper: Arc<dyn TypeMapper>,
    target_schema: String,
}

impl DdlSynthesizer {
    pub fn new(mapper: Arc<dyn TypeMapper>, target_schema: impl Into<String>) -> Self {
        Self {
            mapper,
            target_schema: target_schema.into(),
        }
    }

    pub fn target_schema(&self) -> &str {
        &self.target_schema
    }

    /// `CREATE SCHEMA IF NOT EXISTS`.
    pub fn create_schema(&self) -> Result<String> {
        Ok(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_pg(&self.target_schema)?
        ))
    }

    /// `CREATE TABLE IF NOT EXISTS` with columns in ordinal order and an
    /// inline primary key when the table declares one.
    pub fn create_table(&self, table: &Table) -> Result<String> {
        let mut defs = table
            .columns
            .iter()
            .map(|c| self.column_definition(table, c))
            .collect::<Result<Vec<_>>>()?;

        if table.has_pk() {
            defs.push(format!("PRIMARY KEY ({})", quote_pg_list(&table.primary_key)?));
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            qualify_pg(&self.target_schema, &table.name)?,
            defs.join(",\n    ")
        ))
    }

    /// Restart an identity column's sequence after a load.
    pub fn restart_identity(&self, table: &Table, column: &str, next_value: i64) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} RESTART WITH {}",
            qualify_pg(&self.target_schema, &table.name)?,
            quote_pg(column)?,
            next_value
        ))
    }

    /// Whether `column` was created as an identity column on the target.
    pub fn carries_identity(&self, table: &Table, column: &str) -> bool {
        table
            .columns
            .iter()
            .find(|c| c.name == column && c.is_identity)
            .map(|c| IDENTITY_TYPES.contains(&self.mapper.map_column(c).target_type.as_str()))
            .unwrap_or(false)
    }

    /// Target type for a column, logging lossy mappings.
    pub fn target_type(&self, table: &Table, col: &Column) -> String {
        let mapping = self.mapper.map_column(col);
        if let Some(warning) = &mapping.warning {
            warn!("{}.{}: {}", table.full_name(), col.name, warning);
        }
        mapping.target_type
    }

    fn column_definition(&self, table: &Table, col: &Column) -> Result<String> {
        let target_type = self.target_type(table, col);
        let mut def = format!("{} {}", quote_pg(&col.name)?, target_type);

        if col.is_identity {
            if IDENTITY_TYPES.contains(&target_type.as_str()) {
                def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            } else {
                warn!(
                    "{}.{}: identity on {} is not supported, copied as a plain column",
                    table.full_name(),
                    col.name,
                    target_type
                );
            }
        }
        if !col.is_nullable {
            def.push_str(" NOT NULL");
        }
        Ok(def)
    }
}

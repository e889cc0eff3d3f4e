//! Source catalogs and the schema introspector built on them.

mod mssql;
mod mysql;

pub use mssql::MssqlCatalog;
pub use mysql::MysqlCatalog;

use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, SourceConfig, SourceType};
use crate::core::schema::{ConstraintDescriptor, RoutineDescriptor, Table, TableRef};
use crate::core::traits::{DefinitionSource, SourceCatalog};
use crate::error::{MigrateError, Result};

/// Open the catalog for the configured source engine.
pub async fn connect(config: &SourceConfig) -> Result<Box<dyn SourceCatalog>> {
    match config.r#type {
        SourceType::Mssql => Ok(Box::new(MssqlCatalog::connect(config).await?)),
        SourceType::Mysql => Ok(Box::new(MysqlCatalog::connect(config).await?)),
    }
}

/// Read-only view of the source schema, filtered by migration settings.
pub struct SchemaIntrospector<'a> {
    catalog: &'a dyn SourceCatalog,
    settings: &'a MigrationConfig,
}

impl<'a> SchemaIntrospector<'a> {
    pub fn new(catalog: &'a dyn SourceCatalog, settings: &'a MigrationConfig) -> Self {
        Self { catalog, settings }
    }

    /// Tables in `schema` ordered by name, after include/exclude filtering.
    pub async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let all = self.catalog.list_tables(schema).await?;
        let total = all.len();
        let mut tables: Vec<TableRef> = all
            .into_iter()
            .filter(|t| self.settings.table_selected(&t.name))
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        if tables.len() != total {
            info!(
                "Selected {} of {} tables in '{}' after filtering",
                tables.len(),
                total,
                schema
            );
        }
        Ok(tables)
    }

    /// Full table descriptor; `NotFound` if the table vanished since listing.
    pub async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        self.catalog.describe_table(table).await
    }

    pub async fn describe_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        self.catalog.describe_constraints(table).await
    }

    /// Routines of the configured kinds, without source text.
    pub async fn list_routines(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let kinds = self.settings.get_routine_kinds();
        Ok(self
            .catalog
            .list_routines(schema)
            .await?
            .into_iter()
            .filter(|r| kinds.contains(&r.kind))
            .collect())
    }

    /// Definition text from the first source that yields any.
    ///
    /// A source that errors is treated as empty; if every source is empty the
    /// routine is reported as an introspection failure.
    pub async fn fetch_routine_definition(&self, routine: &RoutineDescriptor) -> Result<String> {
        for source in DefinitionSource::FALLBACK_ORDER {
            match self.catalog.fetch_definition(routine, source).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    debug!("{}: definition read from {:?}", routine.full_name(), source);
                    return Ok(text);
                }
                Ok(_) => {
                    debug!("{}: no definition from {:?}", routine.full_name(), source);
                }
                Err(e) => {
                    warn!(
                        "{}: definition source {:?} unavailable: {}",
                        routine.full_name(),
                        source,
                        e
                    );
                }
            }
        }
        Err(MigrateError::introspection(
            routine.full_name(),
            "definition is empty in every catalog source",
        ))
    }

    /// Exact source row count.
    pub async fn count_rows(&self, table: &Table) -> Result<i64> {
        self.catalog.count_rows(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::RoutineKind;
    use crate::testing::{sample_table, FakeCatalog};

    fn settings_excluding(pattern: &str) -> MigrationConfig {
        MigrationConfig {
            exclude_tables: vec![pattern.to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_tables_ordered_and_filtered() {
        let catalog = FakeCatalog::mssql()
            .with_table(sample_table("dbo", "orders"), vec![])
            .with_table(sample_table("dbo", "audit_log"), vec![])
            .with_table(sample_table("dbo", "customers"), vec![]);

        let all = MigrationConfig::default();
        let introspector = SchemaIntrospector::new(&catalog, &all);
        let names: Vec<String> = introspector
            .list_tables("dbo")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["audit_log", "customers", "orders"]);

        let filtered = settings_excluding("audit_*");
        let introspector = SchemaIntrospector::new(&catalog, &filtered);
        let names: Vec<String> = introspector
            .list_tables("dbo")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_describe_missing_table_is_not_found() {
        let catalog = FakeCatalog::mssql();
        let settings = MigrationConfig::default();
        let introspector = SchemaIntrospector::new(&catalog, &settings);
        let err = introspector
            .describe_table(&TableRef::new("dbo", "gone"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_definition_fallback_order() {
        let routine = RoutineDescriptor::new(RoutineKind::Procedure, "dbo", "p");
        let catalog = FakeCatalog::mssql()
            .with_routine(routine.clone())
            .with_definition("p", DefinitionSource::CatalogMetadata, "from catalog")
            .with_definition("p", DefinitionSource::LegacyCatalog, "from legacy");

        let settings = MigrationConfig::default();
        let introspector = SchemaIntrospector::new(&catalog, &settings);
        let text = introspector.fetch_routine_definition(&routine).await.unwrap();
        assert_eq!(text, "from catalog");
    }

    #[tokio::test]
    async fn test_definition_skips_blank_and_failing_sources() {
        let routine = RoutineDescriptor::new(RoutineKind::View, "dbo", "v");
        let catalog = FakeCatalog::mssql()
            .with_routine(routine.clone())
            .with_definition("v", DefinitionSource::Direct, "   ")
            .with_failing_definition("v", DefinitionSource::CatalogMetadata)
            .with_definition("v", DefinitionSource::LegacyCatalog, "SELECT 1");

        let settings = MigrationConfig::default();
        let introspector = SchemaIntrospector::new(&catalog, &settings);
        assert_eq!(
            introspector.fetch_routine_definition(&routine).await.unwrap(),
            "SELECT 1"
        );
    }

    #[tokio::test]
    async fn test_definition_all_empty_is_introspection_error() {
        let routine = RoutineDescriptor::new(RoutineKind::Function, "dbo", "f");
        let catalog = FakeCatalog::mssql().with_routine(routine.clone());
        let settings = MigrationConfig::default();
        let introspector = SchemaIntrospector::new(&catalog, &settings);
        let err = introspector
            .fetch_routine_definition(&routine)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Introspection { .. }));
    }

    #[tokio::test]
    async fn test_list_routines_filters_kinds() {
        let catalog = FakeCatalog::mssql()
            .with_routine(RoutineDescriptor::new(RoutineKind::View, "dbo", "v"))
            .with_routine(RoutineDescriptor::new(RoutineKind::Trigger, "dbo", "t"));
        let settings = MigrationConfig {
            routine_kinds: Some(vec![RoutineKind::View]),
            ..Default::default()
        };
        let introspector = SchemaIntrospector::new(&catalog, &settings);
        let routines = introspector.list_routines("dbo").await.unwrap();
        assert_eq!(routines.len(), 1);
        assert_eq!(routines[0].kind, RoutineKind::View);
    }
}

//! Migration orchestrator - main workflow coordinator.
//!
//! A run walks five phases in order: introspection, schema, constraints,
//! data and routines. Every table, constraint and routine ends in an
//! [`ItemOutcome`]; a failing item is recorded and the run moves on. Only
//! configuration and connection problems abort a run.

mod report;

pub use report::{
    CategorySummary, HealthCheckResult, ItemCategory, ItemOutcome, ItemStatus, MigrationPlan,
    MigrationReport, PlannedRoutine, TableValidation,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::constraints::{ConstraintMigrator, ConstraintState};
use crate::core::schema::{ConstraintDescriptor, ConstraintKind, RoutineDescriptor, Table};
use crate::core::traits::{SourceCatalog, TargetExecutor};
use crate::error::{MigrateError, Result};
use crate::progress::{Phase, ProgressEvent, ProgressListener};
use crate::source::{self, SchemaIntrospector};
use crate::target::{DdlSynthesizer, PgTarget};
use crate::transfer::{transfer_order, DataTransferPipeline, JobStatus, TransferJob};
use crate::translate::render::Signature;
use crate::translate::{routine_order, ObjectTranslator, TranslationState};
use crate::typemap::mapper_for;

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceCatalog>,
    target: Arc<dyn TargetExecutor>,
    listener: Option<Arc<dyn ProgressListener>>,
}

/// Source tables described during introspection.
struct Discovered {
    tables: Vec<Table>,
    constraints: Vec<ConstraintDescriptor>,
}

impl Orchestrator {
    /// Connect to both ends described by `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let source = source::connect(&config.source).await?;
        let target = PgTarget::connect(&config.target).await?;
        Ok(Self::with_connections(
            config,
            Arc::from(source),
            Arc::new(target),
        ))
    }

    /// Use already-open connections.
    pub fn with_connections(
        config: Config,
        source: Arc<dyn SourceCatalog>,
        target: Arc<dyn TargetExecutor>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            listener: None,
        }
    }

    /// Report progress events to `listener`.
    pub fn with_progress(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn source_schema(&self) -> &str {
        self.config.source.schema()
    }

    fn target_schema(&self) -> &str {
        &self.config.target.schema
    }

    fn emit(&self, item: &str, phase: Phase, done: usize, total: usize) {
        if let Some(listener) = &self.listener {
            listener.on_event(&ProgressEvent::new(item, phase, done as u64, total as u64));
        }
    }

    fn synthesizer(&self) -> DdlSynthesizer {
        DdlSynthesizer::new(
            mapper_for(self.source.source_type()),
            self.target_schema(),
        )
    }

    /// Run the migration.
    ///
    /// Returns `Err` only when the source schema cannot be listed at all;
    /// per-item failures are recorded in the report.
    pub async fn run(&self) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut outcomes = Vec::new();

        info!(
            "Starting migration run {}: {} schema '{}' -> PostgreSQL schema '{}'",
            run_id,
            self.source.source_type(),
            self.source_schema(),
            self.target_schema()
        );

        info!("Phase 1: Introspecting source schema");
        let discovered = self.introspect(&mut outcomes).await?;
        info!(
            "Found {} tables and {} constraints",
            discovered.tables.len(),
            discovered.constraints.len()
        );

        info!("Phase 2: Creating target tables");
        let created = self.create_tables(&discovered.tables, &mut outcomes).await;

        if self.config.migration.get_migrate_constraints() {
            info!("Phase 3: Migrating constraints");
            self.migrate_constraints(&discovered.constraints, &mut outcomes)
                .await;
        } else {
            info!("Phase 3: Skipping constraints (migrate_constraints = false)");
        }

        let mut rows_transferred = 0;
        if self.config.migration.get_migrate_data() {
            info!("Phase 4: Transferring data");
            rows_transferred = self
                .transfer_data(&discovered, &created, &mut outcomes)
                .await;
        } else {
            info!("Phase 4: Skipping data (migrate_data = false)");
        }

        if self.config.migration.get_migrate_routines() {
            info!("Phase 5: Translating routines");
            self.translate_routines(&mut outcomes).await;
        } else {
            info!("Phase 5: Skipping routines (migrate_routines = false)");
        }

        let report = MigrationReport::new(
            run_id,
            self.source.source_type(),
            self.config.fingerprint(),
            started_at,
            rows_transferred,
            outcomes,
        );
        self.emit("run", Phase::Finished, report.outcomes.len(), report.outcomes.len());

        for s in &report.summary {
            info!(
                "{:?}: {} succeeded, {} failed, {} stubbed, {} skipped",
                s.category, s.succeeded, s.failed, s.stubbed, s.skipped
            );
        }
        if report.has_failures() {
            warn!(
                "Migration completed with {} failed items in {:.1}s",
                report.failed_items().count(),
                report.duration_seconds
            );
        } else {
            info!(
                "Migration completed: {} rows in {:.1}s",
                report.rows_transferred, report.duration_seconds
            );
        }
        Ok(report)
    }

    /// Describe every selected table. Tables that cannot be described are
    /// reported and left out of later phases.
    async fn introspect(&self, outcomes: &mut Vec<ItemOutcome>) -> Result<Discovered> {
        let introspector = SchemaIntrospector::new(self.source.as_ref(), &self.config.migration);
        let refs = introspector.list_tables(self.source_schema()).await?;

        let mut discovered = Discovered {
            tables: Vec::with_capacity(refs.len()),
            constraints: Vec::new(),
        };
        for (i, table_ref) in refs.iter().enumerate() {
            let name = table_ref.to_string();
            self.emit(&name, Phase::Introspection, i + 1, refs.len());

            let table = match introspector.describe_table(table_ref).await {
                Ok(table) => table,
                Err(e) => {
                    warn!("{}: skipped, could not be described: {}", name, e);
                    outcomes.push(ItemOutcome::skipped_on_error(
                        ItemCategory::Introspection,
                        &name,
                        &e,
                    ));
                    continue;
                }
            };
            match introspector.describe_constraints(table_ref).await {
                Ok(constraints) => discovered.constraints.extend(constraints),
                Err(e) => {
                    warn!("{}: constraints could not be read: {}", name, e);
                    outcomes.push(ItemOutcome::failed(ItemCategory::Introspection, &name, &e));
                }
            }
            debug!("{}: {} columns", name, table.columns.len());
            discovered.tables.push(table);
        }
        Ok(discovered)
    }

    /// Create the target schema and tables. Returns the names of tables that
    /// exist on the target afterwards.
    async fn create_tables(
        &self,
        tables: &[Table],
        outcomes: &mut Vec<ItemOutcome>,
    ) -> HashSet<String> {
        let ddl = self.synthesizer();
        let mut created = HashSet::new();

        if self.config.migration.get_create_target_schema() {
            let result = match ddl.create_schema() {
                Ok(sql) => self.target.execute(&sql).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let e = MigrateError::ddl(self.target_schema(), e);
                error!("{}", e);
                outcomes.push(ItemOutcome::failed(
                    ItemCategory::Schema,
                    self.target_schema(),
                    &e,
                ));
            }
        }

        for (i, table) in tables.iter().enumerate() {
            let name = table.full_name();
            self.emit(&name, Phase::Schema, i + 1, tables.len());
            let result = match ddl.create_table(table) {
                Ok(sql) => {
                    debug!("{}: {}", name, sql);
                    self.target.execute(&sql).await.map(|_| ())
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!("{}: table ready", name);
                    created.insert(name.clone());
                    outcomes.push(ItemOutcome::succeeded(ItemCategory::Schema, name));
                }
                Err(e) => {
                    let e = match e {
                        MigrateError::Ddl { .. } => e,
                        other => MigrateError::ddl(&name, other),
                    };
                    error!("{}: CREATE TABLE failed: {}", name, e);
                    outcomes.push(ItemOutcome::failed(ItemCategory::Schema, name, &e));
                }
            }
        }
        created
    }

    async fn migrate_constraints(
        &self,
        constraints: &[ConstraintDescriptor],
        outcomes: &mut Vec<ItemOutcome>,
    ) {
        let migrator = ConstraintMigrator::new(self.target.as_ref(), self.target_schema());
        let ordered = ConstraintMigrator::order(constraints);
        for (i, constraint) in ordered.iter().enumerate() {
            let name = constraint.full_name();
            self.emit(&name, Phase::Constraints, i + 1, ordered.len());
            match migrator.migrate(constraint).await {
                Ok(outcome) => {
                    let mut item = ItemOutcome::succeeded(ItemCategory::Constraint, &name);
                    if outcome.state == ConstraintState::AlreadyPresent {
                        item = item.with_message("already present");
                    } else if let Some(unique) = &outcome.repaired_unique {
                        item = item.with_message(format!("added uniqueness {}", unique));
                    }
                    outcomes.push(item);
                }
                Err(e) => {
                    warn!("{}: {}", name, e);
                    outcomes.push(ItemOutcome::failed(ItemCategory::Constraint, name, &e));
                }
            }
        }
    }

    /// Copy rows parents-first. Returns the total rows migrated.
    async fn transfer_data(
        &self,
        discovered: &Discovered,
        created: &HashSet<String>,
        outcomes: &mut Vec<ItemOutcome>,
    ) -> u64 {
        let pipeline = DataTransferPipeline::new(
            self.source.as_ref(),
            self.target.as_ref(),
            self.target_schema(),
            self.config.migration.get_batch_size(),
        );
        let mut pipeline = match &self.listener {
            Some(listener) => pipeline.with_listener(listener.clone()),
            None => pipeline,
        };

        let order = transfer_order(&discovered.tables, &discovered.constraints);
        let scheduled: Vec<&Table> = order
            .iter()
            .map(|&i| &discovered.tables[i])
            .filter(|t| created.contains(&t.full_name()))
            .collect();
        if let Err(e) = pipeline.truncate_all(&scheduled).await {
            warn!("Emptying target tables before load failed, truncating per table: {}", e);
        }

        let mut total = 0;
        for i in order {
            let table = &discovered.tables[i];
            let name = table.full_name();
            if !created.contains(&name) {
                outcomes.push(ItemOutcome::skipped(
                    ItemCategory::Data,
                    name,
                    "target table was not created",
                ));
                continue;
            }

            let mut job = TransferJob::new(table, pipeline.batch_size());
            let result = pipeline.transfer(table, &mut job).await;
            total += job.rows_migrated;
            match result {
                Ok(()) if job.status == JobStatus::Completed => {
                    if job.rows_migrated > 0 {
                        self.restart_identities(table).await;
                    }
                    outcomes.push(
                        ItemOutcome::succeeded(ItemCategory::Data, name).with_message(format!(
                            "{} rows in {} batches",
                            job.rows_migrated, job.batches
                        )),
                    );
                }
                Ok(()) => {
                    let e = MigrateError::transfer(&name, "transfer ended without completing");
                    outcomes.push(ItemOutcome::failed(ItemCategory::Data, name, &e));
                }
                Err(e) => {
                    outcomes.push(ItemOutcome::failed(ItemCategory::Data, name, &e));
                }
            }
        }
        total
    }

    /// Move identity sequences past the migrated values. Failures only warn;
    /// the rows are already in place.
    async fn restart_identities(&self, table: &Table) {
        let ddl = self.synthesizer();
        for col in table.identity_columns() {
            if !ddl.carries_identity(table, &col.name) {
                continue;
            }
            let max = match self
                .target
                .max_value(self.target_schema(), &table.name, &col.name)
                .await
            {
                Ok(Some(max)) => max,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{}: could not read MAX({}): {}", table.full_name(), col.name, e);
                    continue;
                }
            };
            let result = match ddl.restart_identity(table, &col.name, max + 1) {
                Ok(sql) => self.target.execute(&sql).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!(
                    "{}: identity {} restarts at {}",
                    table.full_name(),
                    col.name,
                    max + 1
                ),
                Err(e) => warn!(
                    "{}: identity {} not restarted: {}",
                    table.full_name(),
                    col.name,
                    e
                ),
            }
        }
    }

    /// Routines of the configured kinds with their definitions attached.
    async fn load_routines(&self) -> Result<Vec<RoutineDescriptor>> {
        let introspector = SchemaIntrospector::new(self.source.as_ref(), &self.config.migration);
        let mut routines = introspector.list_routines(self.source_schema()).await?;
        for routine in &mut routines {
            match introspector.fetch_routine_definition(routine).await {
                Ok(text) => routine.source_text = Some(text),
                Err(e) => warn!("{}: {}", routine.full_name(), e),
            }
        }
        // Base views are created before the views that select from them.
        let order = routine_order(&routines);
        let mut slots: Vec<Option<RoutineDescriptor>> = routines.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    fn translator(&self) -> ObjectTranslator<'_> {
        ObjectTranslator::new(
            self.target.as_ref(),
            self.source.source_type(),
            self.source_schema(),
            self.target_schema(),
        )
        .with_stub_comment_limit(self.config.migration.get_stub_comment_limit())
    }

    async fn translate_routines(&self, outcomes: &mut Vec<ItemOutcome>) {
        let mut routines = match self.load_routines().await {
            Ok(routines) => routines,
            Err(e) => {
                error!("Routines could not be listed: {}", e);
                outcomes.push(ItemOutcome::failed(
                    ItemCategory::Routine,
                    self.source_schema(),
                    &e,
                ));
                return;
            }
        };

        let translator = self.translator();
        let total = routines.len();
        for (i, routine) in routines.iter_mut().enumerate() {
            self.emit(&routine.full_name(), Phase::Routines, i + 1, total);
            let outcome = translator.translate(routine).await;
            let status = match outcome.state {
                TranslationState::Applied => ItemStatus::Succeeded,
                TranslationState::StubApplied => ItemStatus::Stubbed,
                _ => ItemStatus::Failed,
            };
            let message = match (&outcome.stub_error, &outcome.message) {
                (Some(stub), Some(first)) => Some(format!("{}; stub failed: {}", first, stub)),
                (Some(stub), None) => Some(format!("stub failed: {}", stub)),
                (None, message) => message.clone(),
            };
            let message = if outcome.closers_inserted > 0 && status == ItemStatus::Succeeded {
                Some(format!("{} END IF closers inserted", outcome.closers_inserted))
            } else {
                message
            };
            outcomes.push(ItemOutcome {
                category: ItemCategory::Routine,
                item: outcome.name,
                status,
                error_kind: outcome.error_kind,
                message,
            });
        }
    }

    /// Introspect and return the statements a run would issue, without
    /// executing anything on the target.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        let mut ignored = Vec::new();
        let discovered = self.introspect(&mut ignored).await?;
        let ddl = self.synthesizer();
        let mut plan = MigrationPlan::default();

        if self.config.migration.get_create_target_schema() {
            plan.statements.push(ddl.create_schema()?);
        }
        for table in &discovered.tables {
            plan.statements.push(ddl.create_table(table)?);
        }
        if self.config.migration.get_migrate_constraints() {
            // Primary keys are declared inline by CREATE TABLE.
            let migrator = ConstraintMigrator::new(self.target.as_ref(), self.target_schema());
            for c in ConstraintMigrator::order(&discovered.constraints) {
                if c.kind == ConstraintKind::ForeignKey {
                    plan.statements.push(migrator.foreign_key_statement(&c)?);
                }
            }
        }
        if self.config.migration.get_migrate_data() {
            plan.transfer_order = transfer_order(&discovered.tables, &discovered.constraints)
                .into_iter()
                .map(|i| discovered.tables[i].full_name())
                .collect();
        }

        if self.config.migration.get_migrate_routines() {
            let translator = self.translator();
            let mapper = mapper_for(self.source.source_type());
            for routine in self.load_routines().await? {
                let rewritten = Signature::for_routine(&routine, mapper.as_ref())
                    .and_then(|signature| translator.rewrite(&routine, &signature));
                let planned = match rewritten {
                    Ok(rewritten) => PlannedRoutine {
                        name: routine.full_name(),
                        kind: routine.kind.to_string(),
                        statements: rewritten.statements,
                        stub_reason: None,
                    },
                    Err(e) => PlannedRoutine {
                        name: routine.full_name(),
                        kind: routine.kind.to_string(),
                        statements: Vec::new(),
                        stub_reason: Some(e.to_string()),
                    },
                };
                plan.routines.push(planned);
            }
        }

        info!(
            "Plan: {} statements, {} tables to transfer, {} routines",
            plan.statements.len(),
            plan.transfer_order.len(),
            plan.routines.len()
        );
        Ok(plan)
    }

    /// Validate row counts between source and target.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let introspector = SchemaIntrospector::new(self.source.as_ref(), &self.config.migration);
        let mut results = Vec::new();

        for table_ref in introspector.list_tables(self.source_schema()).await? {
            let table = introspector.describe_table(&table_ref).await?;
            let source_count = introspector.count_rows(&table).await?;
            let target_count = match self
                .target
                .count_rows(self.target_schema(), &table.name)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: target count failed: {}", table.full_name(), e);
                    0
                }
            };

            let matches = source_count == target_count;
            if matches {
                info!("{}: {} rows (match)", table.full_name(), source_count);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    table.full_name(),
                    source_count,
                    target_count
                );
            }
            results.push(TableValidation {
                table: table.full_name(),
                source_rows: source_count,
                target_rows: target_count,
                matches,
            });
        }
        Ok(results)
    }

    /// Connect to both ends and time each connection.
    pub async fn health_check(config: &Config) -> HealthCheckResult {
        let started = Instant::now();
        let source = source::connect(&config.source).await;
        let source_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = PgTarget::connect(&config.target).await;
        let target_latency_ms = started.elapsed().as_millis() as u64;

        let source_error = source.err().map(|e| e.to_string());
        let target_error = target.err().map(|e| e.to_string());
        HealthCheckResult {
            source_connected: source_error.is_none(),
            source_latency_ms,
            target_connected: target_error.is_none(),
            target_latency_ms,
            healthy: source_error.is_none() && target_error.is_none(),
            source_error,
            target_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ForeignKeyTarget, ReferentialAction, RoutineKind};
    use crate::core::traits::DefinitionSource;
    use crate::testing::{
        sample_rows, sample_table, FakeCatalog, RecordingListener, RecordingTarget,
    };

    fn config(extra: &str) -> Config {
        let yaml = format!(
            "source:\n  type: mssql\n  host: mssql.local\n  database: shop\n  user: sa\n\
             target:\n  type: postgres\n  host: pg.local\n  database: shop\n  user: postgres\n  schema: app\n\
             migration:\n  batch_size: 1000\n{}",
            extra
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn orders_fk() -> ConstraintDescriptor {
        ConstraintDescriptor::foreign_key(
            "fk_orders_customers",
            "dbo",
            "orders",
            vec!["id".into()],
            ForeignKeyTarget {
                schema: "dbo".into(),
                table: "customers".into(),
                columns: vec!["id".into()],
                on_update: ReferentialAction::NoAction,
                on_delete: ReferentialAction::NoAction,
            },
        )
    }

    fn shop_catalog() -> FakeCatalog {
        let pk = |table: &str| {
            ConstraintDescriptor::primary_key(
                format!("PK_{}", table),
                "dbo",
                table,
                vec!["id".into()],
            )
        };
        FakeCatalog::mssql()
            .with_table(sample_table("dbo", "customers"), vec![pk("customers")])
            .with_table(sample_table("dbo", "orders"), vec![pk("orders"), orders_fk()])
            .with_rows("customers", sample_rows(40))
            .with_rows("orders", sample_rows(2500))
            .with_routine(RoutineDescriptor::new(RoutineKind::View, "dbo", "v_orders"))
            .with_definition(
                "v_orders",
                DefinitionSource::Direct,
                "CREATE VIEW dbo.v_orders AS SELECT id, name FROM dbo.orders",
            )
            .with_routine(RoutineDescriptor::new(RoutineKind::Procedure, "dbo", "walk"))
            .with_definition(
                "walk",
                DefinitionSource::CatalogMetadata,
                "CREATE PROCEDURE dbo.walk AS\nBEGIN\n  DECLARE c CURSOR FOR SELECT id FROM dbo.orders\n  OPEN c\nEND",
            )
    }

    #[tokio::test]
    async fn test_full_run() {
        let target = Arc::new(RecordingTarget::new().with_max_value("orders", "id", 2500));
        let listener = Arc::new(RecordingListener::default());
        let orchestrator =
            Orchestrator::with_connections(config(""), Arc::new(shop_catalog()), target.clone())
                .with_progress(listener.clone());

        let report = orchestrator.run().await.unwrap();

        assert!(!report.has_failures(), "{:?}", report.outcomes);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.rows_transferred, 2540);
        assert_eq!(target.rows_in("app", "orders"), 2500);
        assert_eq!(target.rows_in("app", "customers"), 40);
        assert_eq!(target.count_matching("CREATE SCHEMA IF NOT EXISTS \"app\""), 1);
        assert_eq!(
            target.count_matching("ALTER TABLE \"app\".\"orders\" ALTER COLUMN \"id\" RESTART WITH 2501"),
            1
        );

        let schema = report.summary_for(ItemCategory::Schema);
        assert_eq!(schema.succeeded, 2);
        let constraints = report.summary_for(ItemCategory::Constraint);
        assert_eq!(constraints.succeeded, 3);
        assert!(target.count_matching("FOREIGN KEY (\"id\") REFERENCES \"app\".\"customers\"") == 1);

        let routines = report.summary_for(ItemCategory::Routine);
        assert_eq!((routines.succeeded, routines.stubbed), (1, 1));
        assert!(target.has_object("v_orders", RoutineKind::View));
        assert!(target.has_object("walk", RoutineKind::Function));

        // Parents are loaded before the children that reference them.
        let inserts: Vec<String> = target
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT INTO"))
            .collect();
        assert!(inserts[0].starts_with("INSERT INTO \"app\".\"customers\""));
        assert_eq!(inserts.len(), 4);

        let events = listener.events();
        assert!(events.iter().any(|e| e.phase == Phase::Transfer && e.counters.done == 2500));
        assert_eq!(events.last().map(|e| e.phase), Some(Phase::Finished));
    }

    #[tokio::test]
    async fn test_failed_table_does_not_stop_run() {
        let target = Arc::new(
            RecordingTarget::new().fail_on("CREATE TABLE IF NOT EXISTS \"app\".\"orders\""),
        );
        let orchestrator =
            Orchestrator::with_connections(config(""), Arc::new(shop_catalog()), target.clone());

        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.exit_code(), 5);
        let failed: Vec<&str> = report.failed_items().map(|o| o.item.as_str()).collect();
        assert!(failed.contains(&"dbo.orders"));
        let data = report.summary_for(ItemCategory::Data);
        assert_eq!((data.succeeded, data.skipped), (1, 1));
        assert_eq!(target.rows_in("app", "customers"), 40);
        assert_eq!(report.summary_for(ItemCategory::Routine).total(), 2);
    }

    #[tokio::test]
    async fn test_vanished_table_is_skipped() {
        let source = FakeCatalog::mssql()
            .with_table(sample_table("dbo", "customers"), vec![])
            .with_vanished_table("dbo", "ghost");
        let target = Arc::new(RecordingTarget::new());
        let orchestrator = Orchestrator::with_connections(
            config("  migrate_routines: false\n"),
            Arc::new(source),
            target.clone(),
        );

        let report = orchestrator.run().await.unwrap();

        let skipped: Vec<&ItemOutcome> = report
            .outcomes
            .iter()
            .filter(|o| o.status == ItemStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].item, "dbo.ghost");
        assert_eq!(skipped[0].category, ItemCategory::Introspection);
        assert!(!report.has_failures());
        assert_eq!(target.count_matching("ghost"), 0);
    }

    #[tokio::test]
    async fn test_tables_are_emptied_before_any_load() {
        let fk = |child: &str, parent: &str| {
            ConstraintDescriptor::foreign_key(
                format!("fk_{}_{}", child, parent),
                "dbo",
                child,
                vec!["id".into()],
                ForeignKeyTarget {
                    schema: "dbo".into(),
                    table: parent.into(),
                    columns: vec!["id".into()],
                    on_update: ReferentialAction::NoAction,
                    on_delete: ReferentialAction::NoAction,
                },
            )
        };
        let source = FakeCatalog::mssql()
            .with_table(sample_table("dbo", "a"), vec![fk("a", "b")])
            .with_table(sample_table("dbo", "b"), vec![fk("b", "a")])
            .with_rows("a", sample_rows(5))
            .with_rows("b", sample_rows(5));
        let target = Arc::new(RecordingTarget::new());
        let orchestrator = Orchestrator::with_connections(
            config("  migrate_routines: false\n  migrate_constraints: false\n"),
            Arc::new(source),
            target.clone(),
        );

        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.rows_transferred, 10);
        let statements = target.statements();
        let last_truncate = statements.iter().rposition(|s| s.starts_with("TRUNCATE"));
        let first_insert = statements.iter().position(|s| s.starts_with("INSERT INTO"));
        assert!(last_truncate.is_some() && first_insert.is_some());
        assert!(last_truncate < first_insert);
        assert_eq!(target.count_matching("TRUNCATE"), 2);
        assert_eq!(target.rows_in("app", "a"), 5);
        assert_eq!(target.rows_in("app", "b"), 5);
    }

    #[tokio::test]
    async fn test_views_are_created_base_first() {
        let source = FakeCatalog::mssql()
            .with_table(sample_table("dbo", "orders"), vec![])
            .with_routine(RoutineDescriptor::new(RoutineKind::View, "dbo", "v_big_orders"))
            .with_definition(
                "v_big_orders",
                DefinitionSource::Direct,
                "CREATE VIEW dbo.v_big_orders AS SELECT id FROM dbo.v_orders WHERE id > 100",
            )
            .with_routine(RoutineDescriptor::new(RoutineKind::View, "dbo", "v_orders"))
            .with_definition(
                "v_orders",
                DefinitionSource::Direct,
                "CREATE VIEW dbo.v_orders AS SELECT id, name FROM dbo.orders",
            );
        let target = Arc::new(RecordingTarget::new());
        let orchestrator = Orchestrator::with_connections(
            config("  migrate_data: false\n"),
            Arc::new(source),
            target.clone(),
        );

        let report = orchestrator.run().await.unwrap();

        let routines = report.summary_for(ItemCategory::Routine);
        assert_eq!(routines.succeeded, 2, "{:?}", report.outcomes);
        let statements = target.statements();
        let created = |name: &str| {
            let prefix = format!("CREATE VIEW \"app\".\"{}\"", name);
            statements.iter().position(|s| s.starts_with(&prefix))
        };
        let (base, dependent) = (created("v_orders"), created("v_big_orders"));
        assert!(base.is_some() && dependent.is_some());
        assert!(base < dependent);
    }

    #[tokio::test]
    async fn test_plan_executes_nothing() {
        let target = Arc::new(RecordingTarget::new());
        let orchestrator =
            Orchestrator::with_connections(config(""), Arc::new(shop_catalog()), target.clone());

        let plan = orchestrator.plan().await.unwrap();

        assert!(target.statements().is_empty());
        assert_eq!(plan.statements[0], "CREATE SCHEMA IF NOT EXISTS \"app\"");
        assert_eq!(plan.statements.len(), 4);
        assert!(plan.statements[3].contains("FOREIGN KEY"));
        assert_eq!(plan.transfer_order, vec!["dbo.customers", "dbo.orders"]);
        assert_eq!(plan.routines.len(), 2);
        let walk = plan.routines.iter().find(|r| r.name == "dbo.walk").unwrap();
        assert!(walk.stub_reason.is_some());
    }

    #[tokio::test]
    async fn test_validate_compares_counts() {
        let target = Arc::new(RecordingTarget::new());
        let orchestrator = Orchestrator::with_connections(
            config("  migrate_routines: false\n"),
            Arc::new(shop_catalog()),
            target.clone(),
        );
        orchestrator.run().await.unwrap();
        target
            .execute("INSERT INTO \"app\".\"orders\" (\"id\", \"name\") VALUES\n(9999, 'extra')")
            .await
            .unwrap();

        let results = orchestrator.validate().await.unwrap();
        assert_eq!(results.len(), 2);
        let customers = results.iter().find(|r| r.table == "dbo.customers").unwrap();
        assert!(customers.matches);
        let orders = results.iter().find(|r| r.table == "dbo.orders").unwrap();
        assert_eq!((orders.source_rows, orders.target_rows), (2500, 2501));
        assert!(!orders.matches);
    }
}

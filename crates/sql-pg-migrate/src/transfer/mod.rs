//! Batched row transfer from source to target.
//!
//! Each table is emptied with `TRUNCATE ... CASCADE`, then rows are streamed
//! through the source cursor and written as one multi-row `INSERT` per batch,
//! each batch in its own transaction. A failed batch rolls back alone; the
//! batches before it stay committed.
//!
//! A full run empties every scheduled table up front with
//! [`DataTransferPipeline::truncate_all`], so a cascading truncate never
//! reaches a table that was already loaded.

pub mod coerce;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::identifier::{qualify_pg, quote_pg_list};
use crate::core::schema::{ConstraintDescriptor, ConstraintKind, Table};
use crate::core::traits::{BatchSink, SourceCatalog, TargetExecutor};
use crate::core::value::Batch;
use crate::error::{MigrateError, Result};
use crate::progress::{Phase, ProgressEvent, ProgressListener};

use self::coerce::row_literal;

/// Terminal or intermediate state of one table's transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Bookkeeping for one table's transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    /// Qualified source table name.
    pub table: String,
    /// Source row count taken before streaming.
    pub estimated_rows: i64,
    pub rows_migrated: u64,
    pub batch_size: usize,
    /// Batches committed on the target.
    pub batches: u64,
    pub status: JobStatus,
}

impl TransferJob {
    pub fn new(table: &Table, batch_size: usize) -> Self {
        Self {
            table: table.full_name(),
            estimated_rows: 0,
            rows_migrated: 0,
            batch_size: batch_size.max(1),
            batches: 0,
            status: JobStatus::NotStarted,
        }
    }

    fn record_batch(&mut self, rows: usize) {
        self.rows_migrated += rows as u64;
        self.batches += 1;
    }
}

/// Streams one table at a time from a source catalog into the target.
pub struct DataTransferPipeline<'a> {
    source: &'a dyn SourceCatalog,
    target: &'a dyn TargetExecutor,
    target_schema: String,
    batch_size: usize,
    listener: Option<Arc<dyn ProgressListener>>,
    /// Qualified target tables already emptied for this run.
    truncated: HashSet<String>,
}

impl<'a> DataTransferPipeline<'a> {
    pub fn new(
        source: &'a dyn SourceCatalog,
        target: &'a dyn TargetExecutor,
        target_schema: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            target,
            target_schema: target_schema.into(),
            batch_size: batch_size.max(1),
            listener: None,
            truncated: HashSet::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Empty the target of every table in `tables` before any is loaded.
    ///
    /// Stops at the first failure; tables not yet emptied are truncated by
    /// their own transfer instead.
    pub async fn truncate_all(&mut self, tables: &[&Table]) -> Result<()> {
        for table in tables {
            let target_table = qualify_pg(&self.target_schema, &table.name)?;
            if self.truncated.contains(&target_table) {
                continue;
            }
            self.target
                .execute(&format!("TRUNCATE {} CASCADE", target_table))
                .await?;
            debug!("{}: target emptied", target_table);
            self.truncated.insert(target_table);
        }
        Ok(())
    }

    /// Copy every row of `table`, updating `job` as batches commit.
    ///
    /// On error the job is left `Failed` with the rows committed so far.
    pub async fn transfer(&self, table: &Table, job: &mut TransferJob) -> Result<()> {
        job.status = JobStatus::InProgress;
        match self.run(table, job).await {
            Ok(()) => {
                job.status = JobStatus::Completed;
                Ok(())
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                warn!(
                    "{}: transfer failed after {} rows: {}",
                    job.table, job.rows_migrated, e
                );
                Err(match e {
                    MigrateError::Transfer { .. } => e,
                    other => MigrateError::transfer(&job.table, other),
                })
            }
        }
    }

    async fn run(&self, table: &Table, job: &mut TransferJob) -> Result<()> {
        let started = Instant::now();
        job.estimated_rows = self.source.count_rows(table).await?;
        if job.estimated_rows == 0 {
            info!("{}: source is empty, nothing to transfer", job.table);
            self.emit(&job.table, 0, 0);
            return Ok(());
        }

        let target_table = qualify_pg(&self.target_schema, &table.name)?;
        if !self.truncated.contains(&target_table) {
            self.target
                .execute(&format!("TRUNCATE {} CASCADE", target_table))
                .await?;
        }

        info!(
            "{}: transferring ~{} rows in batches of {}",
            job.table, job.estimated_rows, job.batch_size
        );

        let mut sink = InsertSink {
            target: self.target,
            listener: self.listener.as_deref(),
            insert_head: insert_head(&target_table, table)?,
            job,
        };
        let streamed = self
            .source
            .stream_rows(table, sink.job.batch_size, &mut sink)
            .await?;

        let job = sink.job;
        if streamed != job.rows_migrated {
            warn!(
                "{}: source reported {} rows streamed, {} written",
                job.table, streamed, job.rows_migrated
            );
        }
        info!(
            "{}: transferred {} rows in {} batches ({:.1}s)",
            job.table,
            job.rows_migrated,
            job.batches,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn emit(&self, item: &str, done: u64, total: u64) {
        if let Some(listener) = &self.listener {
            listener.on_event(&ProgressEvent::new(item, Phase::Transfer, done, total));
        }
    }
}

/// `INSERT INTO "s"."t" ("c1", "c2") VALUES` with columns in ordinal order.
fn insert_head(target_table: &str, table: &Table) -> Result<String> {
    let mut columns: Vec<_> = table.columns.iter().collect();
    columns.sort_by_key(|c| c.ordinal_pos);
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES",
        target_table,
        quote_pg_list(&names)?
    ))
}

/// Writes each streamed batch as one committed multi-row INSERT.
struct InsertSink<'s> {
    target: &'s dyn TargetExecutor,
    listener: Option<&'s dyn ProgressListener>,
    insert_head: String,
    job: &'s mut TransferJob,
}

#[async_trait]
impl BatchSink for InsertSink<'_> {
    async fn write_batch(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let values: Vec<String> = batch.rows.iter().map(|r| row_literal(r)).collect();
        let sql = format!("{}\n{}", self.insert_head, values.join(",\n"));

        let number = self.job.batches + 1;
        self.target
            .execute_transaction(&[sql])
            .await
            .map_err(|e| {
                MigrateError::transfer(
                    &self.job.table,
                    format!("batch {} ({} rows) rolled back: {}", number, batch.len(), e),
                )
            })?;

        self.job.record_batch(batch.len());
        debug!(
            "{}: batch {} committed, {} rows so far",
            self.job.table, number, self.job.rows_migrated
        );
        if let Some(listener) = self.listener {
            listener.on_event(&ProgressEvent::new(
                self.job.table.as_str(),
                Phase::Transfer,
                self.job.rows_migrated,
                self.job.estimated_rows.max(0) as u64,
            ));
        }
        Ok(())
    }
}

/// Indices into `tables` with referenced parents ahead of their children.
///
/// Ties keep discovery order. Tables caught in a foreign-key cycle are
/// appended in discovery order once nothing else is ready.
pub fn transfer_order(tables: &[Table], constraints: &[ConstraintDescriptor]) -> Vec<usize> {
    let index: HashMap<(&str, &str), usize> = tables
        .iter()
        .enumerate()
        .map(|(i, t)| ((t.schema.as_str(), t.name.as_str()), i))
        .collect();

    let mut parents: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
    for c in constraints {
        if c.kind != ConstraintKind::ForeignKey {
            continue;
        }
        let Some(target) = &c.references else {
            continue;
        };
        let child = index.get(&(c.schema.as_str(), c.table.as_str()));
        let parent = index.get(&(target.schema.as_str(), target.table.as_str()));
        if let (Some(&child), Some(&parent)) = (child, parent) {
            if child != parent && !parents[child].contains(&parent) {
                parents[child].push(parent);
            }
        }
    }

    let mut placed = vec![false; tables.len()];
    let mut order = Vec::with_capacity(tables.len());
    while order.len() < tables.len() {
        let ready = (0..tables.len())
            .find(|&i| !placed[i] && parents[i].iter().all(|&p| placed[p]));
        match ready {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let stuck: Vec<usize> = (0..tables.len()).filter(|&i| !placed[i]).collect();
                let names: Vec<String> = stuck.iter().map(|&i| tables[i].full_name()).collect();
                warn!(
                    "foreign key cycle among {}, using discovery order",
                    names.join(", ")
                );
                order.extend(stuck);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ForeignKeyTarget, ReferentialAction};
    use crate::testing::{sample_rows, sample_table, FakeCatalog, RecordingListener, RecordingTarget};

    fn fk(child: &str, parent: &str) -> ConstraintDescriptor {
        ConstraintDescriptor {
            name: format!("fk_{}_{}", child, parent),
            kind: ConstraintKind::ForeignKey,
            schema: "dbo".into(),
            table: child.into(),
            columns: vec!["parent_id".into()],
            references: Some(ForeignKeyTarget {
                schema: "dbo".into(),
                table: parent.into(),
                columns: vec!["id".into()],
                on_update: ReferentialAction::NoAction,
                on_delete: ReferentialAction::Cascade,
            }),
        }
    }

    #[tokio::test]
    async fn test_rows_are_written_in_batches() {
        let table = sample_table("dbo", "orders");
        let source = FakeCatalog::mssql()
            .with_table(table.clone(), vec![])
            .with_rows("orders", sample_rows(2500));
        let target = RecordingTarget::new();
        let listener = Arc::new(RecordingListener::default());
        let pipeline =
            DataTransferPipeline::new(&source, &target, "public", 1000).with_listener(listener.clone());

        let mut job = TransferJob::new(&table, pipeline.batch_size());
        pipeline.transfer(&table, &mut job).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.estimated_rows, 2500);
        assert_eq!(job.rows_migrated, 2500);
        assert_eq!(job.batches, 3);
        assert_eq!(target.rows_in("public", "orders"), 2500);
        assert_eq!(target.count_matching("TRUNCATE \"public\".\"orders\" CASCADE"), 1);

        let txs = target.transactions();
        assert_eq!(txs.len(), 3);
        assert!(txs[0][0].starts_with(
            "INSERT INTO \"public\".\"orders\" (\"id\", \"name\") VALUES\n(1, 'name 1'),\n(2, 'name 2'),"
        ));

        let done: Vec<u64> = listener.events().iter().map(|e| e.counters.done).collect();
        assert_eq!(done, vec![1000, 2000, 2500]);
        assert!(listener.events().iter().all(|e| e.counters.total == 2500));
    }

    #[tokio::test]
    async fn test_empty_table_issues_no_statements() {
        let table = sample_table("dbo", "empty");
        let source = FakeCatalog::mssql().with_table(table.clone(), vec![]);
        let target = RecordingTarget::new();
        let pipeline = DataTransferPipeline::new(&source, &target, "public", 1000);

        let mut job = TransferJob::new(&table, 1000);
        pipeline.transfer(&table, &mut job).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.rows_migrated, 0);
        assert_eq!(job.batches, 0);
        assert!(target.statements().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_earlier_batches() {
        let table = sample_table("dbo", "orders");
        let source = FakeCatalog::mssql()
            .with_table(table.clone(), vec![])
            .with_rows("orders", sample_rows(25));
        // Row 21 opens the third batch.
        let target = RecordingTarget::new().fail_on("(21, 'name 21')");
        let pipeline = DataTransferPipeline::new(&source, &target, "public", 10);

        let mut job = TransferJob::new(&table, 10);
        let err = pipeline.transfer(&table, &mut job).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Transfer);
        assert!(err.to_string().contains("batch 3 (5 rows) rolled back"));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.rows_migrated, 20);
        assert_eq!(job.batches, 2);
        assert_eq!(target.rows_in("public", "orders"), 20);
        assert_eq!(target.rolled_back().len(), 1);
    }

    #[tokio::test]
    async fn test_source_read_failure_marks_job_failed() {
        let table = sample_table("dbo", "orders");
        let source = FakeCatalog::mssql()
            .with_table(table.clone(), vec![])
            .with_rows("orders", sample_rows(30))
            .with_failing_stream("orders");
        let target = RecordingTarget::new();
        let pipeline = DataTransferPipeline::new(&source, &target, "public", 10);

        let mut job = TransferJob::new(&table, 10);
        let err = pipeline.transfer(&table, &mut job).await.unwrap_err();

        assert!(matches!(err, MigrateError::Transfer { .. }));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(target.rows_in("public", "orders"), 10);
    }

    #[tokio::test]
    async fn test_cycle_tables_are_emptied_before_loading() {
        let a = sample_table("dbo", "a");
        let b = sample_table("dbo", "b");
        let source = FakeCatalog::mssql()
            .with_table(a.clone(), vec![fk("a", "b")])
            .with_table(b.clone(), vec![fk("b", "a")])
            .with_rows("a", sample_rows(5))
            .with_rows("b", sample_rows(3));
        let target = RecordingTarget::new();
        let mut pipeline = DataTransferPipeline::new(&source, &target, "public", 10);

        pipeline.truncate_all(&[&a, &b]).await.unwrap();
        for table in [&a, &b] {
            let mut job = TransferJob::new(table, 10);
            pipeline.transfer(table, &mut job).await.unwrap();
        }

        let statements = target.statements();
        let last_truncate = statements.iter().rposition(|s| s.starts_with("TRUNCATE"));
        let first_insert = statements.iter().position(|s| s.starts_with("INSERT"));
        assert_eq!(last_truncate, Some(1));
        assert_eq!(first_insert, Some(2));
        assert_eq!(target.count_matching("TRUNCATE \"public\".\"a\" CASCADE"), 1);
        assert_eq!(target.count_matching("TRUNCATE \"public\".\"b\" CASCADE"), 1);
        assert_eq!(target.rows_in("public", "a"), 5);
        assert_eq!(target.rows_in("public", "b"), 3);
    }

    #[test]
    fn test_transfer_order_puts_parents_first() {
        let tables = vec![
            sample_table("dbo", "order_lines"),
            sample_table("dbo", "orders"),
            sample_table("dbo", "customers"),
        ];
        let constraints = vec![
            fk("order_lines", "orders"),
            fk("orders", "customers"),
            fk("customers", "customers"),
        ];
        assert_eq!(transfer_order(&tables, &constraints), vec![2, 1, 0]);
    }

    #[test]
    fn test_transfer_order_cycle_falls_back_to_discovery() {
        let tables = vec![
            sample_table("dbo", "a"),
            sample_table("dbo", "b"),
            sample_table("dbo", "c"),
        ];
        let constraints = vec![fk("a", "b"), fk("b", "a")];
        assert_eq!(transfer_order(&tables, &constraints), vec![2, 0, 1]);
    }
}

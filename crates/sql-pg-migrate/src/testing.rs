//! In-memory implementations of the source and target interfaces for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use regex::Regex;

use crate::config::SourceType;
use crate::core::schema::{
    Column, ConstraintDescriptor, RoutineDescriptor, RoutineKind, Table, TableRef,
};
use crate::core::traits::{BatchSink, DefinitionSource, SourceCatalog, TargetExecutor};
use crate::core::value::{Batch, Row, SqlValue};
use crate::error::{MigrateError, Result};
use crate::progress::{ProgressEvent, ProgressListener};

/// `id int identity` primary key plus a `name nvarchar(100)` column.
pub fn sample_table(schema: &str, name: &str) -> Table {
    let id = Column {
        name: "id".into(),
        data_type: "int".into(),
        max_length: 4,
        precision: 10,
        scale: 0,
        is_nullable: false,
        is_identity: true,
        ordinal_pos: 1,
    };
    let label = Column {
        name: "name".into(),
        data_type: "nvarchar".into(),
        max_length: 200,
        precision: 0,
        scale: 0,
        is_nullable: true,
        is_identity: false,
        ordinal_pos: 2,
    };
    Table::new(schema, name, vec![id, label], vec!["id".into()])
        .expect("sample table is well formed")
}

/// Rows matching [`sample_table`], ids starting at 1.
pub fn sample_rows(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| vec![SqlValue::I32(i as i32), SqlValue::Text(format!("name {}", i))])
        .collect()
}

/// Source catalog backed by in-memory tables and routines.
pub struct FakeCatalog {
    source_type: SourceType,
    tables: Vec<(Table, Vec<ConstraintDescriptor>)>,
    vanished: Vec<TableRef>,
    rows: HashMap<String, Vec<Row>>,
    failing_streams: BTreeSet<String>,
    routines: Vec<RoutineDescriptor>,
    definitions: HashMap<(String, DefinitionSourceKey), Option<String>>,
}

type DefinitionSourceKey = u8;

fn source_key(source: DefinitionSource) -> DefinitionSourceKey {
    match source {
        DefinitionSource::Direct => 0,
        DefinitionSource::CatalogMetadata => 1,
        DefinitionSource::LegacyCatalog => 2,
    }
}

impl FakeCatalog {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            tables: Vec::new(),
            vanished: Vec::new(),
            rows: HashMap::new(),
            failing_streams: BTreeSet::new(),
            routines: Vec::new(),
            definitions: HashMap::new(),
        }
    }

    pub fn mssql() -> Self {
        Self::new(SourceType::Mssql)
    }

    pub fn mysql() -> Self {
        Self::new(SourceType::Mysql)
    }

    pub fn with_table(mut self, table: Table, constraints: Vec<ConstraintDescriptor>) -> Self {
        self.tables.push((table, constraints));
        self
    }

    /// Listed by `list_tables` but gone by the time it is described.
    pub fn with_vanished_table(mut self, schema: &str, name: &str) -> Self {
        self.vanished.push(TableRef::new(schema, name));
        self
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.rows.insert(table.to_string(), rows);
        self
    }

    /// Reading rows of `table` fails after the first batch.
    pub fn with_failing_stream(mut self, table: &str) -> Self {
        self.failing_streams.insert(table.to_string());
        self
    }

    pub fn with_routine(mut self, routine: RoutineDescriptor) -> Self {
        self.routines.push(routine);
        self
    }

    pub fn with_definition(mut self, name: &str, source: DefinitionSource, text: &str) -> Self {
        self.definitions
            .insert((name.to_string(), source_key(source)), Some(text.to_string()));
        self
    }

    pub fn with_failing_definition(mut self, name: &str, source: DefinitionSource) -> Self {
        self.definitions
            .insert((name.to_string(), source_key(source)), None);
        self
    }
}

#[async_trait]
impl SourceCatalog for FakeCatalog {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let mut refs: Vec<TableRef> = self
            .tables
            .iter()
            .map(|(t, _)| t.table_ref())
            .chain(self.vanished.iter().cloned())
            .filter(|t| t.schema == schema)
            .collect();
        refs.sort();
        Ok(refs)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        self.tables
            .iter()
            .find(|(t, _)| t.schema == table.schema && t.name == table.name)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| MigrateError::not_found("table", table.to_string()))
    }

    async fn describe_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        self.tables
            .iter()
            .find(|(t, _)| t.schema == table.schema && t.name == table.name)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| MigrateError::not_found("table", table.to_string()))
    }

    async fn list_routines(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        Ok(self
            .routines
            .iter()
            .filter(|r| r.schema == schema)
            .cloned()
            .collect())
    }

    async fn fetch_definition(
        &self,
        routine: &RoutineDescriptor,
        source: DefinitionSource,
    ) -> Result<Option<String>> {
        match self
            .definitions
            .get(&(routine.name.clone(), source_key(source)))
        {
            Some(Some(text)) => Ok(Some(text.clone())),
            Some(None) => Err(MigrateError::introspection(
                routine.full_name(),
                "scripted definition failure",
            )),
            None => Ok(None),
        }
    }

    async fn count_rows(&self, table: &Table) -> Result<i64> {
        Ok(self.rows.get(&table.name).map(|r| r.len()).unwrap_or(0) as i64)
    }

    async fn stream_rows(
        &self,
        table: &Table,
        batch_size: usize,
        sink: &mut dyn BatchSink,
    ) -> Result<u64> {
        let rows = self.rows.get(&table.name).cloned().unwrap_or_default();
        let mut total = 0u64;
        for (i, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
            if i > 0 && self.failing_streams.contains(&table.name) {
                return Err(MigrateError::introspection(
                    table.full_name(),
                    "scripted read failure",
                ));
            }
            total += chunk.len() as u64;
            sink.write_batch(Batch::new(chunk.to_vec())).await?;
        }
        Ok(total)
    }
}

static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^CREATE TABLE IF NOT EXISTS "((?:[^"]|"")*)"\."((?:[^"]|"")*)""#)
        .expect("valid regex")
});
static INLINE_PK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PRIMARY KEY \(([^)]*)\)").expect("valid regex"));
static ADD_CONSTRAINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^ALTER TABLE "((?:[^"]|"")*)"\."((?:[^"]|"")*)" ADD CONSTRAINT "((?:[^"]|"")*)" (PRIMARY KEY|UNIQUE|FOREIGN KEY) \(([^)]*)\)"#,
    )
    .expect("valid regex")
});
static CREATE_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^CREATE (?:OR REPLACE )?(VIEW|FUNCTION|TRIGGER) (?:"(?:[^"]|"")*"\.)?"((?:[^"]|"")*)""#,
    )
    .expect("valid regex")
});
static DROP_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^DROP (VIEW|FUNCTION|TRIGGER) IF EXISTS (?:"(?:[^"]|"")*"\.)?"((?:[^"]|"")*)""#,
    )
    .expect("valid regex")
});
static INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^INSERT INTO "((?:[^"]|"")*)"\."((?:[^"]|"")*)""#).expect("valid regex")
});
static TRUNCATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^TRUNCATE "((?:[^"]|"")*)"\."((?:[^"]|"")*)""#).expect("valid regex")
});

fn unquote(s: &str) -> String {
    s.replace("\"\"", "\"")
}

fn column_set(list: &str) -> Vec<String> {
    let mut cols: Vec<String> = list
        .split(',')
        .map(|c| unquote(c.trim().trim_matches('"')))
        .filter(|c| !c.is_empty())
        .collect();
    cols.sort();
    cols
}

#[derive(Debug, Clone, Default)]
struct TargetState {
    tables: BTreeSet<(String, String)>,
    primary_keys: BTreeSet<(String, String)>,
    unique_sets: BTreeSet<(String, String, Vec<String>)>,
    constraints: BTreeSet<(String, String, String)>,
    objects: BTreeSet<(RoutineKind, String)>,
    rows: BTreeMap<(String, String), i64>,
}

impl TargetState {
    /// Update the simulated catalog for one statement.
    fn apply(&mut self, sql: &str) {
        let sql = sql.trim_start();
        if let Some(c) = CREATE_TABLE_RE.captures(sql) {
            let key = (unquote(&c[1]), unquote(&c[2]));
            if let Some(pk) = INLINE_PK_RE.captures(sql) {
                self.primary_keys.insert(key.clone());
                self.unique_sets
                    .insert((key.0.clone(), key.1.clone(), column_set(&pk[1])));
            }
            self.tables.insert(key);
        } else if let Some(c) = ADD_CONSTRAINT_RE.captures(sql) {
            let (schema, table, name) = (unquote(&c[1]), unquote(&c[2]), unquote(&c[3]));
            match &c[4] {
                "PRIMARY KEY" => {
                    self.primary_keys.insert((schema.clone(), table.clone()));
                    self.unique_sets
                        .insert((schema.clone(), table.clone(), column_set(&c[5])));
                }
                "UNIQUE" => {
                    self.unique_sets
                        .insert((schema.clone(), table.clone(), column_set(&c[5])));
                }
                _ => {}
            }
            self.constraints.insert((schema, table, name));
        } else if let Some(c) = CREATE_OBJECT_RE.captures(sql) {
            self.objects.insert((object_kind(&c[1]), unquote(&c[2])));
        } else if let Some(c) = DROP_OBJECT_RE.captures(sql) {
            self.objects.remove(&(object_kind(&c[1]), unquote(&c[2])));
        } else if let Some(c) = INSERT_RE.captures(sql) {
            let inserted = sql.lines().filter(|l| l.starts_with('(')).count() as i64;
            *self
                .rows
                .entry((unquote(&c[1]), unquote(&c[2])))
                .or_default() += inserted;
        } else if let Some(c) = TRUNCATE_RE.captures(sql) {
            self.rows.insert((unquote(&c[1]), unquote(&c[2])), 0);
        }
    }
}

fn object_kind(keyword: &str) -> RoutineKind {
    match keyword {
        "VIEW" => RoutineKind::View,
        "TRIGGER" => RoutineKind::Trigger,
        _ => RoutineKind::Function,
    }
}

#[derive(Debug, Default)]
struct Recorded {
    state: TargetState,
    statements: Vec<String>,
    transactions: Vec<Vec<String>>,
    rolled_back: Vec<Vec<String>>,
    max_values: HashMap<(String, String), i64>,
}

/// Target that records every statement and simulates the catalog effects
/// of the statements this crate emits.
#[derive(Debug, Default)]
pub struct RecordingTarget {
    inner: Mutex<Recorded>,
    fail_patterns: Vec<String>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements containing `pattern` fail.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.fail_patterns.push(pattern.to_string());
        self
    }

    pub fn with_existing(self, sql: &str) -> Self {
        self.lock().state.apply(sql);
        self
    }

    pub fn with_max_value(self, table: &str, column: &str, value: i64) -> Self {
        self.lock()
            .max_values
            .insert((table.to_string(), column.to_string()), value);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().expect("recording target lock")
    }

    fn check(&self, sql: &str) -> Result<()> {
        match self.fail_patterns.iter().find(|p| sql.contains(p.as_str())) {
            Some(p) => Err(MigrateError::ddl(
                "target",
                format!("scripted failure on '{}'", p),
            )),
            None => Ok(()),
        }
    }

    /// Every statement that reached the target, including rolled-back ones.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.lock().transactions.clone()
    }

    pub fn rolled_back(&self) -> Vec<Vec<String>> {
        self.lock().rolled_back.clone()
    }

    pub fn rows_in(&self, schema: &str, table: &str) -> i64 {
        self.lock()
            .state
            .rows
            .get(&(schema.to_string(), table.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_object(&self, name: &str, kind: RoutineKind) -> bool {
        self.lock().state.objects.contains(&(kind, name.to_string()))
    }
}

#[async_trait]
impl TargetExecutor for RecordingTarget {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.lock().statements.push(sql.to_string());
        self.check(sql)?;
        self.lock().state.apply(sql);
        Ok(0)
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        let mut inner = self.lock();
        let mut staged = inner.state.clone();
        for sql in statements {
            inner.statements.push(sql.clone());
            if let Err(e) = self.check(sql) {
                inner.rolled_back.push(statements.to_vec());
                return Err(e);
            }
            staged.apply(sql);
        }
        inner.state = staged;
        inner.transactions.push(statements.to_vec());
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .lock()
            .state
            .tables
            .contains(&(schema.to_string(), table.to_string())))
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .lock()
            .state
            .primary_keys
            .contains(&(schema.to_string(), table.to_string())))
    }

    async fn has_unique_or_pk(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
    ) -> Result<bool> {
        let mut cols = columns.to_vec();
        cols.sort();
        Ok(self
            .lock()
            .state
            .unique_sets
            .contains(&(schema.to_string(), table.to_string(), cols)))
    }

    async fn constraint_exists(&self, schema: &str, table: &str, name: &str) -> Result<bool> {
        Ok(self.lock().state.constraints.contains(&(
            schema.to_string(),
            table.to_string(),
            name.to_string(),
        )))
    }

    async fn object_exists(&self, _schema: &str, name: &str, kind: RoutineKind) -> Result<bool> {
        Ok(self.has_object(name, kind))
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64> {
        Ok(self.rows_in(schema, table))
    }

    async fn max_value(&self, _schema: &str, table: &str, column: &str) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .max_values
            .get(&(table.to_string(), column.to_string()))
            .copied())
    }
}

/// Collects progress events in arrival order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("listener lock").clone()
    }
}

impl ProgressListener for RecordingListener {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().expect("listener lock").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_target_simulates_constraints() {
        let target = RecordingTarget::new();
        target
            .execute(r#"ALTER TABLE "public"."p" ADD CONSTRAINT "uq_p_code" UNIQUE ("code")"#)
            .await
            .unwrap();
        assert!(target
            .has_unique_or_pk("public", "p", &["code".to_string()])
            .await
            .unwrap());
        assert!(target
            .constraint_exists("public", "p", "uq_p_code")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_state_untouched() {
        let target = RecordingTarget::new().fail_on("FOREIGN KEY");
        let result = target
            .execute_transaction(&[
                r#"ALTER TABLE "public"."p" ADD CONSTRAINT "uq_p_code" UNIQUE ("code")"#.into(),
                r#"ALTER TABLE "public"."c" ADD CONSTRAINT "fk" FOREIGN KEY ("x") REFERENCES "public"."p" ("code")"#.into(),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(target.rolled_back().len(), 1);
        assert!(!target
            .has_unique_or_pk("public", "p", &["code".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_insert_rows_are_counted() {
        let target = RecordingTarget::new();
        target
            .execute("INSERT INTO \"public\".\"t\" (\"id\") VALUES\n(1),\n(2)")
            .await
            .unwrap();
        assert_eq!(target.rows_in("public", "t"), 2);
        target
            .execute("TRUNCATE \"public\".\"t\" CASCADE")
            .await
            .unwrap();
        assert_eq!(target.rows_in("public", "t"), 0);
    }
}

//! MySQL/MariaDB source catalog over sqlx.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::Row;
use tracing::{debug, info};

use crate::config::{SourceConfig, SourceType};
use crate::core::identifier::{qualify_mysql, quote_mysql};
use crate::core::schema::{
    Column, ConstraintDescriptor, ForeignKeyTarget, ParamMode, ReferentialAction,
    RoutineDescriptor, RoutineKind, RoutineParameter, RoutineReturn, Table, TableRef, TriggerEvent,
    TriggerInfo, TriggerTiming,
};
use crate::core::traits::{BatchSink, DefinitionSource, SourceCatalog};
use crate::core::value::{Batch, Row as ValueRow, SqlValue};
use crate::error::{MigrateError, Result};
use crate::typemap::parse_declared_type;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// MySQL/MariaDB catalog reader.
pub struct MysqlCatalog {
    pool: MySqlPool,
}

impl MysqlCatalog {
    /// Connect and verify the connection with `SELECT 1`.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port())
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(MySqlSslMode::Preferred);

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MySQL source pool"))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::pool(e, "testing MySQL source connection"))?;

        info!(
            "Connected to MySQL source: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self { pool })
    }

    async fn load_columns(&self, table: &TableRef) -> Result<Vec<Column>> {
        // CAST to CHAR/SIGNED: information_schema may report VARBINARY and
        // unsigned widths depending on server collation.
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(DATA_TYPE AS CHAR(255)) AS DATA_TYPE,
                CAST(COLUMN_TYPE AS CHAR(1024)) AS COLUMN_TYPE,
                CAST(CASE
                    WHEN CHARACTER_MAXIMUM_LENGTH IS NULL THEN 0
                    WHEN CHARACTER_MAXIMUM_LENGTH > 2147483647 THEN -1
                    ELSE CHARACTER_MAXIMUM_LENGTH
                END AS SIGNED) AS max_length,
                CAST(COALESCE(NUMERIC_PRECISION, 0) AS SIGNED) AS num_precision,
                CAST(COALESCE(NUMERIC_SCALE, 0) AS SIGNED) AS num_scale,
                CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS is_nullable,
                CAST(IF(EXTRA LIKE '%auto_increment%', 1, 0) AS SIGNED) AS is_identity,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let data_type: String = row.try_get("DATA_TYPE")?;
            let column_type: String = row.try_get("COLUMN_TYPE")?;
            columns.push(column_from_catalog(
                row.try_get("COLUMN_NAME")?,
                &data_type,
                &column_type,
                row.try_get::<i64, _>("max_length")? as i32,
                row.try_get::<i64, _>("num_precision")? as i32,
                row.try_get::<i64, _>("num_scale")? as i32,
                row.try_get::<i64, _>("is_nullable")? == 1,
                row.try_get::<i64, _>("is_identity")? == 1,
                row.try_get::<i64, _>("ORDINAL_POSITION")? as i32,
            ));
        }

        debug!("Loaded {} columns for {}", columns.len(), table);
        Ok(columns)
    }

    async fn load_primary_key(&self, table: &TableRef) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("COLUMN_NAME").map_err(Into::into))
            .collect()
    }

    async fn load_foreign_keys(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        let query = r#"
            SELECT
                CAST(rc.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
                CAST(kcu.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(kcu.REFERENCED_TABLE_SCHEMA AS CHAR(255)) AS REFERENCED_TABLE_SCHEMA,
                CAST(kcu.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
                CAST(kcu.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME,
                CAST(rc.UPDATE_RULE AS CHAR(32)) AS UPDATE_RULE,
                CAST(rc.DELETE_RULE AS CHAR(32)) AS DELETE_RULE
            FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                ON rc.CONSTRAINT_SCHEMA = kcu.CONSTRAINT_SCHEMA
                AND rc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                AND rc.TABLE_NAME = kcu.TABLE_NAME
            WHERE rc.CONSTRAINT_SCHEMA = ? AND rc.TABLE_NAME = ?
            ORDER BY rc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        // Rows arrive grouped by constraint name.
        let mut fks: Vec<ConstraintDescriptor> = Vec::new();
        for row in rows {
            let name: String = row.try_get("CONSTRAINT_NAME")?;
            let column: String = row.try_get("COLUMN_NAME")?;
            let ref_column: String = row.try_get("REFERENCED_COLUMN_NAME")?;

            match fks.last_mut() {
                Some(fk) if fk.name == name => {
                    fk.columns.push(column);
                    if let Some(target) = fk.references.as_mut() {
                        target.columns.push(ref_column);
                    }
                }
                _ => {
                    let target = ForeignKeyTarget {
                        schema: row.try_get("REFERENCED_TABLE_SCHEMA")?,
                        table: row.try_get("REFERENCED_TABLE_NAME")?,
                        columns: vec![ref_column],
                        on_update: ReferentialAction::from_source(
                            &row.try_get::<String, _>("UPDATE_RULE")?,
                        ),
                        on_delete: ReferentialAction::from_source(
                            &row.try_get::<String, _>("DELETE_RULE")?,
                        ),
                    };
                    fks.push(ConstraintDescriptor::foreign_key(
                        name,
                        &table.schema,
                        &table.name,
                        vec![column],
                        target,
                    ));
                }
            }
        }

        debug!("Loaded {} foreign keys for {}", fks.len(), table);
        Ok(fks)
    }

    async fn load_procedures_and_functions(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let query = r#"
            SELECT
                CAST(ROUTINE_NAME AS CHAR(255)) AS ROUTINE_NAME,
                CAST(ROUTINE_TYPE AS CHAR(16)) AS ROUTINE_TYPE,
                CAST(DTD_IDENTIFIER AS CHAR(1024)) AS DTD_IDENTIFIER
            FROM INFORMATION_SCHEMA.ROUTINES
            WHERE ROUTINE_SCHEMA = ?
            ORDER BY ROUTINE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await?;

        let mut routines = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("ROUTINE_NAME")?;
            let routine_type: String = row.try_get("ROUTINE_TYPE")?;
            let kind = if routine_type.eq_ignore_ascii_case("FUNCTION") {
                RoutineKind::Function
            } else {
                RoutineKind::Procedure
            };

            let mut routine = RoutineDescriptor::new(kind, schema, &name);
            if kind == RoutineKind::Function {
                if let Some(dtd) = row.try_get::<Option<String>, _>("DTD_IDENTIFIER")? {
                    routine.returns = RoutineReturn::Scalar(parse_declared_type(&dtd));
                }
            }
            routine.parameters = self.load_parameters(schema, &name).await?;
            routines.push(routine);
        }
        Ok(routines)
    }

    async fn load_parameters(&self, schema: &str, routine: &str) -> Result<Vec<RoutineParameter>> {
        let query = r#"
            SELECT
                CAST(PARAMETER_NAME AS CHAR(255)) AS PARAMETER_NAME,
                CAST(COALESCE(PARAMETER_MODE, 'IN') AS CHAR(8)) AS PARAMETER_MODE,
                CAST(DTD_IDENTIFIER AS CHAR(1024)) AS DTD_IDENTIFIER
            FROM INFORMATION_SCHEMA.PARAMETERS
            WHERE SPECIFIC_SCHEMA = ? AND SPECIFIC_NAME = ? AND ORDINAL_POSITION > 0
            ORDER BY ORDINAL_POSITION
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .bind(routine)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<RoutineParameter> {
                let mode: String = row.try_get("PARAMETER_MODE")?;
                let dtd: String = row.try_get("DTD_IDENTIFIER")?;
                Ok(RoutineParameter {
                    name: row.try_get("PARAMETER_NAME")?,
                    mode: parse_param_mode(&mode),
                    data_type: parse_declared_type(&dtd),
                })
            })
            .collect()
    }

    async fn load_views(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.VIEWS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<RoutineDescriptor> {
                let name: String = row.try_get("TABLE_NAME")?;
                Ok(RoutineDescriptor::new(RoutineKind::View, schema, name))
            })
            .collect()
    }

    async fn load_triggers(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let query = r#"
            SELECT
                CAST(TRIGGER_NAME AS CHAR(255)) AS TRIGGER_NAME,
                CAST(EVENT_OBJECT_TABLE AS CHAR(255)) AS EVENT_OBJECT_TABLE,
                CAST(ACTION_TIMING AS CHAR(16)) AS ACTION_TIMING,
                CAST(EVENT_MANIPULATION AS CHAR(16)) AS EVENT_MANIPULATION
            FROM INFORMATION_SCHEMA.TRIGGERS
            WHERE TRIGGER_SCHEMA = ?
            ORDER BY TRIGGER_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<RoutineDescriptor> {
                let name: String = row.try_get("TRIGGER_NAME")?;
                let timing: String = row.try_get("ACTION_TIMING")?;
                let event: String = row.try_get("EVENT_MANIPULATION")?;
                let mut routine = RoutineDescriptor::new(RoutineKind::Trigger, schema, name);
                routine.trigger = Some(TriggerInfo {
                    table: row.try_get("EVENT_OBJECT_TABLE")?,
                    timing: TriggerTiming::from_source(&timing),
                    events: TriggerEvent::from_source(&event).into_iter().collect(),
                });
                Ok(routine)
            })
            .collect()
    }

    /// One text column of the first row, `None` when absent or blank.
    async fn first_text(&self, sql: &str, binds: &[&str], idx: usize) -> Result<Option<String>> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let row = query.fetch_optional(&self.pool).await?;
        let text = match row {
            Some(row) => text_at(&row, idx)?,
            None => None,
        };
        Ok(text.filter(|t| !t.trim().is_empty()))
    }
}

#[async_trait]
impl SourceCatalog for MysqlCatalog {
    fn source_type(&self) -> SourceType {
        SourceType::Mysql
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;

        let rows: Vec<MySqlRow> = sqlx::query(query)
            .bind(schema)
            .fetch_all(&self.pool)
            .await?;

        let tables = rows
            .iter()
            .map(|r| {
                r.try_get::<String, _>("TABLE_NAME")
                    .map(|name| TableRef::new(schema, name))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        info!("Found {} tables in MySQL schema '{}'", tables.len(), schema);
        Ok(tables)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Err(MigrateError::not_found("table", table.to_string()));
        }
        let primary_key = self.load_primary_key(table).await?;
        Table::new(&table.schema, &table.name, columns, primary_key)
    }

    async fn describe_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        let mut constraints = Vec::new();
        let pk = self.load_primary_key(table).await?;
        if !pk.is_empty() {
            constraints.push(ConstraintDescriptor::primary_key(
                "PRIMARY",
                &table.schema,
                &table.name,
                pk,
            ));
        }
        constraints.extend(self.load_foreign_keys(table).await?);
        Ok(constraints)
    }

    async fn list_routines(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let mut routines = self.load_views(schema).await?;
        routines.extend(self.load_procedures_and_functions(schema).await?);
        routines.extend(self.load_triggers(schema).await?);
        info!("Found {} routines in MySQL schema '{}'", routines.len(), schema);
        Ok(routines)
    }

    async fn fetch_definition(
        &self,
        routine: &RoutineDescriptor,
        source: DefinitionSource,
    ) -> Result<Option<String>> {
        let qualified = qualify_mysql(&routine.schema, &routine.name)?;
        let schema = routine.schema.as_str();
        let name = routine.name.as_str();

        match (source, routine.kind) {
            (DefinitionSource::Direct, RoutineKind::View) => {
                self.first_text(&format!("SHOW CREATE VIEW {}", qualified), &[], 1)
                    .await
            }
            (DefinitionSource::Direct, RoutineKind::Procedure) => {
                self.first_text(&format!("SHOW CREATE PROCEDURE {}", qualified), &[], 2)
                    .await
            }
            (DefinitionSource::Direct, RoutineKind::Function) => {
                self.first_text(&format!("SHOW CREATE FUNCTION {}", qualified), &[], 2)
                    .await
            }
            (DefinitionSource::Direct, RoutineKind::Trigger) => {
                self.first_text(&format!("SHOW CREATE TRIGGER {}", qualified), &[], 2)
                    .await
            }
            (DefinitionSource::CatalogMetadata, RoutineKind::View) => {
                self.first_text(
                    "SELECT VIEW_DEFINITION FROM INFORMATION_SCHEMA.VIEWS \
                     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                    &[schema, name],
                    0,
                )
                .await
            }
            (DefinitionSource::CatalogMetadata, RoutineKind::Trigger) => {
                self.first_text(
                    "SELECT ACTION_STATEMENT FROM INFORMATION_SCHEMA.TRIGGERS \
                     WHERE TRIGGER_SCHEMA = ? AND TRIGGER_NAME = ?",
                    &[schema, name],
                    0,
                )
                .await
            }
            (DefinitionSource::CatalogMetadata, kind) => {
                let routine_type = kind.as_str().to_uppercase();
                self.first_text(
                    "SELECT ROUTINE_DEFINITION FROM INFORMATION_SCHEMA.ROUTINES \
                     WHERE ROUTINE_SCHEMA = ? AND ROUTINE_NAME = ? AND ROUTINE_TYPE = ?",
                    &[schema, name, routine_type.as_str()],
                    0,
                )
                .await
            }
            (DefinitionSource::LegacyCatalog, RoutineKind::Procedure | RoutineKind::Function) => {
                let proc_type = routine.kind.as_str().to_uppercase();
                self.first_text(
                    "SELECT body FROM mysql.proc WHERE db = ? AND name = ? AND type = ?",
                    &[schema, name, proc_type.as_str()],
                    0,
                )
                .await
            }
            (DefinitionSource::LegacyCatalog, _) => Ok(None),
        }
    }

    async fn count_rows(&self, table: &Table) -> Result<i64> {
        let query = format!(
            "SELECT CAST(COUNT(*) AS SIGNED) AS cnt FROM {}",
            qualify_mysql(&table.schema, &table.name)?
        );
        let row: MySqlRow = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    async fn stream_rows(
        &self,
        table: &Table,
        batch_size: usize,
        sink: &mut dyn BatchSink,
    ) -> Result<u64> {
        let select_list = table
            .columns
            .iter()
            .map(select_expr)
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let mut query = format!(
            "SELECT {} FROM {}",
            select_list,
            qualify_mysql(&table.schema, &table.name)?
        );
        if table.has_pk() {
            let order = table
                .primary_key
                .iter()
                .map(|c| quote_mysql(c))
                .collect::<Result<Vec<_>>>()?;
            query.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }

        let mut stream = sqlx::query(&query).fetch(&self.pool);

        let mut total = 0u64;
        let mut pending: Vec<ValueRow> = Vec::with_capacity(batch_size);
        while let Some(row) = stream.try_next().await? {
            pending.push(convert_row(&row, &table.columns)?);
            if pending.len() >= batch_size {
                total += pending.len() as u64;
                let full = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
                sink.write_batch(Batch::new(full)).await?;
            }
        }
        if !pending.is_empty() {
            total += pending.len() as u64;
            sink.write_batch(Batch::new(pending)).await?;
        }

        debug!("Streamed {} rows from {}", total, table.full_name());
        Ok(total)
    }
}

/// Build a column descriptor from `information_schema.COLUMNS` fields.
///
/// `tinyint(1)` gets length 1 so it maps to boolean, `bit(n)` carries its
/// width as length, and unsigned integers get an ` unsigned` suffix.
#[allow(clippy::too_many_arguments)]
fn column_from_catalog(
    name: String,
    data_type: &str,
    column_type: &str,
    max_length: i32,
    precision: i32,
    scale: i32,
    is_nullable: bool,
    is_identity: bool,
    ordinal_pos: i32,
) -> Column {
    let data_type = data_type.to_lowercase();
    let column_type = column_type.to_lowercase();

    let max_length = if column_type.starts_with("tinyint(1)") {
        1
    } else if data_type == "bit" {
        precision
    } else {
        max_length
    };
    let data_type = if column_type.contains("unsigned") {
        format!("{} unsigned", data_type)
    } else {
        data_type
    };

    Column {
        name,
        data_type,
        max_length,
        precision,
        scale,
        is_nullable,
        is_identity,
        ordinal_pos,
    }
}

fn parse_param_mode(mode: &str) -> ParamMode {
    match mode.trim().to_uppercase().as_str() {
        "OUT" => ParamMode::Out,
        "INOUT" => ParamMode::InOut,
        _ => ParamMode::In,
    }
}

/// Column expression for the row cursor; types sqlx cannot decode directly
/// are converted on the server.
fn select_expr(col: &Column) -> Result<String> {
    let quoted = quote_mysql(&col.name)?;
    let base = col.data_type.trim_end_matches(" unsigned");
    Ok(match base {
        "bit" => format!("CAST({} AS UNSIGNED) AS {}", quoted, quoted),
        "year" => format!("CAST({} AS SIGNED) AS {}", quoted, quoted),
        "json" | "enum" | "set" => format!("CAST({} AS CHAR) AS {}", quoted, quoted),
        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" => {
            format!("ST_AsText({}) AS {}", quoted, quoted)
        }
        _ => quoted,
    })
}

fn convert_row(row: &MySqlRow, columns: &[Column]) -> Result<ValueRow> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, col)| convert_value(row, idx, col))
        .collect()
}

/// Convert one column of a MySQL row to an owned value, widening unsigned
/// integers to the next signed type.
fn convert_value(row: &MySqlRow, i: usize, col: &Column) -> Result<SqlValue> {
    let data_type = col.data_type.to_lowercase();
    let unsigned = data_type.ends_with(" unsigned");
    let base = data_type.trim_end_matches(" unsigned");

    let value = match base {
        "tinyint" if col.max_length == 1 => {
            if unsigned {
                row.try_get::<Option<u8>, _>(i)?.map(|v| SqlValue::Bool(v != 0))
            } else {
                row.try_get::<Option<i8>, _>(i)?.map(|v| SqlValue::Bool(v != 0))
            }
        }
        "bool" | "boolean" => row.try_get::<Option<i8>, _>(i)?.map(|v| SqlValue::Bool(v != 0)),
        "tinyint" if unsigned => row.try_get::<Option<u8>, _>(i)?.map(|v| SqlValue::I16(v as i16)),
        "tinyint" => row.try_get::<Option<i8>, _>(i)?.map(|v| SqlValue::I16(v as i16)),
        "smallint" if unsigned => row.try_get::<Option<u16>, _>(i)?.map(|v| SqlValue::I32(v as i32)),
        "smallint" => row.try_get::<Option<i16>, _>(i)?.map(SqlValue::I16),
        "mediumint" if unsigned => {
            row.try_get::<Option<u32>, _>(i)?.map(|v| SqlValue::I32(v as i32))
        }
        "int" | "integer" if unsigned => {
            row.try_get::<Option<u32>, _>(i)?.map(|v| SqlValue::I64(v as i64))
        }
        "mediumint" | "int" | "integer" => row.try_get::<Option<i32>, _>(i)?.map(SqlValue::I32),
        "bigint" if unsigned => row
            .try_get::<Option<u64>, _>(i)?
            .map(|v| SqlValue::Decimal(Decimal::from(v))),
        "bigint" => row.try_get::<Option<i64>, _>(i)?.map(SqlValue::I64),

        "decimal" | "numeric" | "dec" | "fixed" => {
            row.try_get::<Option<Decimal>, _>(i)?.map(SqlValue::Decimal)
        }
        "float" => row.try_get::<Option<f32>, _>(i)?.map(SqlValue::F32),
        "double" | "real" => row.try_get::<Option<f64>, _>(i)?.map(SqlValue::F64),

        "bit" => row
            .try_get::<Option<u64>, _>(i)?
            .map(|v| bit_value(v, col.max_length)),
        "year" => row
            .try_get::<Option<i64>, _>(i)?
            .map(|v| SqlValue::I16(v as i16)),

        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            row.try_get::<Option<Vec<u8>>, _>(i)?.map(SqlValue::Bytes)
        }

        // Zero dates ('0000-00-00') do not decode and are carried as NULL.
        "date" => row
            .try_get::<Option<NaiveDate>, _>(i)
            .ok()
            .flatten()
            .map(SqlValue::Date),
        "datetime" | "timestamp" => row
            .try_get::<Option<NaiveDateTime>, _>(i)
            .ok()
            .flatten()
            .map(SqlValue::DateTime),
        "time" => row.try_get::<Option<NaiveTime>, _>(i)?.map(SqlValue::Time),

        _ => text_at(row, i)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// `bit(1)` is a boolean; wider bit fields keep their big-endian bytes.
fn bit_value(value: u64, width: i32) -> SqlValue {
    if width <= 1 {
        return SqlValue::Bool(value != 0);
    }
    let len = ((width as usize) + 7) / 8;
    let bytes = value.to_be_bytes();
    SqlValue::Bytes(bytes[8 - len.min(8)..].to_vec())
}

/// Text column that may be reported as binary.
fn text_at(row: &MySqlRow, idx: usize) -> Result<Option<String>> {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(text) => Ok(text),
        Err(_) => Ok(row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|b| String::from_utf8_lossy(&b).into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_column(data_type: &str, column_type: &str, max_length: i32, precision: i32) -> Column {
        column_from_catalog(
            "c".into(),
            data_type,
            column_type,
            max_length,
            precision,
            0,
            true,
            false,
            1,
        )
    }

    #[test]
    fn test_tinyint1_gets_length_one() {
        let col = catalog_column("tinyint", "tinyint(1)", 0, 3);
        assert_eq!(col.data_type, "tinyint");
        assert_eq!(col.max_length, 1);

        let col = catalog_column("tinyint", "tinyint(4)", 0, 3);
        assert_eq!(col.max_length, 0);
    }

    #[test]
    fn test_unsigned_suffix() {
        let col = catalog_column("INT", "int(10) unsigned", 0, 10);
        assert_eq!(col.data_type, "int unsigned");
        let col = catalog_column("bigint", "bigint", 0, 19);
        assert_eq!(col.data_type, "bigint");
    }

    #[test]
    fn test_bit_width_from_precision() {
        let col = catalog_column("bit", "bit(12)", 0, 12);
        assert_eq!(col.max_length, 12);
    }

    #[test]
    fn test_bit_value() {
        assert_eq!(bit_value(1, 1), SqlValue::Bool(true));
        assert_eq!(bit_value(0, 1), SqlValue::Bool(false));
        assert_eq!(bit_value(0x0abc, 12), SqlValue::Bytes(vec![0x0a, 0xbc]));
    }

    #[test]
    fn test_parse_param_mode() {
        assert_eq!(parse_param_mode("IN"), ParamMode::In);
        assert_eq!(parse_param_mode("out"), ParamMode::Out);
        assert_eq!(parse_param_mode("INOUT"), ParamMode::InOut);
    }

    #[test]
    fn test_select_expr() {
        let mut col = catalog_column("bit", "bit(1)", 0, 1);
        col.name = "flag".into();
        assert_eq!(select_expr(&col).unwrap(), "CAST(`flag` AS UNSIGNED) AS `flag`");

        col.data_type = "point".into();
        assert_eq!(select_expr(&col).unwrap(), "ST_AsText(`flag`) AS `flag`");

        col.data_type = "int unsigned".into();
        assert_eq!(select_expr(&col).unwrap(), "`flag`");
    }
}

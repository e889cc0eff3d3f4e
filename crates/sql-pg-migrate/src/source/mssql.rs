//! SQL Server source catalog over tiberius with a bb8 pool.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SourceConfig, SourceType};
use crate::core::identifier::{qualify_mssql, quote_mssql};
use crate::core::schema::{
    Column, ConstraintDescriptor, DeclaredType, ForeignKeyTarget, ParamMode, ReferentialAction,
    RoutineDescriptor, RoutineKind, RoutineParameter, RoutineReturn, Table, TableRef, TriggerEvent,
    TriggerInfo, TriggerTiming,
};
use crate::core::traits::{BatchSink, DefinitionSource, SourceCatalog};
use crate::core::value::{Batch, Row as ValueRow, SqlValue};
use crate::error::{MigrateError, Result};

/// Resolves alias types to their system base type.
const TYPE_NAME_EXPR: &str =
    "CASE WHEN ty.is_user_defined = 1 THEN TYPE_NAME(ty.system_type_id) ELSE ty.name END";

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server catalog reader.
pub struct MssqlCatalog {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlCatalog {
    /// Connect and verify the connection with `SELECT 1`.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e, "creating SQL Server source pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| MigrateError::pool(e, "testing SQL Server source connection"))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            "Connected to SQL Server source: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self { pool })
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "acquiring SQL Server connection"))
    }

    async fn query_rows(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>> {
        let mut client = self.get_client().await?;
        let mut query = Query::new(sql);
        for p in params {
            query.bind(*p);
        }
        let stream = query.query(&mut *client).await?;
        Ok(stream.into_first_result().await?)
    }

    async fn load_columns(&self, table: &TableRef) -> Result<Vec<Column>> {
        let sql = format!(
            r#"
            SELECT
                c.name,
                {type_name},
                CAST(c.max_length AS INT),
                CAST(c.precision AS INT),
                CAST(c.scale AS INT),
                CAST(c.is_nullable AS INT),
                CAST(c.is_identity AS INT),
                CAST(c.column_id AS INT)
            FROM sys.columns c
            JOIN sys.tables t ON c.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            JOIN sys.types ty ON c.user_type_id = ty.user_type_id
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY c.column_id
            "#,
            type_name = TYPE_NAME_EXPR
        );

        let rows = self.query_rows(&sql, &[&table.schema, &table.name]).await?;
        let columns = rows
            .iter()
            .map(|row| Column {
                name: get_string(row, 0).unwrap_or_default(),
                data_type: get_string(row, 1).unwrap_or_default(),
                max_length: get_i32(row, 2).unwrap_or(0),
                precision: get_i32(row, 3).unwrap_or(0),
                scale: get_i32(row, 4).unwrap_or(0),
                is_nullable: get_i32(row, 5).unwrap_or(0) == 1,
                is_identity: get_i32(row, 6).unwrap_or(0) == 1,
                ordinal_pos: get_i32(row, 7).unwrap_or(0),
            })
            .collect::<Vec<_>>();

        debug!("Loaded {} columns for {}", columns.len(), table);
        Ok(columns)
    }

    /// Primary key name and ordered columns, if any.
    async fn load_primary_key(&self, table: &TableRef) -> Result<Option<(String, Vec<String>)>> {
        let sql = r#"
            SELECT i.name, c.name
            FROM sys.indexes i
            JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
            JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id
            JOIN sys.tables t ON i.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE i.is_primary_key = 1 AND s.name = @P1 AND t.name = @P2
            ORDER BY ic.key_ordinal
        "#;

        let rows = self.query_rows(sql, &[&table.schema, &table.name]).await?;
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let name = get_string(first, 0).unwrap_or_default();
        let columns = rows.iter().filter_map(|r| get_string(r, 1)).collect();
        Ok(Some((name, columns)))
    }

    async fn load_foreign_keys(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        let sql = r#"
            SELECT
                fk.name AS fk_name,
                STUFF((
                    SELECT ',' + pc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns pc2 ON fkc2.parent_object_id = pc2.object_id AND fkc2.parent_column_id = pc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS parent_columns,
                rs.name AS ref_schema,
                rt.name AS ref_table,
                STUFF((
                    SELECT ',' + rc2.name
                    FROM sys.foreign_key_columns fkc2
                    JOIN sys.columns rc2 ON fkc2.referenced_object_id = rc2.object_id AND fkc2.referenced_column_id = rc2.column_id
                    WHERE fkc2.constraint_object_id = fk.object_id
                    ORDER BY fkc2.constraint_column_id
                    FOR XML PATH('')
                ), 1, 1, '') AS ref_columns,
                fk.update_referential_action_desc,
                fk.delete_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            WHERE ps.name = @P1 AND pt.name = @P2
            ORDER BY fk.name
        "#;

        let rows = self.query_rows(sql, &[&table.schema, &table.name]).await?;
        let fks = rows
            .iter()
            .map(|row| {
                let target = ForeignKeyTarget {
                    schema: get_string(row, 2).unwrap_or_default(),
                    table: get_string(row, 3).unwrap_or_default(),
                    columns: split_list(&get_string(row, 4).unwrap_or_default()),
                    on_update: ReferentialAction::from_source(
                        &get_string(row, 5).unwrap_or_default(),
                    ),
                    on_delete: ReferentialAction::from_source(
                        &get_string(row, 6).unwrap_or_default(),
                    ),
                };
                ConstraintDescriptor::foreign_key(
                    get_string(row, 0).unwrap_or_default(),
                    &table.schema,
                    &table.name,
                    split_list(&get_string(row, 1).unwrap_or_default()),
                    target,
                )
            })
            .collect::<Vec<_>>();

        debug!("Loaded {} foreign keys for {}", fks.len(), table);
        Ok(fks)
    }

    async fn load_parameters(&self, object_id: i32) -> Result<Vec<(i32, RoutineParameter)>> {
        let sql = format!(
            r#"
            SELECT
                CAST(p.parameter_id AS INT),
                p.name,
                {type_name},
                CAST(p.max_length AS INT),
                CAST(p.precision AS INT),
                CAST(p.scale AS INT),
                CAST(p.is_output AS INT)
            FROM sys.parameters p
            JOIN sys.types ty ON p.user_type_id = ty.user_type_id
            WHERE p.object_id = @P1
            ORDER BY p.parameter_id
            "#,
            type_name = TYPE_NAME_EXPR
        );

        let mut client = self.get_client().await?;
        let mut query = Query::new(sql);
        query.bind(object_id);
        let rows = query.query(&mut *client).await?.into_first_result().await?;

        Ok(rows
            .iter()
            .map(|row| {
                let mode = if get_i32(row, 6).unwrap_or(0) == 1 {
                    ParamMode::Out
                } else {
                    ParamMode::In
                };
                let param = RoutineParameter {
                    name: get_string(row, 1)
                        .unwrap_or_default()
                        .trim_start_matches('@')
                        .to_string(),
                    mode,
                    data_type: DeclaredType::new(
                        get_string(row, 2).unwrap_or_default(),
                        get_i32(row, 3).unwrap_or(0),
                        get_i32(row, 4).unwrap_or(0),
                        get_i32(row, 5).unwrap_or(0),
                    ),
                };
                (get_i32(row, 0).unwrap_or(0), param)
            })
            .collect())
    }

    async fn load_trigger(&self, object_id: i32) -> Result<Option<TriggerInfo>> {
        let sql = r#"
            SELECT
                OBJECT_NAME(tr.parent_id),
                CAST(tr.is_instead_of_trigger AS INT),
                te.type_desc
            FROM sys.triggers tr
            JOIN sys.trigger_events te ON te.object_id = tr.object_id
            WHERE tr.object_id = @P1
        "#;

        let mut client = self.get_client().await?;
        let mut query = Query::new(sql);
        query.bind(object_id);
        let rows = query.query(&mut *client).await?.into_first_result().await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let timing = if get_i32(first, 1).unwrap_or(0) == 1 {
            TriggerTiming::InsteadOf
        } else {
            TriggerTiming::After
        };
        let events = rows
            .iter()
            .filter_map(|r| get_string(r, 2))
            .filter_map(|e| TriggerEvent::from_source(&e))
            .collect();

        Ok(Some(TriggerInfo {
            table: get_string(first, 0).unwrap_or_default(),
            timing,
            events,
        }))
    }

    async fn scalar_text(&self, sql: &str, qualified: &str) -> Result<Option<String>> {
        let rows = self.query_rows(sql, &[qualified]).await?;
        let text: String = rows.iter().filter_map(|r| get_string(r, 0)).collect();
        Ok(Some(text).filter(|t| !t.trim().is_empty()))
    }
}

#[async_trait]
impl SourceCatalog for MssqlCatalog {
    fn source_type(&self) -> SourceType {
        SourceType::Mssql
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableRef>> {
        let sql = r#"
            SELECT t.name
            FROM sys.tables t
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.is_ms_shipped = 0
            ORDER BY t.name
        "#;

        let rows = self.query_rows(sql, &[schema]).await?;
        let tables = rows
            .iter()
            .filter_map(|r| get_string(r, 0))
            .map(|name| TableRef::new(schema, name))
            .collect::<Vec<_>>();

        info!("Found {} tables in schema '{}'", tables.len(), schema);
        Ok(tables)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<Table> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Err(MigrateError::not_found("table", table.to_string()));
        }
        let primary_key = self
            .load_primary_key(table)
            .await?
            .map(|(_, cols)| cols)
            .unwrap_or_default();
        Table::new(&table.schema, &table.name, columns, primary_key)
    }

    async fn describe_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintDescriptor>> {
        let mut constraints = Vec::new();
        if let Some((name, columns)) = self.load_primary_key(table).await? {
            constraints.push(ConstraintDescriptor::primary_key(
                name,
                &table.schema,
                &table.name,
                columns,
            ));
        }
        constraints.extend(self.load_foreign_keys(table).await?);
        Ok(constraints)
    }

    async fn list_routines(&self, schema: &str) -> Result<Vec<RoutineDescriptor>> {
        let sql = r#"
            SELECT o.object_id, o.name, RTRIM(o.type)
            FROM sys.objects o
            JOIN sys.schemas s ON o.schema_id = s.schema_id
            WHERE s.name = @P1
              AND o.is_ms_shipped = 0
              AND o.type IN ('V', 'P', 'FN', 'IF', 'TF', 'TR')
            ORDER BY o.name
        "#;

        let rows = self.query_rows(sql, &[schema]).await?;
        let objects: Vec<(i32, String, String)> = rows
            .iter()
            .filter_map(|r| Some((get_i32(r, 0)?, get_string(r, 1)?, get_string(r, 2)?)))
            .collect();

        let mut routines = Vec::with_capacity(objects.len());
        for (object_id, name, type_code) in objects {
            let kind = match type_code.as_str() {
                "V" => RoutineKind::View,
                "P" => RoutineKind::Procedure,
                "TR" => RoutineKind::Trigger,
                _ => RoutineKind::Function,
            };
            let mut routine = RoutineDescriptor::new(kind, schema, name);

            match kind {
                RoutineKind::Procedure | RoutineKind::Function => {
                    for (position, param) in self.load_parameters(object_id).await? {
                        if position == 0 {
                            routine.returns = RoutineReturn::Scalar(param.data_type);
                        } else {
                            routine.parameters.push(param);
                        }
                    }
                    if matches!(type_code.as_str(), "IF" | "TF") {
                        routine.returns = RoutineReturn::Table;
                    }
                }
                RoutineKind::Trigger => {
                    routine.trigger = self.load_trigger(object_id).await?;
                }
                RoutineKind::View => {}
            }

            routines.push(routine);
        }

        info!("Found {} routines in schema '{}'", routines.len(), schema);
        Ok(routines)
    }

    async fn fetch_definition(
        &self,
        routine: &RoutineDescriptor,
        source: DefinitionSource,
    ) -> Result<Option<String>> {
        let qualified = qualify_mssql(&routine.schema, &routine.name)?;
        let sql = match source {
            DefinitionSource::Direct => "SELECT OBJECT_DEFINITION(OBJECT_ID(@P1))",
            DefinitionSource::CatalogMetadata => {
                "SELECT m.definition FROM sys.sql_modules m WHERE m.object_id = OBJECT_ID(@P1)"
            }
            DefinitionSource::LegacyCatalog => {
                "SELECT c.text FROM syscomments c WHERE c.id = OBJECT_ID(@P1) ORDER BY c.colid"
            }
        };
        self.scalar_text(sql, &qualified).await
    }

    async fn count_rows(&self, table: &Table) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {}",
            qualify_mssql(&table.schema, &table.name)?
        );
        let mut client = self.get_client().await?;
        let row = client.simple_query(sql).await?.into_row().await?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .unwrap_or(0))
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
        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list,
            qualify_mssql(&table.schema, &table.name)?
        );
        if table.has_pk() {
            let order = table
                .primary_key
                .iter()
                .map(|c| quote_mssql(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }

        let mut client = self.get_client().await?;
        let mut stream = client.simple_query(sql).await?.into_row_stream();

        let mut total = 0u64;
        let mut pending: Vec<ValueRow> = Vec::with_capacity(batch_size);
        while let Some(row) = stream.try_next().await? {
            pending.push(convert_row(&row, &table.columns));
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

/// Column expression for the row cursor; types tiberius cannot decode are
/// converted to text on the server.
fn select_expr(col: &Column) -> Result<String> {
    let quoted = quote_mssql(&col.name)?;
    Ok(match col.data_type.to_lowercase().as_str() {
        "geometry" | "geography" => format!("{}.STAsText() AS {}", quoted, quoted),
        "hierarchyid" => format!("{}.ToString() AS {}", quoted, quoted),
        "xml" | "sql_variant" => format!("CAST({} AS NVARCHAR(MAX)) AS {}", quoted, quoted),
        _ => quoted,
    })
}

fn convert_row(row: &Row, columns: &[Column]) -> ValueRow {
    columns
        .iter()
        .enumerate()
        .map(|(idx, col)| convert_value(row, idx, col))
        .collect()
}

/// Convert one column of a tiberius row to an owned value based on its
/// declared type.
fn convert_value(row: &Row, idx: usize, col: &Column) -> SqlValue {
    let name = col.name.as_str();
    let value = match col.data_type.to_lowercase().as_str() {
        "bit" => decoded(row.try_get::<bool, _>(idx), name).map(SqlValue::Bool),
        "tinyint" => decoded(row.try_get::<u8, _>(idx), name).map(|v| SqlValue::I16(v as i16)),
        "smallint" => decoded(row.try_get::<i16, _>(idx), name).map(SqlValue::I16),
        "int" => decoded(row.try_get::<i32, _>(idx), name).map(SqlValue::I32),
        "bigint" => decoded(row.try_get::<i64, _>(idx), name).map(SqlValue::I64),
        "real" => decoded(row.try_get::<f32, _>(idx), name).map(SqlValue::F32),
        "float" => decoded(row.try_get::<f64, _>(idx), name).map(SqlValue::F64),
        "decimal" | "numeric" | "money" | "smallmoney" => match row.try_get::<Decimal, _>(idx) {
            Ok(v) => v.map(SqlValue::Decimal),
            Err(_) => decoded(row.try_get::<f64, _>(idx), name).map(|f| {
                Decimal::try_from(f)
                    .map(SqlValue::Decimal)
                    .unwrap_or(SqlValue::F64(f))
            }),
        },
        "uniqueidentifier" => decoded(row.try_get::<Uuid, _>(idx), name).map(SqlValue::Uuid),
        "date" => decoded(row.try_get::<NaiveDate, _>(idx), name).map(SqlValue::Date),
        "time" => decoded(row.try_get::<NaiveTime, _>(idx), name).map(SqlValue::Time),
        "datetime" | "datetime2" | "smalldatetime" => {
            decoded(row.try_get::<NaiveDateTime, _>(idx), name).map(SqlValue::DateTime)
        }
        "datetimeoffset" => decoded(row.try_get::<DateTime<FixedOffset>, _>(idx), name)
            .map(SqlValue::DateTimeOffset),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => {
            decoded(row.try_get::<&[u8], _>(idx), name).map(|b| SqlValue::Bytes(b.to_vec()))
        }
        _ => decoded(row.try_get::<&str, _>(idx), name).map(|s| SqlValue::Text(s.to_string())),
    };
    value.unwrap_or(SqlValue::Null)
}

/// A decode failure is written as NULL, with a warning naming the column.
fn decoded<T>(result: tiberius::Result<Option<T>>, column: &str) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(column = %column, error = %e, "Value could not be decoded, writing NULL");
            None
        }
    }
}

fn get_string(row: &Row, idx: usize) -> Option<String> {
    row.try_get::<&str, _>(idx)
        .ok()
        .flatten()
        .map(str::to_string)
}

fn get_i32(row: &Row, idx: usize) -> Option<i32> {
    row.try_get::<i32, _>(idx).ok().flatten()
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

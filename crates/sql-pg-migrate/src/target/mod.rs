//! PostgreSQL target: connection, statement execution and catalog checks.

pub mod ddl;
mod tls;

pub use ddl::DdlSynthesizer;
pub use tls::SslMode;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{types::ToSql, Config as PgConfig, NoTls};
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::RoutineKind;
use crate::core::traits::TargetExecutor;
use crate::error::{MigrateError, Result};

/// PostgreSQL target holding a single pooled connection for the run.
pub struct PgTarget {
    pool: Pool,
}

impl PgTarget {
    /// Connect to the target and verify the connection with `SELECT 1`.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("sql-pg-migrate");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match ssl_mode.connector() {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        let pool = Pool::builder(mgr)
            .max_size(1)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?;

        let target = Self { pool };
        target.ping().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (ssl_mode={:?})",
            config.host, config.port, config.database, ssl_mode
        );
        Ok(target)
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting PostgreSQL connection"))
    }

    async fn query_exists(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<bool> {
        let client = self.client().await?;
        let row = client.query_one(sql, params).await?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl TargetExecutor for PgTarget {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.client().await?;
        let affected = client.execute(sql, &[]).await?;
        debug!("Executed statement, {} rows affected", affected);
        Ok(affected)
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        for sql in statements {
            // Dropping `tx` on error rolls the transaction back.
            tx.batch_execute(sql).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        self.query_exists(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )",
            &[&schema, &table],
        )
        .await
    }

    async fn has_primary_key(&self, schema: &str, table: &str) -> Result<bool> {
        self.query_exists(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.table_constraints
                WHERE constraint_type = 'PRIMARY KEY'
                AND table_schema = $1
                AND table_name = $2
            )",
            &[&schema, &table],
        )
        .await
    }

    async fn has_unique_or_pk(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
    ) -> Result<bool> {
        // Any non-partial unique index covers PK, UNIQUE constraints and
        // plain unique indexes, all of which satisfy a foreign key.
        let columns: Vec<String> = columns.to_vec();
        self.query_exists(
            "SELECT EXISTS (
                SELECT 1
                FROM pg_index i
                JOIN pg_class rel ON rel.oid = i.indrelid
                JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
                WHERE nsp.nspname = $1
                AND rel.relname = $2
                AND i.indisunique
                AND i.indpred IS NULL
                AND (
                    SELECT array_agg(att.attname::text ORDER BY att.attname::text)
                    FROM pg_attribute att
                    WHERE att.attrelid = i.indrelid AND att.attnum = ANY(i.indkey)
                ) = (
                    SELECT array_agg(c ORDER BY c) FROM unnest($3::text[]) AS c
                )
            )",
            &[&schema, &table, &columns],
        )
        .await
    }

    async fn constraint_exists(&self, schema: &str, table: &str, name: &str) -> Result<bool> {
        self.query_exists(
            "SELECT EXISTS (
                SELECT 1
                FROM pg_constraint con
                JOIN pg_class rel ON rel.oid = con.conrelid
                JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
                WHERE nsp.nspname = $1 AND rel.relname = $2 AND con.conname = $3
            )",
            &[&schema, &table, &name],
        )
        .await
    }

    async fn object_exists(&self, schema: &str, name: &str, kind: RoutineKind) -> Result<bool> {
        let sql = match kind {
            RoutineKind::View => {
                "SELECT EXISTS (
                    SELECT 1 FROM pg_views WHERE schemaname = $1 AND viewname = $2
                )"
            }
            RoutineKind::Procedure | RoutineKind::Function => {
                "SELECT EXISTS (
                    SELECT 1
                    FROM pg_proc p
                    JOIN pg_namespace n ON n.oid = p.pronamespace
                    WHERE n.nspname = $1 AND p.proname = $2
                )"
            }
            RoutineKind::Trigger => {
                "SELECT EXISTS (
                    SELECT 1
                    FROM pg_trigger t
                    JOIN pg_class c ON c.oid = t.tgrelid
                    JOIN pg_namespace n ON n.oid = c.relnamespace
                    WHERE n.nspname = $1 AND t.tgname = $2 AND NOT t.tgisinternal
                )"
            }
        };
        self.query_exists(sql, &[&schema, &name]).await
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", qualify_pg(schema, table)?);
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn max_value(&self, schema: &str, table: &str, column: &str) -> Result<Option<i64>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            quote_pg(column)?,
            qualify_pg(schema, table)?
        );
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }
}

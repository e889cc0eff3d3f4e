//! Primary and foreign key migration with uniqueness repair.
//!
//! Each constraint is applied in its own transaction. A foreign key whose
//! referenced columns carry no primary key or unique constraint first gets a
//! deterministically named `UNIQUE` constraint in that same transaction, so a
//! failed foreign key never leaves a half-applied repair behind.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::identifier::{
    derive_pg_name, qualify_pg, quote_pg, quote_pg_list, PG_MAX_IDENTIFIER_BYTES,
};
use crate::core::schema::{ConstraintDescriptor, ConstraintKind, ForeignKeyTarget};
use crate::core::traits::TargetExecutor;
use crate::error::{MigrateError, Result};

/// Progress of one constraint through migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintState {
    Pending,
    UniquenessChecked,
    UniquenessRepaired,
    Applied,
    AlreadyPresent,
    Failed,
}

/// Result of migrating one constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintOutcome {
    /// Constraint name on the target.
    pub name: String,
    pub kind: ConstraintKind,
    pub state: ConstraintState,
    /// Unique constraint created on the referenced table, if one was needed.
    pub repaired_unique: Option<String>,
}

/// Applies constraint descriptors to tables in the target schema.
pub struct ConstraintMigrator<'a> {
    target: &'a dyn TargetExecutor,
    target_schema: String,
}

impl<'a> ConstraintMigrator<'a> {
    pub fn new(target: &'a dyn TargetExecutor, target_schema: impl Into<String>) -> Self {
        Self {
            target,
            target_schema: target_schema.into(),
        }
    }

    /// Primary keys first, then foreign keys, each group in discovery order.
    pub fn order(constraints: &[ConstraintDescriptor]) -> Vec<ConstraintDescriptor> {
        let mut ordered: Vec<ConstraintDescriptor> = constraints.to_vec();
        ordered.sort_by_key(|c| match c.kind {
            ConstraintKind::PrimaryKey => 0,
            ConstraintKind::ForeignKey => 1,
        });
        ordered
    }

    /// Migrate one constraint. Errors are constraint errors and leave the
    /// target as it was before the call.
    pub async fn migrate(&self, constraint: &ConstraintDescriptor) -> Result<ConstraintOutcome> {
        let result = match constraint.kind {
            ConstraintKind::PrimaryKey => self.migrate_primary_key(constraint).await,
            ConstraintKind::ForeignKey => self.migrate_foreign_key(constraint).await,
        };
        result.map_err(|e| match e {
            MigrateError::Constraint { .. } => e,
            other => MigrateError::constraint(constraint.full_name(), other),
        })
    }

    /// Target name for a primary key: `pk_<table>`.
    pub fn primary_key_name(&self, constraint: &ConstraintDescriptor) -> String {
        derive_pg_name("pk", &[&constraint.table])
    }

    /// Target name for a foreign key: the source name when it fits.
    pub fn foreign_key_name(&self, constraint: &ConstraintDescriptor) -> String {
        if constraint.name.len() <= PG_MAX_IDENTIFIER_BYTES && !constraint.name.is_empty() {
            constraint.name.clone()
        } else {
            let mut parts: Vec<&str> = vec![&constraint.table];
            parts.extend(constraint.columns.iter().map(String::as_str));
            derive_pg_name("fk", &parts)
        }
    }

    /// Target name for a repaired unique constraint: `uq_<table>_<cols>`.
    pub fn unique_name(&self, table: &str, columns: &[String]) -> String {
        let mut parts: Vec<&str> = vec![table];
        parts.extend(columns.iter().map(String::as_str));
        derive_pg_name("uq", &parts)
    }

    pub fn primary_key_statement(&self, constraint: &ConstraintDescriptor) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
            qualify_pg(&self.target_schema, &constraint.table)?,
            quote_pg(&self.primary_key_name(constraint))?,
            quote_pg_list(&constraint.columns)?
        ))
    }

    pub fn unique_statement(&self, table: &str, columns: &[String]) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            qualify_pg(&self.target_schema, table)?,
            quote_pg(&self.unique_name(table, columns))?,
            quote_pg_list(columns)?
        ))
    }

    pub fn foreign_key_statement(&self, constraint: &ConstraintDescriptor) -> Result<String> {
        let target = references(constraint)?;
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
            qualify_pg(&self.target_schema, &constraint.table)?,
            quote_pg(&self.foreign_key_name(constraint))?,
            quote_pg_list(&constraint.columns)?,
            qualify_pg(&self.target_schema, &target.table)?,
            quote_pg_list(&target.columns)?,
            target.on_update.as_sql(),
            target.on_delete.as_sql()
        ))
    }

    async fn migrate_primary_key(
        &self,
        constraint: &ConstraintDescriptor,
    ) -> Result<ConstraintOutcome> {
        let name = self.primary_key_name(constraint);
        let mut outcome = ConstraintOutcome {
            name: name.clone(),
            kind: ConstraintKind::PrimaryKey,
            state: ConstraintState::Pending,
            repaired_unique: None,
        };

        if !self
            .target
            .table_exists(&self.target_schema, &constraint.table)
            .await?
        {
            return Err(MigrateError::constraint(
                &name,
                format!("table {}.{} does not exist on target", self.target_schema, constraint.table),
            ));
        }

        if self
            .target
            .has_primary_key(&self.target_schema, &constraint.table)
            .await?
        {
            debug!("{}: primary key already present", constraint.table);
            outcome.state = ConstraintState::AlreadyPresent;
            return Ok(outcome);
        }

        let sql = self.primary_key_statement(constraint)?;
        self.target
            .execute_transaction(&[sql])
            .await
            .map_err(|e| MigrateError::constraint(&name, e))?;

        info!("{}: added primary key {}", constraint.table, name);
        outcome.state = ConstraintState::Applied;
        Ok(outcome)
    }

    async fn migrate_foreign_key(
        &self,
        constraint: &ConstraintDescriptor,
    ) -> Result<ConstraintOutcome> {
        let target = references(constraint)?;
        let name = self.foreign_key_name(constraint);
        let mut outcome = ConstraintOutcome {
            name: name.clone(),
            kind: ConstraintKind::ForeignKey,
            state: ConstraintState::Pending,
            repaired_unique: None,
        };

        if self
            .target
            .constraint_exists(&self.target_schema, &constraint.table, &name)
            .await?
        {
            debug!("{}: foreign key {} already present", constraint.table, name);
            outcome.state = ConstraintState::AlreadyPresent;
            return Ok(outcome);
        }

        let is_unique = self
            .target
            .has_unique_or_pk(&self.target_schema, &target.table, &target.columns)
            .await?;
        outcome.state = ConstraintState::UniquenessChecked;

        let mut statements = Vec::with_capacity(2);
        if !is_unique {
            let unique = self.unique_name(&target.table, &target.columns);
            warn!(
                "{}: referenced columns {}({}) are not unique, adding {}",
                name,
                target.table,
                target.columns.join(", "),
                unique
            );
            statements.push(self.unique_statement(&target.table, &target.columns)?);
            outcome.repaired_unique = Some(unique);
            outcome.state = ConstraintState::UniquenessRepaired;
        }
        statements.push(self.foreign_key_statement(constraint)?);

        self.target
            .execute_transaction(&statements)
            .await
            .map_err(|e| MigrateError::constraint(&name, e))?;

        info!("{}: added foreign key {}", constraint.table, name);
        outcome.state = ConstraintState::Applied;
        Ok(outcome)
    }
}

fn references(constraint: &ConstraintDescriptor) -> Result<&ForeignKeyTarget> {
    constraint.references.as_ref().ok_or_else(|| {
        MigrateError::constraint(
            constraint.full_name(),
            "foreign key has no referenced table",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ReferentialAction;
    use crate::testing::RecordingTarget;

    fn fk(name: &str, child: &str, parent: &str, parent_col: &str) -> ConstraintDescriptor {
        ConstraintDescriptor::foreign_key(
            name,
            "dbo",
            child,
            vec!["parent_code".into()],
            ForeignKeyTarget {
                schema: "dbo".into(),
                table: parent.into(),
                columns: vec![parent_col.into()],
                on_update: ReferentialAction::NoAction,
                on_delete: ReferentialAction::Cascade,
            },
        )
    }

    fn target_with_tables() -> RecordingTarget {
        RecordingTarget::new()
            .with_existing(r#"CREATE TABLE IF NOT EXISTS "public"."parent" ("id" integer, "code" text, PRIMARY KEY ("id"))"#)
            .with_existing(r#"CREATE TABLE IF NOT EXISTS "public"."child" ("id" integer, "parent_code" text)"#)
    }

    #[tokio::test]
    async fn test_fk_on_non_unique_column_repairs_once() {
        let target = target_with_tables();
        let migrator = ConstraintMigrator::new(&target, "public");
        let constraint = fk("fk_child_parent", "child", "parent", "code");

        let outcome = migrator.migrate(&constraint).await.unwrap();
        assert_eq!(outcome.state, ConstraintState::Applied);
        assert_eq!(outcome.repaired_unique.as_deref(), Some("uq_parent_code"));

        let tx = target.transactions();
        assert_eq!(tx.len(), 1);
        assert!(tx[0][0].contains("UNIQUE (\"code\")"));
        assert!(tx[0][1].contains("FOREIGN KEY (\"parent_code\")"));
        assert!(tx[0][1].ends_with("ON UPDATE NO ACTION ON DELETE CASCADE"));
        assert!(target.constraint_exists("public", "parent", "uq_parent_code").await.unwrap());
        assert!(target.constraint_exists("public", "child", "fk_child_parent").await.unwrap());

        let again = migrator.migrate(&constraint).await.unwrap();
        assert_eq!(again.state, ConstraintState::AlreadyPresent);
        assert_eq!(target.count_matching("UNIQUE"), 1);
    }

    #[tokio::test]
    async fn test_fk_on_unique_column_skips_repair() {
        let target = target_with_tables();
        let migrator = ConstraintMigrator::new(&target, "public");

        // Same parent column, different FK name: uniqueness exists from the
        // first repair so no second UNIQUE is created.
        migrator
            .migrate(&fk("fk_a", "child", "parent", "code"))
            .await
            .unwrap();
        let second = migrator
            .migrate(&fk("fk_b", "child", "parent", "code"))
            .await
            .unwrap();
        assert_eq!(second.repaired_unique, None);
        assert_eq!(target.count_matching("UNIQUE"), 1);

        let on_pk = migrator
            .migrate(&fk("fk_c", "child", "parent", "id"))
            .await
            .unwrap();
        assert_eq!(on_pk.repaired_unique, None);
    }

    #[tokio::test]
    async fn test_failed_fk_rolls_back_repair_only_for_itself() {
        let target = target_with_tables().fail_on("\"fk_bad\"");
        let migrator = ConstraintMigrator::new(&target, "public");

        let err = migrator
            .migrate(&fk("fk_bad", "child", "parent", "code"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Constraint { .. }));
        assert!(!target
            .has_unique_or_pk("public", "parent", &["code".to_string()])
            .await
            .unwrap());

        let ok = migrator
            .migrate(&fk("fk_good", "child", "parent", "code"))
            .await
            .unwrap();
        assert_eq!(ok.state, ConstraintState::Applied);
    }

    #[tokio::test]
    async fn test_primary_key_added_or_present() {
        let target = target_with_tables();
        let migrator = ConstraintMigrator::new(&target, "public");

        let parent_pk = ConstraintDescriptor::primary_key("PK_parent", "dbo", "parent", vec!["id".into()]);
        assert_eq!(
            migrator.migrate(&parent_pk).await.unwrap().state,
            ConstraintState::AlreadyPresent
        );

        let child_pk = ConstraintDescriptor::primary_key("PK_child", "dbo", "child", vec!["id".into()]);
        let outcome = migrator.migrate(&child_pk).await.unwrap();
        assert_eq!(outcome.state, ConstraintState::Applied);
        assert_eq!(outcome.name, "pk_child");
        assert_eq!(
            target.statements().last().unwrap(),
            r#"ALTER TABLE "public"."child" ADD CONSTRAINT "pk_child" PRIMARY KEY ("id")"#
        );
    }

    #[tokio::test]
    async fn test_primary_key_on_missing_table_fails() {
        let target = RecordingTarget::new();
        let migrator = ConstraintMigrator::new(&target, "public");
        let pk = ConstraintDescriptor::primary_key("PK_x", "dbo", "x", vec!["id".into()]);
        assert!(matches!(
            migrator.migrate(&pk).await,
            Err(MigrateError::Constraint { .. })
        ));
    }

    #[test]
    fn test_order_puts_primary_keys_first() {
        let ordered = ConstraintMigrator::order(&[
            fk("fk_1", "child", "parent", "id"),
            ConstraintDescriptor::primary_key("pk_a", "dbo", "a", vec!["id".into()]),
            fk("fk_2", "child", "parent", "id"),
            ConstraintDescriptor::primary_key("pk_b", "dbo", "b", vec!["id".into()]),
        ]);
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["pk_a", "pk_b", "fk_1", "fk_2"]);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let target = RecordingTarget::new();
        let migrator = ConstraintMigrator::new(&target, "public");
        let long = "c".repeat(70);
        let name = migrator.unique_name(&long, &["code".to_string()]);
        assert!(name.len() <= PG_MAX_IDENTIFIER_BYTES);
        assert!(name.starts_with("uq_ccc"));

        let constraint = fk(&"f".repeat(80), "child", "parent", "id");
        assert!(migrator.foreign_key_name(&constraint).len() <= PG_MAX_IDENTIFIER_BYTES);
    }
}

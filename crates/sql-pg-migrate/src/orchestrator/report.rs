//! Per-item outcomes and the run report built from them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SourceType;
use crate::error::{ErrorKind, MigrateError, Result};

/// Stage an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    /// Table metadata read from the source.
    Introspection,
    /// Target schema and `CREATE TABLE`.
    Schema,
    Constraint,
    /// Row transfer of one table.
    Data,
    Routine,
}

impl ItemCategory {
    pub const ALL: [ItemCategory; 5] = [
        ItemCategory::Introspection,
        ItemCategory::Schema,
        ItemCategory::Constraint,
        ItemCategory::Data,
        ItemCategory::Routine,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
    /// Replaced by an inert stand-in.
    Stubbed,
    /// Not attempted because an earlier step for the same item failed.
    Skipped,
}

/// Result of one table, constraint or routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub category: ItemCategory,
    /// Qualified source name of the item.
    pub item: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(category: ItemCategory, item: impl Into<String>) -> Self {
        Self {
            category,
            item: item.into(),
            status: ItemStatus::Succeeded,
            error_kind: None,
            message: None,
        }
    }

    pub fn failed(category: ItemCategory, item: impl Into<String>, error: &MigrateError) -> Self {
        Self {
            category,
            item: item.into(),
            status: ItemStatus::Failed,
            error_kind: Some(error.kind()),
            message: Some(error.to_string()),
        }
    }

    pub fn skipped(category: ItemCategory, item: impl Into<String>, reason: &str) -> Self {
        Self {
            category,
            item: item.into(),
            status: ItemStatus::Skipped,
            error_kind: None,
            message: Some(reason.to_string()),
        }
    }

    /// Skipped because the item itself could not be read.
    pub fn skipped_on_error(
        category: ItemCategory,
        item: impl Into<String>,
        error: &MigrateError,
    ) -> Self {
        Self {
            status: ItemStatus::Skipped,
            ..Self::failed(category, item, error)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Outcome counts for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub category: ItemCategory,
    pub succeeded: usize,
    pub failed: usize,
    pub stubbed: usize,
    pub skipped: usize,
}

impl CategorySummary {
    fn count(category: ItemCategory, outcomes: &[ItemOutcome]) -> Self {
        let mut summary = Self {
            category,
            succeeded: 0,
            failed: 0,
            stubbed: 0,
            skipped: 0,
        };
        for o in outcomes.iter().filter(|o| o.category == category) {
            match o.status {
                ItemStatus::Succeeded => summary.succeeded += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Stubbed => summary.stubbed += 1,
                ItemStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.stubbed + self.skipped
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,
    pub source_type: SourceType,
    /// Fingerprint of the configuration the run used.
    pub config_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub rows_transferred: u64,
    /// Non-empty categories in pipeline order.
    pub summary: Vec<CategorySummary>,
    pub outcomes: Vec<ItemOutcome>,
}

impl MigrationReport {
    pub(crate) fn new(
        run_id: String,
        source_type: SourceType,
        config_fingerprint: String,
        started_at: DateTime<Utc>,
        rows_transferred: u64,
        outcomes: Vec<ItemOutcome>,
    ) -> Self {
        let completed_at = Utc::now();
        let summary = ItemCategory::ALL
            .iter()
            .map(|c| CategorySummary::count(*c, &outcomes))
            .filter(|s| s.total() > 0)
            .collect();
        Self {
            run_id,
            source_type,
            config_fingerprint,
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            rows_transferred,
            summary,
            outcomes,
        }
    }

    pub fn summary_for(&self, category: ItemCategory) -> CategorySummary {
        CategorySummary::count(category, &self.outcomes)
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ItemStatus::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed_items().next().is_some()
    }

    /// `completed`, or `completed_with_failures` when any item failed.
    pub fn status(&self) -> &'static str {
        if self.has_failures() {
            "completed_with_failures"
        } else {
            "completed"
        }
    }

    /// Process exit code: 0, or 5 when any item failed.
    pub fn exit_code(&self) -> u8 {
        if self.has_failures() {
            5
        } else {
            0
        }
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Row counts of one table on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
    pub matches: bool,
}

/// Statements a run would execute, produced without touching the target.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationPlan {
    /// Schema and table DDL followed by foreign keys.
    pub statements: Vec<String>,
    /// Tables in the order their rows would be transferred.
    pub transfer_order: Vec<String>,
    /// Per routine, its rewritten statements or why it would be stubbed.
    pub routines: Vec<PlannedRoutine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedRoutine {
    pub name: String,
    pub kind: String,
    pub statements: Vec<String>,
    /// Set when the routine would be replaced by a stub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stub_reason: Option<String>,
}

/// Connectivity of both ends.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

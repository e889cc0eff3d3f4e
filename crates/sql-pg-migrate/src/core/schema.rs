//! Descriptor types for tables, columns, constraints and routines.
//!
//! Descriptors are produced by a [`SourceCatalog`](crate::core::traits::SourceCatalog)
//! and consumed by the DDL, constraint, translation and transfer stages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Source data type name (e.g. "nvarchar", "decimal").
    pub data_type: String,

    /// Declared length in the source catalog's unit (-1 for MAX).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column accepts NULL.
    pub is_nullable: bool,

    /// Whether the column is an identity / auto-increment column.
    pub is_identity: bool,

    /// 1-based ordinal position.
    pub ordinal_pos: i32,
}

/// A (schema, table) pair as returned by table listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Columns in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,
}

impl Table {
    /// Build a table descriptor, ordering columns by ordinal position and
    /// rejecting primary key columns that are not table columns.
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        mut columns: Vec<Column>,
        primary_key: Vec<String>,
    ) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();
        columns.sort_by_key(|c| c.ordinal_pos);

        if let Some(missing) = primary_key
            .iter()
            .find(|pk| !columns.iter().any(|c| &c.name == *pk))
        {
            return Err(MigrateError::introspection(
                format!("{}.{}", schema, name),
                format!("primary key column {} is not a column of the table", missing),
            ));
        }

        Ok(Self {
            schema,
            name,
            columns,
            primary_key,
        })
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Identity columns, if any.
    pub fn identity_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_identity)
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.name)
    }
}

/// Referential action for a foreign key.
///
/// Source-specific actions outside this set normalize to `NoAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    SetDefault,
    #[default]
    NoAction,
}

impl ReferentialAction {
    /// Parse a catalog action string (`CASCADE`, `SET_NULL`, `SET NULL`, `RESTRICT`, ...).
    pub fn from_source(action: &str) -> Self {
        match action.trim().to_uppercase().replace('_', " ").as_str() {
            "CASCADE" => ReferentialAction::Cascade,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Kind of structural constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
}

/// Referenced side of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyTarget {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
}

/// Primary or foreign key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDescriptor {
    /// Constraint name in the source catalog.
    pub name: String,

    pub kind: ConstraintKind,

    /// Owning table schema.
    pub schema: String,

    /// Owning table name.
    pub table: String,

    /// Constrained columns, in key order.
    pub columns: Vec<String>,

    /// Referenced table for foreign keys.
    pub references: Option<ForeignKeyTarget>,
}

impl ConstraintDescriptor {
    pub fn primary_key(
        name: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::PrimaryKey,
            schema: schema.into(),
            table: table.into(),
            columns,
            references: None,
        }
    }

    pub fn foreign_key(
        name: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        references: ForeignKeyTarget,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::ForeignKey,
            schema: schema.into(),
            table: table.into(),
            columns,
            references: Some(references),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }
}

/// Kind of procedural object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineKind {
    View,
    Procedure,
    Function,
    Trigger,
}

impl RoutineKind {
    pub const ALL: [RoutineKind; 4] = [
        RoutineKind::View,
        RoutineKind::Procedure,
        RoutineKind::Function,
        RoutineKind::Trigger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RoutineKind::View => "view",
            RoutineKind::Procedure => "procedure",
            RoutineKind::Function => "function",
            RoutineKind::Trigger => "trigger",
        }
    }
}

impl fmt::Display for RoutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Translation status of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineStatus {
    #[default]
    Untranslated,
    Translated,
    Stubbed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerTiming {
    Before,
    After,
    InsteadOf,
}

impl TriggerTiming {
    pub fn from_source(timing: &str) -> Self {
        match timing.trim().to_uppercase().as_str() {
            "BEFORE" => TriggerTiming::Before,
            "INSTEAD OF" | "INSTEAD_OF" => TriggerTiming::InsteadOf,
            _ => TriggerTiming::After,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
            TriggerTiming::InsteadOf => "INSTEAD OF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

impl TriggerEvent {
    pub fn from_source(event: &str) -> Option<Self> {
        match event.trim().to_uppercase().as_str() {
            "INSERT" => Some(TriggerEvent::Insert),
            "UPDATE" => Some(TriggerEvent::Update),
            "DELETE" => Some(TriggerEvent::Delete),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
            TriggerEvent::Delete => "DELETE",
        }
    }
}

/// Owning table and firing rules of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub table: String,
    pub timing: TriggerTiming,
    pub events: Vec<TriggerEvent>,
}

/// A source type as declared on a parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredType {
    pub name: String,
    pub max_length: i32,
    pub precision: i32,
    pub scale: i32,
}

impl DeclaredType {
    pub fn new(name: impl Into<String>, max_length: i32, precision: i32, scale: i32) -> Self {
        Self {
            name: name.into(),
            max_length,
            precision,
            scale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

impl ParamMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            ParamMode::In => "IN",
            ParamMode::Out => "OUT",
            ParamMode::InOut => "INOUT",
        }
    }
}

/// Routine parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineParameter {
    /// Parameter name without any dialect sigil.
    pub name: String,
    pub mode: ParamMode,
    pub data_type: DeclaredType,
}

/// What a routine returns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineReturn {
    #[default]
    Void,
    Scalar(DeclaredType),
    Table,
    Trigger,
}

/// View, procedure, function or trigger metadata plus its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    pub kind: RoutineKind,
    pub schema: String,
    pub name: String,

    /// Owning table and firing rules (triggers only).
    pub trigger: Option<TriggerInfo>,

    pub parameters: Vec<RoutineParameter>,
    pub returns: RoutineReturn,

    /// Raw definition fetched from the source catalog.
    pub source_text: Option<String>,

    /// Target-dialect text, once translation has been attempted.
    pub translated_text: Option<String>,

    pub status: RoutineStatus,
}

impl RoutineDescriptor {
    pub fn new(kind: RoutineKind, schema: impl Into<String>, name: impl Into<String>) -> Self {
        let returns = match kind {
            RoutineKind::Trigger => RoutineReturn::Trigger,
            _ => RoutineReturn::Void,
        };
        Self {
            kind,
            schema: schema.into(),
            name: name.into(),
            trigger: None,
            parameters: Vec::new(),
            returns,
            source_text: None,
            translated_text: None,
            status: RoutineStatus::Untranslated,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn has_out_params(&self) -> bool {
        self.parameters
            .iter()
            .any(|p| matches!(p.mode, ParamMode::Out | ParamMode::InOut))
    }
}

//! Core abstractions shared by every migration stage.
//!
//! - [`schema`]: table, column, constraint and routine descriptors
//! - [`value`]: row values read from the source
//! - [`identifier`]: identifier quoting and derived names
//! - [`traits`]: the source catalog and target execution interfaces

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    Column, ConstraintDescriptor, ConstraintKind, DeclaredType, ForeignKeyTarget, ParamMode,
    ReferentialAction, RoutineDescriptor, RoutineKind, RoutineParameter, RoutineReturn,
    RoutineStatus, Table, TableRef, TriggerEvent, TriggerInfo, TriggerTiming,
};
pub use traits::{BatchSink, DefinitionSource, SourceCatalog, TargetExecutor};
pub use value::{Batch, Row, SqlValue};

//! Inert stand-ins for routines that could not be translated.
//!
//! A stub keeps the routine's name, kind and signature so dependents still
//! resolve, does nothing but raise a notice, and carries the original source
//! in a `COMMENT ON` for whoever finishes the port by hand.

use super::render::{
    function_statement, trigger_function_name, trigger_return, trigger_statements,
    view_statements, Signature,
};
use crate::core::identifier::{qualify_pg, quote_literal_pg, quote_pg};
use crate::core::schema::{RoutineDescriptor, RoutineKind};
use crate::error::{MigrateError, Result};

/// Statements creating the stub for `routine` in `schema`.
pub fn stub_statements(
    routine: &RoutineDescriptor,
    signature: &Signature,
    schema: &str,
    comment_limit: usize,
) -> Result<Vec<String>> {
    let comment = quote_literal_pg(&stub_comment(routine, comment_limit));
    let notice = format!(
        "RAISE NOTICE {};",
        quote_literal_pg(&format!(
            "not implemented: {}.{} requires manual migration",
            schema, routine.name
        )
        .replace('%', "%%"))
    );

    match routine.kind {
        RoutineKind::View => {
            let mut statements = view_statements(
                schema,
                &routine.name,
                "SELECT NULL::text AS requires_manual_migration WHERE false",
            )?;
            statements.push(format!(
                "COMMENT ON VIEW {} IS {}",
                qualify_pg(schema, &routine.name)?,
                comment
            ));
            Ok(statements)
        }
        RoutineKind::Procedure | RoutineKind::Function => {
            let ret = if signature.returns_void() || signature.returns_set() {
                "RETURN;"
            } else {
                "RETURN NULL;"
            };
            let body = format!("{}\n{}", notice, ret);
            Ok(vec![
                function_statement(schema, &routine.name, signature, &[], &body)?,
                format!(
                    "COMMENT ON FUNCTION {}({}) IS {}",
                    qualify_pg(schema, &routine.name)?,
                    signature.identity_args,
                    comment
                ),
            ])
        }
        RoutineKind::Trigger => {
            let info = routine.trigger.as_ref().ok_or_else(|| {
                MigrateError::translation(routine.full_name(), "trigger has no table binding")
            })?;
            let function = trigger_function_name(&routine.name);
            let body = format!("{}\n{}", notice, trigger_return(&info.events));
            let mut statements =
                vec![function_statement(schema, &function, signature, &[], &body)?];
            statements.extend(trigger_statements(schema, &routine.name, info)?);
            statements.push(format!(
                "COMMENT ON TRIGGER {} ON {} IS {}",
                quote_pg(&routine.name)?,
                qualify_pg(schema, &info.table)?,
                comment
            ));
            Ok(statements)
        }
    }
}

/// Comment text: a marker line plus the source, cut to `limit` characters.
fn stub_comment(routine: &RoutineDescriptor, limit: usize) -> String {
    let source = routine.source_text.as_deref().unwrap_or("");
    let mut kept: String = source.chars().take(limit).collect();
    if source.chars().count() > limit {
        kept.push_str("...");
    }
    format!(
        "requires manual migration: {} {}\n{}",
        routine.kind,
        routine.full_name(),
        kept
    )
}

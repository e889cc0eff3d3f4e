//! PostgreSQL DDL for translated and stubbed routines.

use tracing::warn;

use super::Declaration;
use crate::core::identifier::{derive_pg_name, qualify_pg, quote_pg};
use crate::core::schema::{
    ParamMode, RoutineDescriptor, RoutineKind, RoutineReturn, TriggerEvent, TriggerInfo,
    TriggerTiming,
};
use crate::error::{MigrateError, Result};
use crate::typemap::TypeMapper;

/// Parameter list and return clause of a target function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// `"p_id" integer, OUT "p_total" bigint`
    pub params: String,
    /// Argument types identifying the function: `integer`
    pub identity_args: String,
    pub returns: String,
    /// Count of `OUT` and `INOUT` parameters.
    pub out_params: usize,
}

impl Signature {
    /// Parameter names are folded to lower case and quoted, so reserved words
    /// stay valid and unquoted references in the body still resolve.
    pub fn for_routine(routine: &RoutineDescriptor, mapper: &dyn TypeMapper) -> Result<Self> {
        if routine.kind == RoutineKind::Trigger {
            return Ok(Self {
                params: String::new(),
                identity_args: String::new(),
                returns: "trigger".to_string(),
                out_params: 0,
            });
        }

        let mut params = Vec::new();
        let mut identity = Vec::new();
        let mut outputs = Vec::new();
        for p in &routine.parameters {
            let data_type = mapper.map_declared(&p.data_type).target_type;
            let prefix = match p.mode {
                ParamMode::In => "",
                ParamMode::Out => "OUT ",
                ParamMode::InOut => "INOUT ",
            };
            params.push(format!(
                "{}{} {}",
                prefix,
                quote_pg(&p.name.to_lowercase())?,
                data_type
            ));
            if p.mode != ParamMode::Out {
                identity.push(data_type.clone());
            }
            if p.mode != ParamMode::In {
                outputs.push(data_type);
            }
        }

        let returns = match (&routine.returns, outputs.as_slice()) {
            (RoutineReturn::Scalar(declared), _) => mapper.map_declared(declared).target_type,
            (RoutineReturn::Table, _) => "SETOF record".to_string(),
            (_, []) => "void".to_string(),
            (_, [single]) => single.clone(),
            _ => "record".to_string(),
        };

        Ok(Self {
            params: params.join(", "),
            identity_args: identity.join(", "),
            returns,
            out_params: outputs.len(),
        })
    }

    /// Whether `RETURN` must not carry a value.
    pub fn returns_void(&self) -> bool {
        self.returns == "void" || self.out_params > 0
    }

    pub fn returns_set(&self) -> bool {
        self.returns.starts_with("SETOF")
    }
}

/// Target name of the function behind a trigger.
pub fn trigger_function_name(trigger: &str) -> String {
    derive_pg_name(trigger, &["fn"])
}

/// A dollar-quote tag that does not occur in `body`.
pub fn dollar_tag(body: &str) -> String {
    let mut tag = "$fn$".to_string();
    let mut n = 1;
    while body.contains(&tag) {
        tag = format!("$fn{}$", n);
        n += 1;
    }
    tag
}

/// `CREATE OR REPLACE FUNCTION` with a PL/pgSQL body.
pub fn function_statement(
    schema: &str,
    name: &str,
    signature: &Signature,
    declarations: &[Declaration],
    body: &str,
) -> Result<String> {
    let mut block = String::new();
    if !declarations.is_empty() {
        block.push_str("DECLARE\n");
        for d in declarations {
            block.push_str(&format!("  {} {};\n", d.name, d.data_type));
        }
    }
    block.push_str("BEGIN\n");
    block.push_str(body.trim_end());
    block.push_str("\nEND;\n");

    let tag = dollar_tag(&block);
    Ok(format!(
        "CREATE OR REPLACE FUNCTION {}({})\nRETURNS {}\nLANGUAGE plpgsql\nSET search_path = {}\nAS {}\n{}{}",
        qualify_pg(schema, name)?,
        signature.params,
        signature.returns,
        quote_pg(schema)?,
        tag,
        block,
        tag
    ))
}

/// `RETURN` closing a trigger function for the given events.
pub fn trigger_return(events: &[TriggerEvent]) -> &'static str {
    let deletes = events.contains(&TriggerEvent::Delete);
    let others = events.iter().any(|e| *e != TriggerEvent::Delete);
    match (deletes, others) {
        (true, false) => "RETURN OLD;",
        (true, true) => "RETURN COALESCE(NEW, OLD);",
        _ => "RETURN NEW;",
    }
}

/// Drop and recreate the trigger binding its function to the table.
pub fn trigger_statements(schema: &str, name: &str, info: &TriggerInfo) -> Result<Vec<String>> {
    if info.events.is_empty() {
        return Err(MigrateError::translation(
            format!("{}.{}", schema, name),
            "trigger has no firing events",
        ));
    }
    let timing = match info.timing {
        TriggerTiming::InsteadOf => {
            warn!(
                trigger = %name,
                table = %info.table,
                "INSTEAD OF trigger on a table is bound as BEFORE"
            );
            TriggerTiming::Before
        }
        other => other,
    };
    let events: Vec<&str> = info.events.iter().map(|e| e.as_sql()).collect();
    let table = qualify_pg(schema, &info.table)?;

    Ok(vec![
        format!("DROP TRIGGER IF EXISTS {} ON {}", quote_pg(name)?, table),
        format!(
            "CREATE TRIGGER {} {} {} ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            quote_pg(name)?,
            timing.as_sql(),
            events.join(" OR "),
            table,
            qualify_pg(schema, &trigger_function_name(name))?
        ),
    ])
}

/// Statements recreating a view with `query`.
///
/// Dropping cascades to views built on this one. Views are created base
/// first, so those dependents are recreated later in the same run.
pub fn view_statements(schema: &str, name: &str, query: &str) -> Result<Vec<String>> {
    let view = qualify_pg(schema, name)?;
    Ok(vec![
        format!("SET LOCAL search_path TO {}", quote_pg(schema)?),
        format!("DROP VIEW IF EXISTS {} CASCADE", view),
        format!("CREATE VIEW {} AS\n{}", view, query.trim()),
    ])
}

//! T-SQL routine rewriting.

use super::lexer::{split_top_level, tokenize, Token, TokenKind};
use super::rules::{
    apply_splices, cast_types, concat_to_operator, conditional_expression,
    current_time_functions, date_part_functions, drop_sigils, matching_end, null_coalescing,
    replace_words, rewrite_calls, set_assignments, statement_end, strip_comments,
    strip_schema_qualifiers, terminate_statements, top_to_limit, unwrap_block, RewriteContext,
    RewriteRule, Splice, STATEMENT_WORDS,
};
use super::{Declaration, RoutineDialect};
use crate::core::schema::{DeclaredType, RoutineDescriptor, RoutineKind, RoutineReturn};
use crate::error::{MigrateError, Result};
use crate::typemap::{parse_declared_type, MssqlMapper, TypeMapper};

/// SQL Server views, procedures, functions and triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlRoutines;

const VIEW_RULES: &[RewriteRule] = &[
    RewriteRule { name: "strip_comments", apply: strip_comments },
    RewriteRule { name: "normalize_quotes", apply: normalize_quotes },
    RewriteRule { name: "strip_schema_qualifiers", apply: strip_schema_qualifiers },
    RewriteRule { name: "current_time", apply: current_time_functions },
    RewriteRule { name: "top_to_limit", apply: top_to_limit },
    RewriteRule { name: "concat", apply: concat_to_operator },
    RewriteRule { name: "null_coalescing", apply: null_coalescing },
    RewriteRule { name: "iif", apply: conditional_expression },
    RewriteRule { name: "date_parts", apply: date_part_functions },
    RewriteRule { name: "builtins", apply: builtin_functions },
    RewriteRule { name: "table_hints", apply: strip_table_hints },
];

const BODY_RULES: &[RewriteRule] = &[
    RewriteRule { name: "strip_comments", apply: strip_comments },
    RewriteRule { name: "normalize_quotes", apply: normalize_quotes },
    RewriteRule { name: "strip_schema_qualifiers", apply: strip_schema_qualifiers },
    RewriteRule { name: "session_options", apply: strip_session_options },
    RewriteRule { name: "terminate_statements", apply: terminate_statements },
    RewriteRule { name: "transaction_control", apply: neutralize_transaction_control },
    RewriteRule { name: "current_time", apply: current_time_functions },
    RewriteRule { name: "top_to_limit", apply: top_to_limit },
    RewriteRule { name: "concat", apply: concat_to_operator },
    RewriteRule { name: "null_coalescing", apply: null_coalescing },
    RewriteRule { name: "iif", apply: conditional_expression },
    RewriteRule { name: "date_parts", apply: date_part_functions },
    RewriteRule { name: "builtins", apply: builtin_functions },
    RewriteRule { name: "table_hints", apply: strip_table_hints },
    RewriteRule { name: "exec", apply: exec_calls },
    RewriteRule { name: "print", apply: print_statements },
    RewriteRule { name: "raise", apply: raise_statements },
    RewriteRule { name: "break", apply: break_to_exit },
    RewriteRule { name: "return_value", apply: drop_return_value },
    RewriteRule { name: "select_assignments", apply: select_assignments },
];

const CONTROL_RULES: &[RewriteRule] = &[
    RewriteRule { name: "blocks", apply: convert_blocks },
    RewriteRule { name: "set_assignments", apply: set_assignments },
    RewriteRule { name: "drop_sigils", apply: drop_sigils },
];

impl RoutineDialect for MssqlRoutines {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn extract_body(&self, routine: &RoutineDescriptor, text: &str) -> Result<String> {
        let text = text.trim();
        let tokens = tokenize(text);
        let is_create = tokens.first().is_some_and(|t| t.is_word("CREATE"));

        let body = if is_create {
            if let Some(k) = tokens.iter().position(|t| t.is_word("RETURNS")) {
                if tokens.get(k + 1).is_some_and(|n| n.kind == TokenKind::Variable) {
                    return Err(MigrateError::translation(
                        routine.full_name(),
                        "multi-statement table-valued functions are not supported",
                    ));
                }
            }
            let as_at = header_as(&tokens).ok_or_else(|| {
                MigrateError::translation(routine.full_name(), "no AS keyword after the header")
            })?;
            text[tokens[as_at].end..].trim()
        } else {
            text
        };

        match routine.kind {
            RoutineKind::View => Ok(strip_check_option(body)),
            RoutineKind::Trigger => {
                let uses_pseudo_tables = tokenize(body)
                    .iter()
                    .any(|t| t.is_any_word(&["inserted", "deleted"]));
                if uses_pseudo_tables {
                    return Err(MigrateError::translation(
                        routine.full_name(),
                        "statement-level trigger reads the inserted/deleted pseudo-tables",
                    ));
                }
                Ok(unwrap_block(body))
            }
            RoutineKind::Function if routine.returns == RoutineReturn::Table => {
                Ok(inline_table_body(body))
            }
            _ => Ok(unwrap_block(body)),
        }
    }

    fn view_rules(&self) -> &'static [RewriteRule] {
        VIEW_RULES
    }

    fn body_rules(&self) -> &'static [RewriteRule] {
        BODY_RULES
    }

    fn hoist_declarations(
        &self,
        body: &str,
        mapper: &dyn TypeMapper,
    ) -> (Vec<Declaration>, String) {
        let tokens = tokenize(body);
        let mut declarations = Vec::new();
        let mut splices = Vec::new();

        for (k, t) in tokens.iter().enumerate() {
            if !t.is_word("DECLARE") {
                continue;
            }
            let Some(end) = statement_end(&tokens, k) else {
                continue;
            };
            let list = &body[t.end..tokens[end].start];
            let Some(items) = parse_declare_list(list) else {
                // Cursors and table variables stay put.
                continue;
            };

            let mut assignments = Vec::new();
            for (name, declared, init) in items {
                let data_type = mapper.map_declared(&declared_type(&declared)).target_type;
                if let Some(init) = init {
                    assignments.push(format!("{} := {};", name, init));
                }
                declarations.push(Declaration { name, data_type });
            }
            splices.push(Splice::new(t.start, tokens[end].end, assignments.join(" ")));
        }

        (declarations, apply_splices(body, splices))
    }

    fn control_rules(&self) -> &'static [RewriteRule] {
        CONTROL_RULES
    }
}

/// The header's `AS`: the first top-level `AS` not part of `EXECUTE AS` or a
/// `@param AS type` declaration.
fn header_as(tokens: &[Token<'_>]) -> Option<usize> {
    let mut depth = 0i32;
    for (k, t) in tokens.iter().enumerate() {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth == 0 && t.is_word("AS") {
            let prev = k.checked_sub(1).map(|p| &tokens[p]);
            let skip = prev.is_some_and(|p| {
                p.is_any_word(&["EXECUTE", "EXEC"]) || p.kind == TokenKind::Variable
            });
            if !skip {
                return Some(k);
            }
        }
    }
    None
}

fn strip_check_option(body: &str) -> String {
    let body = body.trim().trim_end_matches(';').trim_end();
    let tokens = tokenize(body);
    let n = tokens.len();
    if n >= 3
        && tokens[n - 3].is_word("WITH")
        && tokens[n - 2].is_word("CHECK")
        && tokens[n - 1].is_word("OPTION")
    {
        return body[..tokens[n - 3].start].trim_end().to_string();
    }
    body.to_string()
}

/// `RETURN (SELECT ...)` of an inline table-valued function.
fn inline_table_body(body: &str) -> String {
    let body = unwrap_block(body);
    let tokens = tokenize(&body);
    if !tokens.first().is_some_and(|t| t.is_word("RETURN")) {
        return body;
    }
    let mut query = body[tokens[0].end..].trim().trim_end_matches(';').trim_end();
    while query.starts_with('(') && query.ends_with(')') {
        let inner = tokenize(query);
        match super::lexer::matching_paren(&inner, 0) {
            Some(close) if close == inner.len() - 1 => {
                query = query[1..query.len() - 1].trim();
            }
            _ => break,
        }
    }
    format!("RETURN QUERY {};", query)
}

/// Parse `@a INT = 0, @b NVARCHAR(10)` into name, type text and initializer.
/// `None` for declarations that cannot be hoisted.
fn parse_declare_list(list: &str) -> Option<Vec<(String, String, Option<String>)>> {
    let mut items = Vec::new();
    for item in split_top_level(list) {
        let tokens = tokenize(&item);
        let var = tokens.first().filter(|t| t.kind == TokenKind::Variable)?;
        let mut type_at = 1;
        if tokens.get(type_at).is_some_and(|t| t.is_word("AS")) {
            type_at += 1;
        }
        let type_token = tokens.get(type_at)?;
        if type_token.is_any_word(&["CURSOR", "TABLE"]) {
            return None;
        }

        let mut depth = 0i32;
        let mut eq_at = None;
        for (k, t) in tokens.iter().enumerate().skip(type_at) {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                depth -= 1;
            } else if depth == 0 && t.is_punct('=') {
                eq_at = Some(k);
                break;
            }
        }

        let type_end = eq_at.map(|k| tokens[k].start).unwrap_or(item.len());
        let declared = item[type_token.start..type_end].trim().to_string();
        let init = eq_at.map(|k| item[tokens[k].end..].trim().to_string());
        items.push((var.text.trim_start_matches('@').to_string(), declared, init));
    }
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Declared T-SQL type text to a [`DeclaredType`] in catalog units.
///
/// `nvarchar(n)` declares characters while the catalog reports bytes, so the
/// length is doubled to match what [`MssqlMapper`] expects.
fn declared_type(text: &str) -> DeclaredType {
    let lower = text.trim().to_lowercase();
    let mut declared = parse_declared_type(&lower);
    if lower.replace(' ', "").contains("(max)") {
        declared.max_length = -1;
    }
    if matches!(declared.name.as_str(), "nchar" | "nvarchar") && declared.max_length > 0 {
        declared.max_length *= 2;
    }
    declared
}

/// T-SQL type names PostgreSQL does not accept as written.
const FOREIGN_TYPES: &[&str] = &[
    "nvarchar",
    "nchar",
    "ntext",
    "datetime",
    "datetime2",
    "smalldatetime",
    "datetimeoffset",
    "bit",
    "tinyint",
    "uniqueidentifier",
    "varbinary",
    "binary",
    "image",
    "money",
    "smallmoney",
    "sql_variant",
];

fn map_cast_type(text: &str) -> String {
    let declared = declared_type(text);
    if FOREIGN_TYPES.contains(&declared.name.as_str()) {
        MssqlMapper.map_declared(&declared).target_type
    } else {
        text.to_string()
    }
}

fn date_unit(part: &str) -> Option<&'static str> {
    Some(match part.to_lowercase().as_str() {
        "year" | "yy" | "yyyy" => "year",
        "month" | "mm" | "m" => "month",
        "week" | "wk" | "ww" => "week",
        "day" | "dd" | "d" => "day",
        "hour" | "hh" => "hour",
        "minute" | "mi" | "n" => "minute",
        "second" | "ss" | "s" => "second",
        _ => return None,
    })
}

/// `[name]` quoting to `"name"`; the `N'...'` prefix is dropped.
fn normalize_quotes(src: &str, _ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                while let Some(n) = chars.next() {
                    out.push(n);
                    if n == c {
                        if chars.peek() == Some(&c) {
                            out.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '[' => {
                let mut name = String::new();
                while let Some(n) = chars.next() {
                    if n == ']' {
                        if chars.peek() == Some(&']') {
                            chars.next();
                            name.push(']');
                        } else {
                            break;
                        }
                    } else {
                        name.push(n);
                    }
                }
                out.push('"');
                out.push_str(&name.replace('"', "\"\""));
                out.push('"');
            }
            'N' | 'n'
                if chars.peek() == Some(&'\'')
                    && !prev.is_some_and(|p| p.is_alphanumeric() || p == '_') => {}
            c => out.push(c),
        }
        prev = Some(c);
    }
    out
}

const SESSION_OPTIONS: &[&str] = &[
    "NOCOUNT",
    "ANSI_NULLS",
    "ANSI_PADDING",
    "ANSI_WARNINGS",
    "ARITHABORT",
    "CONCAT_NULL_YIELDS_NULL",
    "QUOTED_IDENTIFIER",
    "XACT_ABORT",
];

/// `SET NOCOUNT ON` and similar session switches.
fn strip_session_options(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let is_option = t.is_word("SET")
            && tokens.get(k + 1).is_some_and(|o| o.is_any_word(SESSION_OPTIONS))
            && tokens.get(k + 2).is_some_and(|v| v.is_any_word(&["ON", "OFF"]));
        if is_option {
            let mut end = tokens[k + 2].end;
            if let Some(semi) = tokens.get(k + 3).filter(|s| s.is_punct(';')) {
                end = semi.end;
            }
            splices.push(Splice::new(t.start, end, ""));
        }
    }
    apply_splices(src, splices)
}

/// Transaction statements become `NULL;`: a function body cannot commit.
fn neutralize_transaction_control(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let at_start = k == 0
            || tokens[k - 1].is_punct(';')
            || tokens[k - 1].is_any_word(&["BEGIN", "ELSE", "TRY", "CATCH"]);
        let is_tx = (t.is_word("BEGIN")
            && tokens
                .get(k + 1)
                .is_some_and(|n| n.is_any_word(&["TRAN", "TRANSACTION", "DISTRIBUTED"])))
            || t.is_any_word(&["COMMIT", "ROLLBACK", "SAVE"]);
        if at_start && is_tx {
            if let Some(end) = statement_end(&tokens, k) {
                splices.push(Splice::new(t.start, tokens[end].end, "NULL;"));
            }
        }
    }
    apply_splices(src, splices)
}

fn builtin_functions(src: &str, _ctx: &RewriteContext) -> String {
    let out = rewrite_calls(
        src,
        &[
            "LEN",
            "DATALENGTH",
            "CHARINDEX",
            "NEWID",
            "SCOPE_IDENTITY",
            "CONVERT",
            "DATEADD",
        ],
        &|name, args, _| match (name, args) {
            ("LEN", [a]) => Some(format!("LENGTH({})", a)),
            ("DATALENGTH", [a]) => Some(format!("OCTET_LENGTH({})", a)),
            ("CHARINDEX", [needle, haystack]) => {
                Some(format!("POSITION({} IN {})", needle, haystack))
            }
            ("NEWID", []) => Some("gen_random_uuid()".to_string()),
            ("SCOPE_IDENTITY", []) => Some("lastval()".to_string()),
            ("CONVERT", [ty, expr, ..]) => {
                Some(format!("CAST({} AS {})", expr, declared_pg_type(ty)))
            }
            ("DATEADD", [part, n, d]) => date_unit(part)
                .map(|unit| format!("({} + ({}) * INTERVAL '1 {}')", d, n, unit)),
            _ => None,
        },
    );
    let out = cast_types(&out, &map_cast_type);

    let tokens = tokenize(&out);
    let splices = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Variable && t.text.eq_ignore_ascii_case("@@IDENTITY"))
        .map(|t| Splice::new(t.start, t.end, "lastval()"))
        .collect();
    apply_splices(&out, splices)
}

fn declared_pg_type(text: &str) -> String {
    MssqlMapper.map_declared(&declared_type(text)).target_type
}

const TABLE_HINTS: &[&str] = &[
    "NOLOCK",
    "READUNCOMMITTED",
    "READCOMMITTED",
    "ROWLOCK",
    "PAGLOCK",
    "TABLOCK",
    "TABLOCKX",
    "UPDLOCK",
    "HOLDLOCK",
    "XLOCK",
    "NOWAIT",
    "READPAST",
    "SERIALIZABLE",
];

/// `FROM t WITH (NOLOCK)`.
fn strip_table_hints(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let after_name = k > 0
            && matches!(tokens[k - 1].kind, TokenKind::Word | TokenKind::QuotedIdent)
            && !tokens[k - 1].is_any_word(STATEMENT_WORDS);
        if !(t.is_word("WITH") && after_name) {
            continue;
        }
        if !tokens.get(k + 1).is_some_and(|o| o.is_punct('(')) {
            continue;
        }
        let Some(close) = super::lexer::matching_paren(&tokens, k + 1) else {
            continue;
        };
        let only_hints = tokens[k + 2..close]
            .iter()
            .all(|h| h.is_punct(',') || h.is_any_word(TABLE_HINTS));
        if only_hints && close > k + 2 {
            splices.push(Splice::new(tokens[k - 1].end, tokens[close].end, ""));
        }
    }
    apply_splices(src, splices)
}

/// `EXEC proc @a = 1, @b OUTPUT` to `PERFORM proc(a => 1, b)`;
/// `EXEC @r = proc` to `r := proc()`; dynamic SQL to `EXECUTE`.
fn exec_calls(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        if !t.is_any_word(&["EXEC", "EXECUTE"]) {
            continue;
        }
        let Some(end) = statement_end(&tokens, k) else {
            continue;
        };
        if let Some(call) = rewrite_exec(&src[t.end..tokens[end].start]) {
            splices.push(Splice::new(t.start, tokens[end].start, call));
        }
    }
    apply_splices(src, splices)
}

fn rewrite_exec(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let tokens = tokenize(rest);
    let first = tokens.first()?;
    if first.is_punct('(') {
        return Some(format!("EXECUTE {}", rest));
    }

    let (target, name_at) =
        if first.kind == TokenKind::Variable && tokens.get(1).is_some_and(|t| t.is_punct('=')) {
            (Some(first.text), 2)
        } else {
            (None, 0)
        };
    let name_token = tokens
        .get(name_at)
        .filter(|t| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent))?;
    let mut name_end = name_at;
    while tokens.get(name_end + 1).is_some_and(|d| d.is_punct('.'))
        && tokens
            .get(name_end + 2)
            .is_some_and(|n| matches!(n.kind, TokenKind::Word | TokenKind::QuotedIdent))
    {
        name_end += 2;
    }
    let name = &rest[name_token.start..tokens[name_end].end];
    let args_text = rest[tokens[name_end].end..].trim();
    let args: Vec<String> = if args_text.is_empty() {
        Vec::new()
    } else {
        split_top_level(args_text)
    };

    if name.eq_ignore_ascii_case("sp_executesql") {
        return args.first().map(|sql| format!("EXECUTE {}", sql));
    }

    let args: Vec<String> = args.iter().map(|a| named_argument(a)).collect();
    let call = format!("{}({})", name, args.join(", "));
    Some(match target {
        Some(var) => format!("{} := {}", var, call),
        None => format!("PERFORM {}", call),
    })
}

/// `@p = value OUTPUT` to `p => value`.
fn named_argument(arg: &str) -> String {
    let tokens = tokenize(arg);
    let mut end = arg.len();
    if let Some(last) = tokens.last().filter(|t| t.is_any_word(&["OUTPUT", "OUT"])) {
        end = last.start;
    }
    let arg_tokens = &tokens;
    match (arg_tokens.first(), arg_tokens.get(1)) {
        (Some(var), Some(eq)) if var.kind == TokenKind::Variable && eq.is_punct('=') => format!(
            "{} => {}",
            var.text.trim_start_matches('@'),
            arg[eq.end..end].trim()
        ),
        _ => arg[..end].trim().to_string(),
    }
}

/// `PRINT expr` to `RAISE NOTICE '%', expr`.
fn print_statements(src: &str, _ctx: &RewriteContext) -> String {
    replace_words(src, &["PRINT"], "RAISE NOTICE '%',")
}

/// `RAISERROR(msg, sev, state)` and `THROW n, msg, state` to
/// `RAISE EXCEPTION`; a bare `THROW` re-raises.
fn raise_statements(src: &str, _ctx: &RewriteContext) -> String {
    let out = rewrite_calls(src, &["RAISERROR"], &|_, args, _| {
        args.first()
            .map(|msg| format!("RAISE EXCEPTION '%', {}", msg))
    });

    let tokens = tokenize(&out);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        if !t.is_word("THROW") {
            continue;
        }
        let Some(end) = statement_end(&tokens, k) else {
            continue;
        };
        let args = split_top_level(&out[t.end..tokens[end].start]);
        let replacement = match args.as_slice() {
            [] => "RAISE".to_string(),
            [_, msg, ..] => format!("RAISE EXCEPTION '%', {}", msg),
            [msg] => format!("RAISE EXCEPTION '%', {}", msg),
        };
        splices.push(Splice::new(t.start, tokens[end].start, replacement));
    }
    apply_splices(&out, splices)
}

fn break_to_exit(src: &str, _ctx: &RewriteContext) -> String {
    replace_words(src, &["BREAK"], "EXIT")
}

/// A procedure's `RETURN n` status code has no place in a void function.
fn drop_return_value(src: &str, ctx: &RewriteContext) -> String {
    if !ctx.returns_void {
        return src.to_string();
    }
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        if !t.is_word("RETURN") || tokens.get(k + 1).is_some_and(|n| n.is_punct(';')) {
            continue;
        }
        if let Some(end) = statement_end(&tokens, k) {
            splices.push(Splice::new(t.end, tokens[end].start, ""));
        }
    }
    apply_splices(src, splices)
}

/// `SELECT @a = x, @b = y FROM t` to `SELECT x, y INTO a, b FROM t`;
/// without `FROM` each pair becomes an assignment.
fn select_assignments(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let assigns = t.is_word("SELECT")
            && tokens
                .get(k + 1)
                .is_some_and(|v| v.kind == TokenKind::Variable && !v.text.starts_with("@@"))
            && tokens.get(k + 2).is_some_and(|e| e.is_punct('='));
        if !assigns {
            continue;
        }
        let Some(end) = statement_end(&tokens, k) else {
            continue;
        };

        let mut depth = 0i32;
        let mut from_at = None;
        for (j, tok) in tokens.iter().enumerate().take(end).skip(k + 1) {
            if tok.is_punct('(') {
                depth += 1;
            } else if tok.is_punct(')') {
                depth -= 1;
            } else if depth == 0 && tok.is_word("FROM") {
                from_at = Some(j);
                break;
            }
        }
        let list_end = from_at.map(|j| tokens[j].start).unwrap_or(tokens[end].start);

        let mut targets = Vec::new();
        let mut values = Vec::new();
        for item in split_top_level(&src[t.end..list_end]) {
            let item_tokens = tokenize(&item);
            match (item_tokens.first(), item_tokens.get(1)) {
                (Some(v), Some(eq)) if v.kind == TokenKind::Variable && eq.is_punct('=') => {
                    targets.push(v.text.to_string());
                    values.push(item[eq.end..].trim().to_string());
                }
                _ => {
                    targets.clear();
                    break;
                }
            }
        }
        if targets.is_empty() {
            continue;
        }

        let replacement = match from_at {
            Some(j) => format!(
                "SELECT {} INTO {} {}",
                values.join(", "),
                targets.join(", "),
                src[tokens[j].start..tokens[end].start].trim_end()
            ),
            None => targets
                .iter()
                .zip(&values)
                .map(|(t, v)| format!("{} := {}", t, v))
                .collect::<Vec<_>>()
                .join("; "),
        };
        splices.push(Splice::new(t.start, tokens[end].start, replacement));
    }
    apply_splices(src, splices)
}

/// Convert `IF`/`WHILE` with `BEGIN ... END` bodies, standalone blocks and
/// `TRY`/`CATCH` into PL/pgSQL block syntax. Expects terminated statements.
fn convert_blocks(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut out = String::with_capacity(src.len());
    let mut last = 0;
    let mut k = 0;
    let mut after_block = false;

    while k < tokens.len() {
        let t = &tokens[k];
        let at_start = k == 0 || after_block || tokens[k - 1].is_punct(';');
        after_block = false;
        let is_control = t.is_any_word(&["IF", "WHILE"])
            || (t.is_word("BEGIN") && is_plain_block(&tokens, k));
        if at_start && is_control {
            if let Some((text, next)) = convert_statement(src, &tokens, k) {
                out.push_str(&src[last..t.start]);
                out.push_str(&text);
                last = tokens[next - 1].end;
                k = next;
                after_block = true;
                continue;
            }
        }
        k += 1;
    }
    out.push_str(&src[last..]);
    out
}

fn is_plain_block(tokens: &[Token<'_>], k: usize) -> bool {
    !tokens
        .get(k + 1)
        .is_some_and(|n| n.is_any_word(&["TRAN", "TRANSACTION", "DISTRIBUTED"]))
}

/// Index one past the statement starting at `k`, including its `;`.
fn statement_extent(tokens: &[Token<'_>], k: usize) -> Option<usize> {
    let t = tokens.get(k)?;
    if t.is_any_word(&["IF", "WHILE"]) {
        let body = condition_end(tokens, k)?;
        let mut next = statement_extent(tokens, body)?;
        if t.is_word("IF") && tokens.get(next).is_some_and(|e| e.is_word("ELSE")) {
            next = statement_extent(tokens, next + 1)?;
        }
        return Some(next);
    }
    if t.is_word("BEGIN") && is_plain_block(tokens, k) {
        let mut end = matching_end(tokens, k)?;
        if tokens.get(end + 1).is_some_and(|n| n.is_word("TRY")) {
            end += 1;
            if tokens.get(end + 1).is_some_and(|n| n.is_word("BEGIN"))
                && tokens.get(end + 2).is_some_and(|n| n.is_word("CATCH"))
            {
                end = matching_end(tokens, end + 1)? + 1;
            }
        } else if tokens.get(end + 1).is_some_and(|n| n.is_word("CATCH")) {
            end += 1;
        }
        let mut next = end + 1;
        if tokens.get(next).is_some_and(|s| s.is_punct(';')) {
            next += 1;
        }
        return Some(next);
    }
    statement_end(tokens, k).map(|e| e + 1).or(Some(tokens.len()))
}

/// Token index where the body of the `IF`/`WHILE` at `k` begins.
fn condition_end(tokens: &[Token<'_>], k: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (j, t) in tokens.iter().enumerate().skip(k + 1) {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth == 0 && (t.is_word("BEGIN") || starts_statement(tokens, j)) {
            return Some(j);
        }
    }
    None
}

/// A statement keyword, or the target of a `:=` assignment.
fn starts_statement(tokens: &[Token<'_>], j: usize) -> bool {
    let t = &tokens[j];
    let assigns = tokens.get(j + 1).is_some_and(|c| c.is_punct(':'))
        && tokens.get(j + 2).is_some_and(|e| e.is_punct('='));
    t.is_any_word(STATEMENT_WORDS) || t.is_any_word(&["PERFORM", "RAISE", "EXIT"]) || assigns
}

/// Source text of the statement `k..next`, with `BEGIN ... END` unwrapped.
fn body_text<'a>(src: &'a str, tokens: &[Token<'_>], k: usize, next: usize) -> &'a str {
    let first = &tokens[k];
    if first.is_word("BEGIN") && is_plain_block(tokens, k) {
        if let Some(end) = matching_end(tokens, k) {
            let inner_start = if tokens.get(k + 1).is_some_and(|n| n.is_word("TRY")) {
                tokens[k + 1].end
            } else {
                first.end
            };
            if !tokens.get(end + 1).is_some_and(|n| n.is_word("TRY")) {
                return src[inner_start..tokens[end].start].trim();
            }
        }
    }
    src[first.start..tokens[next - 1].end].trim()
}

fn convert_statement(src: &str, tokens: &[Token<'_>], k: usize) -> Option<(String, usize)> {
    let t = &tokens[k];
    let next = statement_extent(tokens, k)?;

    if t.is_word("BEGIN") {
        let end = matching_end(tokens, k)?;
        let is_try = tokens.get(k + 1).is_some_and(|n| n.is_word("TRY"))
            && tokens.get(end + 1).is_some_and(|n| n.is_word("TRY"));
        if is_try {
            let try_body = src[tokens[k + 1].end..tokens[end].start].trim();
            let catch_begin = end + 2;
            let catch_body = match (tokens.get(catch_begin), tokens.get(catch_begin + 1)) {
                (Some(b), Some(c)) if b.is_word("BEGIN") && c.is_word("CATCH") => {
                    let catch_end = matching_end(tokens, catch_begin)?;
                    src[c.end..tokens[catch_end].start].trim()
                }
                _ => "NULL;",
            };
            return Some((
                format!(
                    "BEGIN\n{}\nEXCEPTION WHEN OTHERS THEN\n{}\nEND;",
                    convert_blocks(try_body, &context_free()),
                    convert_blocks(catch_body, &context_free())
                ),
                next,
            ));
        }
        let inner = src[t.end..tokens[end].start].trim();
        return Some((
            format!("BEGIN\n{}\nEND;", convert_blocks(inner, &context_free())),
            next,
        ));
    }

    let body_start = condition_end(tokens, k)?;
    let condition = src[t.end..tokens[body_start].start].trim();
    let body_next = statement_extent(tokens, body_start)?;
    let body = convert_blocks(
        body_text(src, tokens, body_start, body_next),
        &context_free(),
    );

    if t.is_word("WHILE") {
        return Some((
            format!("WHILE {} LOOP\n{}\nEND LOOP;", condition, body),
            next,
        ));
    }

    let mut text = format!("IF {} THEN\n{}\n", condition, body);
    if tokens.get(body_next).is_some_and(|e| e.is_word("ELSE")) {
        let else_start = body_next + 1;
        let else_next = statement_extent(tokens, else_start)?;
        let else_body = convert_blocks(
            body_text(src, tokens, else_start, else_next),
            &context_free(),
        );
        text.push_str(&format!("ELSE\n{}\n", else_body));
    }
    text.push_str("END IF;");
    Some((text, next))
}

/// Block conversion does not depend on routine context.
fn context_free() -> RewriteContext {
    RewriteContext {
        source_schema: String::new(),
        kind: RoutineKind::Procedure,
        returns_void: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::rules::apply_rules;

    fn ctx(kind: RoutineKind) -> RewriteContext {
        RewriteContext {
            source_schema: "dbo".into(),
            kind,
            returns_void: kind == RoutineKind::Procedure,
        }
    }

    fn rewrite_body(body: &str) -> (Vec<Declaration>, String) {
        let c = ctx(RoutineKind::Procedure);
        let pre = apply_rules(BODY_RULES, body, &c);
        let (decls, hoisted) = MssqlRoutines.hoist_declarations(&pre, &MssqlMapper);
        (decls, apply_rules(CONTROL_RULES, &hoisted, &c))
    }

    #[test]
    fn test_normalize_quotes() {
        let c = ctx(RoutineKind::View);
        assert_eq!(
            normalize_quotes("SELECT [Order Id], N'abc', 'it''s [x]' FROM [dbo].[Orders]", &c),
            "SELECT \"Order Id\", 'abc', 'it''s [x]' FROM \"dbo\".\"Orders\""
        );
    }

    #[test]
    fn test_extract_view_body() {
        let view = RoutineDescriptor::new(RoutineKind::View, "dbo", "v_active");
        let body = MssqlRoutines
            .extract_body(
                &view,
                "CREATE VIEW dbo.v_active WITH SCHEMABINDING AS SELECT id FROM dbo.t WITH CHECK OPTION",
            )
            .unwrap();
        assert_eq!(body, "SELECT id FROM dbo.t");
    }

    #[test]
    fn test_extract_procedure_body() {
        let proc = RoutineDescriptor::new(RoutineKind::Procedure, "dbo", "p");
        let body = MssqlRoutines
            .extract_body(
                &proc,
                "CREATE PROCEDURE dbo.p @a AS INT, @b INT OUTPUT\nWITH EXECUTE AS OWNER\nAS\nBEGIN\n  SET @b = @a * 2\nEND",
            )
            .unwrap();
        assert_eq!(body, "SET @b = @a * 2");
    }

    #[test]
    fn test_multi_statement_tvf_is_rejected() {
        let mut func = RoutineDescriptor::new(RoutineKind::Function, "dbo", "f");
        func.returns = RoutineReturn::Table;
        let err = MssqlRoutines
            .extract_body(
                &func,
                "CREATE FUNCTION dbo.f() RETURNS @t TABLE (id int) AS BEGIN RETURN END",
            )
            .unwrap_err();
        assert!(matches!(err, MigrateError::Translation { .. }));
    }

    #[test]
    fn test_inline_tvf_returns_query() {
        let mut func = RoutineDescriptor::new(RoutineKind::Function, "dbo", "f");
        func.returns = RoutineReturn::Table;
        let body = MssqlRoutines
            .extract_body(
                &func,
                "CREATE FUNCTION dbo.f(@min int) RETURNS TABLE AS RETURN (SELECT id FROM dbo.t WHERE id > @min)",
            )
            .unwrap();
        assert_eq!(body, "RETURN QUERY SELECT id FROM dbo.t WHERE id > @min;");
    }

    #[test]
    fn test_trigger_with_pseudo_tables_is_rejected() {
        let trigger = RoutineDescriptor::new(RoutineKind::Trigger, "dbo", "trg");
        assert!(MssqlRoutines
            .extract_body(
                &trigger,
                "CREATE TRIGGER trg ON dbo.t AFTER INSERT AS BEGIN UPDATE t SET x = 1 FROM inserted END",
            )
            .is_err());
    }

    #[test]
    fn test_hoist_declarations() {
        let (decls, body) = MssqlRoutines.hoist_declarations(
            "DECLARE @count INT = 0, @label NVARCHAR(20);\nSET @count = 1;",
            &MssqlMapper,
        );
        assert_eq!(
            decls,
            vec![
                Declaration { name: "count".into(), data_type: "integer".into() },
                Declaration { name: "label".into(), data_type: "varchar(20)".into() },
            ]
        );
        assert_eq!(body, "count := 0;\nSET @count = 1;");
    }

    #[test]
    fn test_cursor_declaration_stays() {
        let (decls, body) = MssqlRoutines.hoist_declarations(
            "DECLARE c CURSOR FOR SELECT id FROM t;",
            &MssqlMapper,
        );
        assert!(decls.is_empty());
        assert_eq!(body, "DECLARE c CURSOR FOR SELECT id FROM t;");
    }

    #[test]
    fn test_body_rewrite_end_to_end() {
        let (decls, body) = rewrite_body(
            "SET NOCOUNT ON\n\
             DECLARE @total INT\n\
             SELECT @total = COUNT(*) FROM dbo.orders WHERE status = N'open'\n\
             IF @total > 10\n\
             BEGIN\n\
                 PRINT 'busy'\n\
                 EXEC dbo.log_event @name = 'busy', @count = @total\n\
             END\n\
             ELSE\n\
                 SET @total = ISNULL(@total, 0) + 1\n\
             RETURN 0",
        );
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "total");
        assert!(body.contains("SELECT COUNT(*) INTO total FROM orders WHERE status = 'open';"));
        assert!(body.contains("IF total > 10 THEN"));
        assert!(body.contains("RAISE NOTICE '%', 'busy';"));
        assert!(body.contains("PERFORM log_event(name => 'busy', count => total);"));
        assert!(body.contains("ELSE\ntotal := COALESCE(total, 0) + 1;\nEND IF;"));
        assert!(body.trim_end().ends_with("RETURN;"));
        assert!(!body.contains('@'));
    }

    #[test]
    fn test_while_and_try_catch() {
        let (_, body) = rewrite_body(
            "WHILE @i < 10 BEGIN SET @i += 1 IF @i = 5 BREAK END\n\
             BEGIN TRY INSERT INTO t (a) VALUES (1) END TRY BEGIN CATCH THROW END CATCH",
        );
        assert!(body.contains("WHILE i < 10 LOOP"));
        assert!(body.contains("i := i + 1;"));
        assert!(body.contains("IF i = 5 THEN\nEXIT;\nEND IF;"));
        assert!(body.contains("END LOOP;"));
        assert!(body.contains("EXCEPTION WHEN OTHERS THEN\nRAISE;\nEND;"));
    }

    #[test]
    fn test_builtin_functions() {
        let c = ctx(RoutineKind::View);
        assert_eq!(
            builtin_functions(
                "SELECT LEN(name), CHARINDEX('a', name), NEWID(), CONVERT(NVARCHAR(10), id), CAST(x AS DATETIME2), CAST(y AS int)",
                &c
            ),
            "SELECT LENGTH(name), POSITION('a' IN name), gen_random_uuid(), CAST(id AS varchar(10)), CAST(x AS timestamp), CAST(y AS int)"
        );
        assert_eq!(
            builtin_functions("SELECT DATEADD(day, 7, created)", &c),
            "SELECT (created + (7) * INTERVAL '1 day')"
        );
    }

    #[test]
    fn test_view_rules() {
        let c = ctx(RoutineKind::View);
        let out = apply_rules(
            VIEW_RULES,
            "SELECT TOP 5 [o].[id], ISNULL([o].[note], '') AS note -- latest\nFROM [dbo].[orders] o WITH (NOLOCK) ORDER BY [o].[created] DESC",
            &c,
        );
        assert_eq!(
            out,
            "SELECT \"o\".\"id\", COALESCE(\"o\".\"note\", '') AS note \nFROM \"orders\" o ORDER BY \"o\".\"created\" DESC LIMIT 5"
        );
    }
}

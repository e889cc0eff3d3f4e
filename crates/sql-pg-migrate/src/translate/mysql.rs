//! MySQL stored-program rewriting.

use super::lexer::{matching_paren, split_top_level, tokenize, Token, TokenKind};
use super::rules::{
    apply_splices, cast_types, concat_to_operator, conditional_expression,
    current_time_functions, date_part_functions, group_concat, null_coalescing, replace_words,
    rewrite_calls, set_assignments, statement_end, strip_comments, strip_schema_qualifiers,
    unwrap_block, RewriteContext, RewriteRule, Splice,
};
use super::{Declaration, RoutineDialect};
use crate::core::schema::{RoutineDescriptor, RoutineKind};
use crate::error::{MigrateError, Result};
use crate::typemap::{parse_declared_type, TypeMapper};

/// MySQL views, procedures, functions and triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlRoutines;

const VIEW_RULES: &[RewriteRule] = &[
    RewriteRule { name: "normalize_quotes", apply: normalize_quotes },
    RewriteRule { name: "strip_comments", apply: strip_comments },
    RewriteRule { name: "charset_introducers", apply: strip_charset_introducers },
    RewriteRule { name: "strip_schema_qualifiers", apply: strip_schema_qualifiers },
    RewriteRule { name: "current_time", apply: current_time_functions },
    RewriteRule { name: "concat", apply: concat_to_operator },
    RewriteRule { name: "null_coalescing", apply: null_coalescing },
    RewriteRule { name: "if_expression", apply: conditional_expression },
    RewriteRule { name: "group_concat", apply: group_concat },
    RewriteRule { name: "date_parts", apply: date_part_functions },
    RewriteRule { name: "builtins", apply: builtin_functions },
    RewriteRule { name: "limit_offset", apply: limit_offset },
];

const BODY_RULES: &[RewriteRule] = &[
    RewriteRule { name: "normalize_quotes", apply: normalize_quotes },
    RewriteRule { name: "strip_comments", apply: strip_comments },
    RewriteRule { name: "charset_introducers", apply: strip_charset_introducers },
    RewriteRule { name: "strip_schema_qualifiers", apply: strip_schema_qualifiers },
    RewriteRule { name: "current_time", apply: current_time_functions },
    RewriteRule { name: "concat", apply: concat_to_operator },
    RewriteRule { name: "null_coalescing", apply: null_coalescing },
    RewriteRule { name: "if_expression", apply: conditional_expression },
    RewriteRule { name: "group_concat", apply: group_concat },
    RewriteRule { name: "date_parts", apply: date_part_functions },
    RewriteRule { name: "builtins", apply: builtin_functions },
    RewriteRule { name: "limit_offset", apply: limit_offset },
    RewriteRule { name: "signal", apply: signal_statements },
    RewriteRule { name: "ensure_terminated", apply: ensure_terminated },
];

const CONTROL_RULES: &[RewriteRule] = &[
    RewriteRule { name: "set_assignments", apply: set_assignments },
    RewriteRule { name: "elseif", apply: elseif_to_elsif },
    RewriteRule { name: "while_do", apply: while_do_loops },
    RewriteRule { name: "repeat_until", apply: repeat_until_loops },
    RewriteRule { name: "labels", apply: block_labels },
    RewriteRule { name: "leave_iterate", apply: leave_iterate },
];

impl RoutineDialect for MysqlRoutines {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn extract_body(&self, routine: &RoutineDescriptor, text: &str) -> Result<String> {
        let text = strip_delimiters(text);
        let tokens = tokenize(&text);
        if !tokens.first().is_some_and(|t| t.is_word("CREATE")) {
            // Catalog metadata holds only the body.
            return Ok(match routine.kind {
                RoutineKind::View => strip_check_option(&text),
                _ => unwrap_block(&text),
            });
        }

        let missing = |what: &str| {
            MigrateError::translation(routine.full_name(), format!("no {} in definition", what))
        };
        let body_at = match routine.kind {
            RoutineKind::View => {
                let view_at = tokens
                    .iter()
                    .position(|t| t.is_word("VIEW"))
                    .ok_or_else(|| missing("VIEW keyword"))?;
                let as_at = tokens
                    .iter()
                    .enumerate()
                    .skip(view_at)
                    .find(|(_, t)| t.is_word("AS"))
                    .map(|(k, _)| k)
                    .ok_or_else(|| missing("AS keyword"))?;
                as_at + 1
            }
            RoutineKind::Trigger => {
                let each_at = tokens
                    .windows(2)
                    .position(|w| w[0].is_word("EACH") && w[1].is_word("ROW"))
                    .ok_or_else(|| missing("FOR EACH ROW clause"))?;
                let mut k = each_at + 2;
                if tokens.get(k).is_some_and(|t| t.is_any_word(&["FOLLOWS", "PRECEDES"])) {
                    k += 2;
                }
                k
            }
            RoutineKind::Procedure | RoutineKind::Function => {
                let open = tokens
                    .iter()
                    .position(|t| t.is_punct('('))
                    .ok_or_else(|| missing("parameter list"))?;
                let close = matching_paren(&tokens, open).ok_or_else(|| missing("closing parenthesis"))?;
                skip_characteristics(&tokens, close + 1)
            }
        };

        let body = tokens
            .get(body_at)
            .map(|t| text[t.start..].trim())
            .ok_or_else(|| missing("body"))?;
        Ok(match routine.kind {
            RoutineKind::View => strip_check_option(body),
            _ => unwrap_block(body),
        })
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
            let Some((names, declared, default)) =
                parse_declaration(&body[t.end..tokens[end].start])
            else {
                // Cursors, handlers and conditions stay put.
                continue;
            };

            let data_type = mapper.map_declared(&parse_declared_type(&declared)).target_type;
            let mut assignments = Vec::new();
            for name in names {
                if let Some(default) = &default {
                    assignments.push(format!("{} := {};", name, default));
                }
                declarations.push(Declaration {
                    name,
                    data_type: data_type.clone(),
                });
            }
            splices.push(Splice::new(t.start, tokens[end].end, assignments.join(" ")));
        }

        (declarations, apply_splices(body, splices))
    }

    fn control_rules(&self) -> &'static [RewriteRule] {
        CONTROL_RULES
    }
}

/// Drop `DELIMITER` lines and the custom delimiter after the final `END`.
fn strip_delimiters(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|l| {
            !l.trim_start()
                .get(..9)
                .is_some_and(|head| head.eq_ignore_ascii_case("DELIMITER"))
        })
        .collect();
    let mut joined = kept.join("\n").trim().to_string();
    for delimiter in ["$$", "//", ";;"] {
        if let Some(stripped) = joined.strip_suffix(delimiter) {
            joined = stripped.trim_end().to_string();
        }
    }
    joined
}

fn strip_check_option(body: &str) -> String {
    let body = body.trim().trim_end_matches(';').trim_end();
    let tokens = tokenize(body);
    let with_at = tokens.iter().rposition(|t| t.is_word("WITH"));
    match with_at {
        Some(k)
            if tokens[k + 1..]
                .iter()
                .all(|t| t.is_any_word(&["CASCADED", "LOCAL", "CHECK", "OPTION"])) =>
        {
            body[..tokens[k].start].trim_end().to_string()
        }
        _ => body.to_string(),
    }
}

/// Skip `RETURNS type` and routine characteristics starting at `k`.
fn skip_characteristics(tokens: &[Token<'_>], mut k: usize) -> usize {
    if tokens.get(k).is_some_and(|t| t.is_word("RETURNS")) {
        k += 2;
        if tokens.get(k).is_some_and(|t| t.is_punct('(')) {
            k = matching_paren(tokens, k).map(|c| c + 1).unwrap_or(k + 1);
        }
    }
    while let Some(t) = tokens.get(k) {
        let step = if t.is_any_word(&["UNSIGNED", "ZEROFILL", "DETERMINISTIC", "NOT", "BINARY"]) {
            1
        } else if t.is_any_word(&["CHARSET", "COLLATE", "COMMENT", "LANGUAGE", "CONTAINS", "NO"]) {
            2
        } else if t.is_any_word(&["CHARACTER", "READS", "MODIFIES", "SQL"]) {
            3
        } else {
            break;
        };
        k += step;
    }
    k
}

/// `a, b INT DEFAULT 0` into names, type text and default.
fn parse_declaration(text: &str) -> Option<(Vec<String>, String, Option<String>)> {
    let tokens = tokenize(text);
    let first = tokens.first()?;
    if first.is_any_word(&["CONTINUE", "EXIT", "UNDO"]) {
        return None;
    }

    let mut names = Vec::new();
    let mut k = 0;
    loop {
        let name = tokens.get(k)?;
        if !matches!(name.kind, TokenKind::Word | TokenKind::QuotedIdent) {
            return None;
        }
        names.push(name.text.to_string());
        if tokens.get(k + 1).is_some_and(|c| c.is_punct(',')) {
            k += 2;
        } else {
            k += 1;
            break;
        }
    }

    let type_token = tokens.get(k)?;
    if type_token.is_any_word(&["CURSOR", "CONDITION"]) {
        return None;
    }
    let default_at = tokens
        .iter()
        .enumerate()
        .skip(k)
        .find(|(_, t)| t.is_word("DEFAULT"))
        .map(|(j, _)| j);
    let type_end = default_at.map(|j| tokens[j].start).unwrap_or(text.len());
    let declared = text[type_token.start..type_end].trim().to_string();
    let default = default_at.map(|j| text[tokens[j].end..].trim().to_string());
    Some((names, declared, default))
}

/// Backtick identifiers to double quotes and double-quoted strings to single
/// quotes; backslash escapes in strings to standard form. Comments pass
/// through untouched.
fn normalize_quotes(src: &str, _ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    out.push(next);
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for next in chars.by_ref() {
                    out.push(next);
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '`' => {
                let mut name = String::new();
                while let Some(n) = chars.next() {
                    if n == '`' {
                        if chars.peek() == Some(&'`') {
                            chars.next();
                            name.push('`');
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
            '\'' | '"' => {
                let mut value = String::new();
                while let Some(n) = chars.next() {
                    match n {
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('r') => value.push('\r'),
                            Some(escaped) => value.push(escaped),
                            None => {}
                        },
                        n if n == c => {
                            if chars.peek() == Some(&c) {
                                chars.next();
                                value.push(c);
                            } else {
                                break;
                            }
                        }
                        n => value.push(n),
                    }
                }
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            c => out.push(c),
        }
    }
    out
}

const CHARSETS: &[&str] = &[
    "_utf8mb4", "_utf8mb3", "_utf8", "_latin1", "_binary", "_ascii", "_utf16",
];

/// `_utf8mb4'text'` introducers and `COLLATE utf8mb4_...` clauses.
fn strip_charset_introducers(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let next = tokens.get(k + 1);
        if t.is_any_word(CHARSETS) && next.is_some_and(|n| n.kind == TokenKind::Str) {
            splices.push(Splice::new(t.start, t.end, ""));
        } else if t.is_word("COLLATE") && next.is_some_and(|n| n.kind == TokenKind::Word) {
            let end = next.map(|n| n.end).unwrap_or(t.end);
            splices.push(Splice::new(t.start, end, ""));
        }
    }
    apply_splices(src, splices)
}

fn builtin_functions(src: &str, _ctx: &RewriteContext) -> String {
    let out = rewrite_calls(
        src,
        &[
            "UUID",
            "LAST_INSERT_ID",
            "LCASE",
            "UCASE",
            "RAND",
            "DATABASE",
            "LOCATE",
            "DATEDIFF",
        ],
        &|name, args, _| match (name, args) {
            ("UUID", []) => Some("gen_random_uuid()::text".to_string()),
            ("LAST_INSERT_ID", []) => Some("lastval()".to_string()),
            ("LCASE", [a]) => Some(format!("lower({})", a)),
            ("UCASE", [a]) => Some(format!("upper({})", a)),
            ("RAND", []) => Some("random()".to_string()),
            ("DATABASE", []) => Some("current_database()".to_string()),
            ("LOCATE", [needle, haystack]) => {
                Some(format!("POSITION({} IN {})", needle, haystack))
            }
            ("DATEDIFF", [a, b]) => Some(format!("(({})::date - ({})::date)", a, b)),
            _ => None,
        },
    );
    cast_types(&out, &map_cast_type)
}

fn map_cast_type(text: &str) -> String {
    let declared = parse_declared_type(text);
    match declared.name.as_str() {
        "signed" | "unsigned" => "bigint".to_string(),
        "char" if declared.max_length > 0 => format!("varchar({})", declared.max_length),
        "char" => "text".to_string(),
        "datetime" => "timestamp".to_string(),
        "binary" => "bytea".to_string(),
        "double" => "double precision".to_string(),
        _ => text.to_string(),
    }
}

/// `LIMIT offset, count` to `LIMIT count OFFSET offset`.
fn limit_offset(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        if !t.is_word("LIMIT") {
            continue;
        }
        let operand = |j: usize| {
            tokens
                .get(j)
                .filter(|o| matches!(o.kind, TokenKind::Number | TokenKind::Word))
        };
        if let (Some(offset), Some(comma), Some(count)) =
            (operand(k + 1), tokens.get(k + 2), operand(k + 3))
        {
            if comma.is_punct(',') {
                splices.push(Splice::new(
                    offset.start,
                    count.end,
                    format!("{} OFFSET {}", count.text, offset.text),
                ));
            }
        }
    }
    apply_splices(src, splices)
}

/// `SIGNAL SQLSTATE 's' SET MESSAGE_TEXT = m` to `RAISE EXCEPTION`.
fn signal_statements(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        if !t.is_any_word(&["SIGNAL", "RESIGNAL"]) {
            continue;
        }
        let end = statement_end(&tokens, k).unwrap_or(tokens.len());
        let stmt = &tokens[k..end];

        if t.is_word("RESIGNAL") && stmt.len() == 1 {
            splices.push(Splice::new(t.start, t.end, "RAISE"));
            continue;
        }
        let state = stmt
            .iter()
            .position(|s| s.is_word("SQLSTATE"))
            .and_then(|p| {
                let mut p = p + 1;
                if stmt.get(p).is_some_and(|v| v.is_word("VALUE")) {
                    p += 1;
                }
                stmt.get(p).filter(|s| s.kind == TokenKind::Str)
            })
            .map(|s| s.text.to_string());
        let stmt_end = stmt.last().map(|l| l.end).unwrap_or(t.end);
        let message = stmt
            .iter()
            .position(|s| s.is_word("MESSAGE_TEXT"))
            .and_then(|p| stmt.get(p + 2))
            .and_then(|m| split_top_level(&src[m.start..stmt_end]).into_iter().next());

        let mut raise = format!(
            "RAISE EXCEPTION '%', {}",
            message.unwrap_or_else(|| "'unhandled user-defined exception'".to_string())
        );
        if let Some(state) = state {
            raise.push_str(&format!(" USING ERRCODE = {}", state));
        }
        splices.push(Splice::new(t.start, stmt_end, raise));
    }
    apply_splices(src, splices)
}

/// Make sure the body ends with `;`.
fn ensure_terminated(src: &str, _ctx: &RewriteContext) -> String {
    let trimmed = src.trim_end();
    match tokenize(trimmed).last() {
        Some(t) if !t.is_punct(';') => format!("{};", trimmed),
        _ => src.to_string(),
    }
}

fn elseif_to_elsif(src: &str, _ctx: &RewriteContext) -> String {
    replace_words(src, &["ELSEIF"], "ELSIF")
}

/// `WHILE c DO ... END WHILE` to `WHILE c LOOP ... END LOOP`.
fn while_do_loops(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let after_end = k > 0 && tokens[k - 1].is_word("END");
        if t.is_word("WHILE") && after_end {
            splices.push(Splice::new(tokens[k - 1].start, t.end, "END LOOP"));
        } else if t.is_word("WHILE") {
            let mut depth = 0i32;
            for d in &tokens[k + 1..] {
                if d.is_punct('(') {
                    depth += 1;
                } else if d.is_punct(')') {
                    depth -= 1;
                } else if depth == 0 && (d.is_word("DO") || d.is_punct(';')) {
                    if d.is_word("DO") {
                        splices.push(Splice::new(d.start, d.end, "LOOP"));
                    }
                    break;
                }
            }
        }
    }
    apply_splices(src, splices)
}

/// `REPEAT ... UNTIL c END REPEAT` to `LOOP ... EXIT WHEN c; END LOOP`.
fn repeat_until_loops(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let after_end = k > 0 && tokens[k - 1].is_word("END");
        if t.is_word("REPEAT") && !after_end {
            splices.push(Splice::new(t.start, t.end, "LOOP"));
        } else if t.is_word("UNTIL") {
            let closing = tokens[k + 1..]
                .windows(2)
                .position(|w| w[0].is_word("END") && w[1].is_word("REPEAT"))
                .map(|p| k + 1 + p);
            if let Some(end_at) = closing {
                let condition = src[t.end..tokens[end_at].start].trim();
                splices.push(Splice::new(
                    t.start,
                    tokens[end_at + 1].end,
                    format!("EXIT WHEN {}; END LOOP", condition),
                ));
            }
        }
    }
    apply_splices(src, splices)
}

/// `lbl: LOOP` to `<<lbl>> LOOP`.
fn block_labels(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (k, t) in tokens.iter().enumerate() {
        let labels_block = t.kind == TokenKind::Word
            && tokens.get(k + 1).is_some_and(|c| c.is_punct(':'))
            && tokens
                .get(k + 2)
                .is_some_and(|b| b.is_any_word(&["LOOP", "WHILE", "REPEAT", "BEGIN"]));
        if labels_block {
            splices.push(Splice::new(
                t.start,
                tokens[k + 1].end,
                format!("<<{}>>", t.text),
            ));
        }
    }
    apply_splices(src, splices)
}

fn leave_iterate(src: &str, _ctx: &RewriteContext) -> String {
    let out = replace_words(src, &["LEAVE"], "EXIT");
    replace_words(&out, &["ITERATE"], "CONTINUE")
}

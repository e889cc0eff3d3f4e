//! Composable text rewrite rules and the helpers they are built from.
//!
//! Every rule is idempotent: applying it to its own output changes nothing.
//! Rules work on tokens so string literals and quoted identifiers are never
//! rewritten by accident.

use tracing::trace;

use super::lexer::{matching_paren, split_args, tokenize, Token, TokenKind};
use crate::core::schema::RoutineKind;

/// Information a rule may need besides the text itself.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub source_schema: String,
    pub kind: RoutineKind,
    /// Whether the routine returns nothing (procedures without a value).
    pub returns_void: bool,
}

/// One named text transformation.
#[derive(Clone, Copy)]
pub struct RewriteRule {
    pub name: &'static str,
    pub apply: fn(&str, &RewriteContext) -> String,
}

impl std::fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewriteRule").field("name", &self.name).finish()
    }
}

/// Run `rules` in order.
pub fn apply_rules(rules: &[RewriteRule], text: &str, ctx: &RewriteContext) -> String {
    let mut current = text.to_string();
    for rule in rules {
        let next = (rule.apply)(&current, ctx);
        if next != current {
            trace!("rewrite rule '{}' changed the text", rule.name);
        }
        current = next;
    }
    current
}

/// A text edit: replace `start..end` with `text`.
pub(super) struct Splice {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Splice {
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Apply non-overlapping edits; an edit overlapping an earlier one is dropped.
pub(super) fn apply_splices(src: &str, mut splices: Vec<Splice>) -> String {
    splices.sort_by_key(|s| s.start);
    let mut out = String::with_capacity(src.len());
    let mut last = 0;
    for s in splices {
        if s.start < last {
            continue;
        }
        out.push_str(&src[last..s.start]);
        out.push_str(&s.text);
        last = s.end;
    }
    out.push_str(&src[last..]);
    out
}

/// Remove `--` and `/* */` comments outside quoted text.
pub fn strip_comments(src: &str, _ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                if chars.peek() == Some(&q) {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else {
                    quote = None;
                }
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            c => out.push(c),
        }
    }
    out
}

/// Drop `<source schema>.` qualifiers so objects resolve in the target schema.
pub fn strip_schema_qualifiers(src: &str, ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let schema = ctx.source_schema.as_str();
    let mut splices = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        let matches = match t.kind {
            TokenKind::Word => t.text.eq_ignore_ascii_case(schema),
            TokenKind::QuotedIdent => t.text.trim_matches('"') == schema,
            _ => false,
        };
        let qualifies = tokens.get(i + 1).is_some_and(|n| n.is_punct('.') && n.start == t.end);
        let is_qualified_itself = i > 0 && tokens[i - 1].is_punct('.');
        if matches && qualifies && !is_qualified_itself {
            splices.push(Splice {
                start: t.start,
                end: tokens[i + 1].end,
                text: String::new(),
            });
        }
    }
    apply_splices(src, splices)
}

/// Rewrite calls to the functions named in `names`.
///
/// `f` receives the upper-cased function name, the top-level arguments
/// (already rewritten) and the raw text between the parentheses, and returns
/// the replacement or `None` to keep the call.
pub fn rewrite_calls<F>(src: &str, names: &[&str], f: &F) -> String
where
    F: Fn(&str, &[String], &str) -> Option<String>,
{
    let tokens = tokenize(src);
    let mut out = String::with_capacity(src.len());
    let mut last = 0;
    let mut i = 0;

    while i < tokens.len() {
        let t = &tokens[i];
        let is_call = t.is_any_word(names)
            && tokens.get(i + 1).is_some_and(|n| n.is_punct('('))
            && !(i > 0 && tokens[i - 1].is_punct('.'));
        if is_call {
            if let Some(close) = matching_paren(&tokens, i + 1) {
                let args: Vec<String> = split_args(src, &tokens, i + 1, close)
                    .into_iter()
                    .map(|a| rewrite_calls(a, names, f))
                    .collect();
                let inner = &src[tokens[i + 1].end..tokens[close].start];
                if let Some(replacement) = f(&t.text.to_uppercase(), &args, inner) {
                    out.push_str(&src[last..t.start]);
                    out.push_str(&replacement);
                    last = tokens[close].end;
                    i = close + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    out.push_str(&src[last..]);
    out
}

/// Replace each occurrence of the word sequence `from` with `to`.
pub fn replace_words(src: &str, from: &[&str], to: &str) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    let mut i = 0;
    while i + from.len() <= tokens.len() {
        if from
            .iter()
            .enumerate()
            .all(|(k, w)| tokens[i + k].is_word(w))
        {
            splices.push(Splice {
                start: tokens[i].start,
                end: tokens[i + from.len() - 1].end,
                text: to.to_string(),
            });
            i += from.len();
        } else {
            i += 1;
        }
    }
    apply_splices(src, splices)
}

/// `GETDATE()`, `NOW()`, `CURDATE()` and friends.
pub fn current_time_functions(src: &str, _ctx: &RewriteContext) -> String {
    rewrite_calls(
        src,
        &[
            "GETDATE",
            "SYSDATETIME",
            "NOW",
            "CURRENT_TIMESTAMP",
            "LOCALTIMESTAMP",
            "CURDATE",
            "CURTIME",
            "GETUTCDATE",
            "SYSUTCDATETIME",
            "UTC_TIMESTAMP",
        ],
        &|name, _, _| {
            Some(
                match name {
                    "CURDATE" => "CURRENT_DATE",
                    "CURTIME" => "CURRENT_TIME",
                    "GETUTCDATE" | "SYSUTCDATETIME" | "UTC_TIMESTAMP" => {
                        "(CURRENT_TIMESTAMP AT TIME ZONE 'UTC')"
                    }
                    _ => "CURRENT_TIMESTAMP",
                }
                .to_string(),
            )
        },
    )
}

/// `CONCAT(a, b, ...)` to `(a || b || ...)`.
pub fn concat_to_operator(src: &str, _ctx: &RewriteContext) -> String {
    rewrite_calls(src, &["CONCAT"], &|_, args, _| {
        if args.is_empty() {
            return None;
        }
        Some(format!("({})", args.join(" || ")))
    })
}

/// `ISNULL(a, b)` / `IFNULL(a, b)` to `COALESCE(a, b)`; one-argument
/// `ISNULL(a)` is a null test.
pub fn null_coalescing(src: &str, _ctx: &RewriteContext) -> String {
    rewrite_calls(src, &["ISNULL", "IFNULL", "NVL"], &|name, args, _| match args.len() {
        1 if name == "ISNULL" => Some(format!("({} IS NULL)", args[0])),
        2 => Some(format!("COALESCE({}, {})", args[0], args[1])),
        _ => None,
    })
}

/// `IF(c, a, b)` / `IIF(c, a, b)` to a `CASE` expression.
pub fn conditional_expression(src: &str, _ctx: &RewriteContext) -> String {
    rewrite_calls(src, &["IF", "IIF"], &|_, args, _| match args.len() {
        3 => Some(format!(
            "(CASE WHEN {} THEN {} ELSE {} END)",
            args[0], args[1], args[2]
        )),
        _ => None,
    })
}

/// `GROUP_CONCAT([DISTINCT] expr [ORDER BY o] [SEPARATOR s])` to `string_agg`.
pub fn group_concat(src: &str, ctx: &RewriteContext) -> String {
    rewrite_calls(src, &["GROUP_CONCAT"], &|_, _, inner| {
        let inner = group_concat(inner, ctx);
        let tokens = tokenize(&inner);
        let mut depth = 0i32;
        let mut order_at = None;
        let mut separator_at = None;
        for (k, t) in tokens.iter().enumerate() {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                depth -= 1;
            } else if depth == 0 {
                if t.is_word("ORDER") && tokens.get(k + 1).is_some_and(|n| n.is_word("BY")) {
                    order_at = Some(k);
                } else if t.is_word("SEPARATOR") {
                    separator_at = Some(k);
                }
            }
        }

        let end_of = |k: Option<usize>| k.map(|k| tokens[k].start).unwrap_or(inner.len());
        let expr_end = end_of(order_at.or(separator_at));
        let mut expr = inner[..expr_end].trim();
        let distinct = tokens.first().is_some_and(|t| t.is_word("DISTINCT"));
        if distinct {
            expr = expr["DISTINCT".len()..].trim();
        }
        if expr.is_empty() {
            return None;
        }

        // Multiple expressions are concatenated.
        let wrapped = format!("({})", expr);
        let wrapped_tokens = tokenize(&wrapped);
        let pieces: Vec<String> = match matching_paren(&wrapped_tokens, 0) {
            Some(close) => split_args(&wrapped, &wrapped_tokens, 0, close)
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => vec![expr.to_string()],
        };

        let order = order_at.map(|k| {
            let start = tokens[k].start;
            let end = separator_at
                .filter(|s| *s > k)
                .map(|s| tokens[s].start)
                .unwrap_or(inner.len());
            inner[start..end].trim().to_string()
        });
        let separator = separator_at
            .and_then(|k| tokens.get(k + 1))
            .map(|t| t.text.to_string())
            .unwrap_or_else(|| "','".to_string());

        let value = if pieces.len() == 1 {
            format!("({})::text", pieces[0])
        } else {
            format!("({})::text", pieces.join(" || "))
        };
        let mut out = String::from("string_agg(");
        if distinct {
            out.push_str("DISTINCT ");
        }
        out.push_str(&value);
        out.push_str(", ");
        out.push_str(&separator);
        if let Some(order) = order {
            out.push(' ');
            out.push_str(&order);
        }
        out.push(')');
        Some(out)
    })
}

/// `SELECT [DISTINCT] TOP n ...` to `SELECT ... LIMIT n`.
///
/// `TOP n PERCENT` is dropped without a limit.
pub fn top_to_limit(src: &str, ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    for (i, t) in tokens.iter().enumerate() {
        if !t.is_word("TOP") {
            continue;
        }
        let after_select = match i.checked_sub(1).map(|p| &tokens[p]) {
            Some(p) if p.is_word("SELECT") => true,
            Some(p) if p.is_any_word(&["DISTINCT", "ALL"]) => {
                i >= 2 && tokens[i - 2].is_word("SELECT")
            }
            _ => false,
        };
        if !after_select {
            continue;
        }

        // TOP n | TOP (n)
        let (count, mut next) = match tokens.get(i + 1) {
            Some(n) if n.kind == TokenKind::Number => (n.text.to_string(), i + 2),
            Some(p) if p.is_punct('(') => match matching_paren(&tokens, i + 1) {
                Some(close) => (src[p.end..tokens[close].start].trim().to_string(), close + 1),
                None => continue,
            },
            _ => continue,
        };
        let percent = tokens.get(next).is_some_and(|t| t.is_word("PERCENT"));
        if percent {
            next += 1;
        }
        if tokens.get(next).is_some_and(|t| t.is_any_word(&["WITH"]))
            && tokens.get(next + 1).is_some_and(|t| t.is_word("TIES"))
        {
            next += 2;
        }
        let clause_end = tokens.get(next).map(|t| t.start).unwrap_or(src.len());

        // End of this SELECT: `;`, an unmatched `)` or end of text.
        let mut depth = 0i32;
        let mut stmt_end = src.len();
        for t in &tokens[next..] {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                if depth == 0 {
                    stmt_end = t.start;
                    break;
                }
                depth -= 1;
            } else if depth == 0 && t.is_punct(';') {
                stmt_end = t.start;
                break;
            }
        }

        let mut out = String::with_capacity(src.len() + 16);
        out.push_str(&src[..t.start]);
        out.push_str(src[clause_end..stmt_end].trim_end());
        if !percent {
            out.push_str(" LIMIT ");
            out.push_str(&count);
        }
        let rest = &src[stmt_end..];
        if !rest.is_empty() && !rest.starts_with(';') && !rest.starts_with(')') {
            out.push(' ');
        }
        out.push_str(rest);
        // Further TOP clauses are handled on the rewritten text.
        return top_to_limit(&out, ctx);
    }
    src.to_string()
}

/// `YEAR(d)`, `MONTH(d)` and `DAY(d)` to `EXTRACT`.
pub fn date_part_functions(src: &str, _ctx: &RewriteContext) -> String {
    rewrite_calls(src, &["YEAR", "MONTH", "DAY"], &|name, args, _| match args {
        [arg] => Some(format!("EXTRACT({} FROM {})::integer", name, arg)),
        _ => None,
    })
}

/// Rewrite the type in every `CAST(expr AS type)` with `map`.
pub fn cast_types(src: &str, map: &dyn Fn(&str) -> String) -> String {
    rewrite_calls(src, &["CAST"], &|_, args, _| {
        let [arg] = args else { return None };
        let tokens = tokenize(arg);
        let mut depth = 0i32;
        let mut as_at = None;
        for (k, t) in tokens.iter().enumerate() {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                depth -= 1;
            } else if depth == 0 && t.is_word("AS") {
                as_at = Some(k);
            }
        }
        let as_at = as_at?;
        let expr = arg[..tokens[as_at].start].trim();
        let declared = arg[tokens[as_at].end..].trim();
        let mapped = map(declared);
        if mapped.eq_ignore_ascii_case(declared) {
            return None;
        }
        Some(format!("CAST({} AS {})", expr, mapped))
    })
}

/// Words that may begin a statement in a procedural body.
pub const STATEMENT_WORDS: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "TRUNCATE",
    "SET",
    "DECLARE",
    "IF",
    "WHILE",
    "RETURN",
    "EXEC",
    "EXECUTE",
    "PRINT",
    "BREAK",
    "CONTINUE",
    "RAISERROR",
    "THROW",
    "COMMIT",
    "ROLLBACK",
    "SAVE",
    "WITH",
    "OPEN",
    "FETCH",
    "CLOSE",
    "DEALLOCATE",
];

/// Insert `;` between statements of a body written without terminators.
///
/// Statement boundaries are found from leading keywords; `UPDATE ... SET`,
/// `INSERT ... SELECT`, `WITH ... SELECT` and set operators continue the
/// current statement. The condition of an `IF` or `WHILE` runs until its
/// body starts, so it never receives a terminator.
pub fn terminate_statements(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    let mut depth = 0i32;
    let mut case_depth = 0usize;
    // First keyword of the open statement, if any.
    let mut current: Option<String> = None;
    let mut in_header = false;
    let mut update_has_set = false;

    let terminate_before = |k: usize, splices: &mut Vec<Splice>| {
        if k > 0 {
            let end = tokens[k - 1].end;
            splices.push(Splice {
                start: end,
                end,
                text: ";".to_string(),
            });
        }
    };

    let mut k = 0;
    while k < tokens.len() {
        let t = &tokens[k];
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        }
        if depth != 0 || t.is_punct('(') || t.is_punct(')') {
            if current.is_none() {
                current = Some("EXPR".into());
            }
            k += 1;
            continue;
        }

        if t.is_word("CASE") {
            case_depth += 1;
        } else if case_depth > 0 {
            if t.is_word("END") {
                case_depth -= 1;
            }
        } else if t.is_punct(';') {
            current = None;
            in_header = false;
        } else if t.is_word("BEGIN")
            && !tokens
                .get(k + 1)
                .is_some_and(|n| n.is_any_word(&["TRAN", "TRANSACTION", "DISTRIBUTED"]))
        {
            if current.as_deref().is_some_and(|c| c != "END") && !in_header {
                terminate_before(k, &mut splices);
            }
            current = None;
            in_header = false;
            if tokens.get(k + 1).is_some_and(|n| n.is_any_word(&["TRY", "CATCH"])) {
                k += 1;
            }
        } else if t.is_word("END") {
            if current.as_deref().is_some_and(|c| c != "END") && !in_header {
                terminate_before(k, &mut splices);
            }
            current = Some("END".into());
            in_header = false;
            if tokens.get(k + 1).is_some_and(|n| n.is_any_word(&["TRY", "CATCH"])) {
                k += 1;
            }
        } else if t.is_word("ELSE") {
            if current.as_deref().is_some_and(|c| c != "END") && !in_header {
                terminate_before(k, &mut splices);
            }
            current = None;
            in_header = false;
        } else if t.is_any_word(STATEMENT_WORDS) {
            let word = t.text.to_uppercase();
            let prev = k.checked_sub(1).map(|p| &tokens[p]);
            let cur = current.as_deref();
            let continues = match word.as_str() {
                "SET" => cur == Some("UPDATE") && !update_has_set,
                "SELECT" => {
                    matches!(cur, Some("INSERT") | Some("WITH"))
                        || prev.is_some_and(|p| {
                            p.is_any_word(&["UNION", "ALL", "EXCEPT", "INTERSECT", "QUERY"])
                        })
                }
                "INSERT" | "UPDATE" | "DELETE" | "MERGE" => {
                    cur == Some("WITH") || prev.is_some_and(|p| p.is_any_word(&["ON", "FOR"]))
                }
                "EXEC" | "EXECUTE" => {
                    cur == Some("INSERT") || prev.is_some_and(|p| p.is_word("WITH"))
                }
                "WITH" => cur.is_some() && cur != Some("END"),
                "IF" => prev.is_some_and(|p| {
                    p.is_any_word(&["TABLE", "VIEW", "FUNCTION", "PROCEDURE", "TRIGGER", "INDEX"])
                }),
                _ => false,
            };

            if continues {
                if word == "SET" {
                    update_has_set = true;
                } else {
                    current = Some(word);
                }
            } else {
                // The first statement of a single-statement IF/WHILE body
                // follows its condition without a terminator.
                if !in_header && cur.is_some() {
                    terminate_before(k, &mut splices);
                }
                in_header = matches!(word.as_str(), "IF" | "WHILE");
                update_has_set = false;
                current = Some(word);
            }
        } else if t.is_word("VALUES") && current.as_deref() == Some("INSERT") {
            current = Some("VALUES".into());
        } else if current.is_none() {
            current = Some("EXPR".into());
        }
        k += 1;
    }

    if current.as_deref().is_some_and(|c| c != "END") && !in_header {
        if let Some(last) = tokens.last() {
            splices.push(Splice {
                start: last.end,
                end: last.end,
                text: ";".to_string(),
            });
        }
    }
    apply_splices(src, splices)
}

/// Remove `@` from variable and parameter names; `@@` globals are kept so
/// the validator can flag them.
pub fn drop_sigils(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let splices = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Variable && !t.text.starts_with("@@"))
        .map(|t| Splice {
            start: t.start,
            end: t.start + 1,
            text: String::new(),
        })
        .collect();
    apply_splices(src, splices)
}

/// Keywords after which a `SET` begins a new statement.
const STATEMENT_BOUNDARY_WORDS: &[&str] = &["BEGIN", "THEN", "ELSE", "DO", "LOOP", "REPEAT"];

/// `SET x = y` to `x := y` for statement-level assignments. `UPDATE ... SET`
/// is left alone.
pub fn set_assignments(src: &str, _ctx: &RewriteContext) -> String {
    let tokens = tokenize(src);
    let mut splices = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if !t.is_word("SET") {
            continue;
        }
        let at_boundary = match i.checked_sub(1).map(|p| &tokens[p]) {
            None => true,
            Some(p) => p.is_punct(';') || p.is_any_word(STATEMENT_BOUNDARY_WORDS),
        };
        if !at_boundary {
            continue;
        }

        // Target: word, @var or NEW.col / OLD.col, followed by `=`.
        let mut k = i + 1;
        let target_start = match tokens.get(k) {
            Some(n) if matches!(n.kind, TokenKind::Word | TokenKind::Variable | TokenKind::QuotedIdent) => n.start,
            _ => continue,
        };
        k += 1;
        while tokens.get(k).is_some_and(|d| d.is_punct('.'))
            && tokens
                .get(k + 1)
                .is_some_and(|n| matches!(n.kind, TokenKind::Word | TokenKind::QuotedIdent))
        {
            k += 2;
        }
        let target_end = tokens[k - 1].end;

        // Compound `+=` style operators expand to `x := x + ...`.
        let op = tokens
            .get(k)
            .filter(|o| o.kind == TokenKind::Punct && "+-*/".contains(o.text))
            .filter(|o| tokens.get(k + 1).is_some_and(|e| e.is_punct('=') && e.start == o.end));
        let target = &src[target_start..target_end];
        let splice = match (op, tokens.get(k)) {
            (Some(o), _) => Splice {
                start: t.start,
                end: tokens[k + 1].end,
                text: format!("{} := {} {}", target, target, o.text),
            },
            (None, Some(eq)) if eq.is_punct('=') => Splice {
                start: t.start,
                end: eq.end,
                text: format!("{} :=", target),
            },
            _ => continue,
        };
        splices.push(splice);
    }
    apply_splices(src, splices)
}

/// Index of the first top-level `;` at or after `from`.
pub fn statement_end(tokens: &[Token<'_>], from: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (k, t) in tokens.iter().enumerate().skip(from) {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth <= 0 && t.is_punct(';') {
            return Some(k);
        }
    }
    None
}

/// Find the `END` closing the block opened by `BEGIN` or `CASE` at `open`.
pub fn matching_end(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for k in open..tokens.len() {
        let t = &tokens[k];
        if is_block_open(tokens, k) {
            depth += 1;
        } else if t.is_word("END") && !closes_compound(tokens, k) {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(k);
            }
        }
    }
    None
}

/// `BEGIN` (not a transaction start) or `CASE` (not `END CASE`).
fn is_block_open(tokens: &[Token<'_>], k: usize) -> bool {
    let t = &tokens[k];
    let after_end = k > 0 && tokens[k - 1].is_word("END");
    if t.is_word("BEGIN") {
        !tokens
            .get(k + 1)
            .is_some_and(|n| n.is_any_word(&["TRAN", "TRANSACTION", "DISTRIBUTED", "WORK"]))
    } else {
        t.is_word("CASE") && !after_end
    }
}

/// `END IF`, `END LOOP`, `END WHILE` or `END REPEAT` closing a statement that
/// never opened a block, as opposed to a block `END` followed by a new
/// statement.
fn closes_compound(tokens: &[Token<'_>], k: usize) -> bool {
    let is_compound = tokens
        .get(k + 1)
        .is_some_and(|n| n.is_any_word(&["IF", "LOOP", "WHILE", "REPEAT"]));
    let statement_over = |j: usize| match tokens.get(j) {
        None => true,
        Some(t) => t.is_punct(';'),
    };
    is_compound
        && (statement_over(k + 2)
            || (tokens.get(k + 2).is_some_and(|l| l.kind == TokenKind::Word) && statement_over(k + 3)))
}

/// Strip a surrounding `BEGIN ... END` (optionally labelled) from a body.
pub fn unwrap_block(body: &str) -> String {
    let trimmed = body.trim().trim_end_matches(';').trim_end();
    let tokens = tokenize(trimmed);
    let begin = match tokens.first() {
        Some(t) if t.is_word("BEGIN") => 0,
        Some(t)
            if t.kind == TokenKind::Word
                && tokens.get(1).is_some_and(|c| c.is_punct(':'))
                && tokens.get(2).is_some_and(|b| b.is_word("BEGIN")) =>
        {
            2
        }
        _ => return trimmed.to_string(),
    };
    let Some(end) = matching_end(&tokens, begin) else {
        return trimmed.to_string();
    };
    // Only a trailing label may follow the closing END.
    let trailing = &tokens[end + 1..];
    let only_label = trailing.is_empty()
        || (trailing.len() == 1 && trailing[0].kind == TokenKind::Word);
    if !only_label {
        return trimmed.to_string();
    }
    trimmed[tokens[begin].end..tokens[end].start].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RewriteContext {
        RewriteContext {
            source_schema: "dbo".into(),
            kind: RoutineKind::Procedure,
            returns_void: true,
        }
    }

    #[test]
    fn test_strip_comments_keeps_strings() {
        let src = "SELECT '--not a comment' -- real\nFROM t /* block */ WHERE x = 1";
        assert_eq!(
            strip_comments(src, &ctx()),
            "SELECT '--not a comment' \nFROM t   WHERE x = 1"
        );
    }

    #[test]
    fn test_strip_schema_qualifiers() {
        assert_eq!(
            strip_schema_qualifiers("SELECT * FROM dbo.orders JOIN \"dbo\".items ON x.dbo = 1", &ctx()),
            "SELECT * FROM orders JOIN items ON x.dbo = 1"
        );
    }

    #[test]
    fn test_current_time_functions() {
        assert_eq!(
            current_time_functions("SELECT GETDATE(), now(), CURDATE(), CURTIME()", &ctx()),
            "SELECT CURRENT_TIMESTAMP, CURRENT_TIMESTAMP, CURRENT_DATE, CURRENT_TIME"
        );
    }

    #[test]
    fn test_concat_and_coalesce() {
        assert_eq!(
            concat_to_operator("SELECT CONCAT(first_name, ' ', CONCAT(a, b)) AS n", &ctx()),
            "SELECT (first_name || ' ' || (a || b)) AS n"
        );
        assert_eq!(
            null_coalescing("SELECT ISNULL(a, 0), IFNULL(b, 'x'), ISNULL(c)", &ctx()),
            "SELECT COALESCE(a, 0), COALESCE(b, 'x'), (c IS NULL)"
        );
    }

    #[test]
    fn test_conditional_expression_ignores_if_statements() {
        assert_eq!(
            conditional_expression("SELECT IF(a > 1, 'big', 'small')", &ctx()),
            "SELECT (CASE WHEN a > 1 THEN 'big' ELSE 'small' END)"
        );
        assert_eq!(
            conditional_expression("IF (a > 1) THEN", &ctx()),
            "IF (a > 1) THEN"
        );
    }

    #[test]
    fn test_group_concat() {
        assert_eq!(
            group_concat(
                "SELECT GROUP_CONCAT(name ORDER BY name ASC SEPARATOR ', ') FROM actor",
                &ctx()
            ),
            "SELECT string_agg((name)::text, ', ' ORDER BY name ASC) FROM actor"
        );
        assert_eq!(
            group_concat("GROUP_CONCAT(DISTINCT a)", &ctx()),
            "string_agg(DISTINCT (a)::text, ',')"
        );
        assert_eq!(
            group_concat("GROUP_CONCAT(first, ' ', last SEPARATOR ';')", &ctx()),
            "string_agg((first || ' ' || last)::text, ';')"
        );
    }

    #[test]
    fn test_top_to_limit() {
        assert_eq!(
            top_to_limit("SELECT TOP 10 name FROM t ORDER BY name", &ctx()),
            "SELECT name FROM t ORDER BY name LIMIT 10"
        );
        assert_eq!(
            top_to_limit("SELECT a FROM t WHERE id IN (SELECT TOP (5) id FROM u);", &ctx()),
            "SELECT a FROM t WHERE id IN (SELECT id FROM u LIMIT 5);"
        );
        assert_eq!(
            top_to_limit("SELECT TOP 100 PERCENT a FROM t", &ctx()),
            "SELECT a FROM t"
        );
    }

    #[test]
    fn test_rules_are_idempotent() {
        let src = "SELECT TOP 3 CONCAT(a, b), ISNULL(c, 0), GETDATE() FROM dbo.t";
        let rules = [
            RewriteRule { name: "schema", apply: strip_schema_qualifiers },
            RewriteRule { name: "time", apply: current_time_functions },
            RewriteRule { name: "top", apply: top_to_limit },
            RewriteRule { name: "concat", apply: concat_to_operator },
            RewriteRule { name: "null", apply: null_coalescing },
        ];
        let once = apply_rules(&rules, src, &ctx());
        assert_eq!(apply_rules(&rules, &once, &ctx()), once);
    }

    #[test]
    fn test_set_assignments() {
        assert_eq!(
            set_assignments("BEGIN SET total = total + 1; SET NEW.updated = now; UPDATE t SET a = 1; END", &ctx()),
            "BEGIN total := total + 1; NEW.updated := now; UPDATE t SET a = 1; END"
        );
        assert_eq!(set_assignments("SET @n += 2", &ctx()), "@n := @n + 2");
    }

    #[test]
    fn test_drop_sigils() {
        assert_eq!(
            drop_sigils("x := @a + @@ROWCOUNT + '@b'", &ctx()),
            "x := a + @@ROWCOUNT + '@b'"
        );
    }

    #[test]
    fn test_unwrap_block_with_compound_ends() {
        assert_eq!(
            unwrap_block("BEGIN\n  IF x THEN SET y = 1; END IF;\n  WHILE y DO SET y = 0; END WHILE lbl;\nEND"),
            "IF x THEN SET y = 1; END IF;\n  WHILE y DO SET y = 0; END WHILE lbl;"
        );
    }

    #[test]
    fn test_unwrap_block() {
        assert_eq!(unwrap_block("BEGIN\n  SELECT 1;\nEND;"), "SELECT 1;");
        assert_eq!(unwrap_block("main: BEGIN x := 1; END main"), "x := 1;");
        assert_eq!(unwrap_block("RETURN a + 1"), "RETURN a + 1");
        assert_eq!(
            unwrap_block("BEGIN x := 1; END; BEGIN y := 2; END"),
            "BEGIN x := 1; END; BEGIN y := 2; END"
        );
    }

    #[test]
    fn test_replace_words() {
        assert_eq!(
            replace_words("IF a THEN x; ELSEIF b THEN y; END IF; 'ELSEIF'", &["ELSEIF"], "ELSIF"),
            "IF a THEN x; ELSIF b THEN y; END IF; 'ELSEIF'"
        );
        assert_eq!(replace_words("END  WHILE;", &["END", "WHILE"], "END LOOP"), "END LOOP;");
    }

    #[test]
    fn test_terminate_statements() {
        let src = "DECLARE @n INT = 0\nIF @n > 0\n    SET @n = 1\nELSE\n    SET @n = 2\nUPDATE t\nSET a = 1\nWHERE b = (SELECT MAX(c) FROM u)\nINSERT INTO t (a) SELECT a FROM u\nRETURN";
        assert_eq!(
            terminate_statements(src, &ctx()),
            "DECLARE @n INT = 0;\nIF @n > 0\n    SET @n = 1;\nELSE\n    SET @n = 2;\nUPDATE t\nSET a = 1\nWHERE b = (SELECT MAX(c) FROM u);\nINSERT INTO t (a) SELECT a FROM u;\nRETURN;"
        );
    }

    #[test]
    fn test_terminate_statements_single_statement_bodies() {
        assert_eq!(
            terminate_statements("WHILE @i < 3\n    SET @i = @i + 1\nSELECT @i", &ctx()),
            "WHILE @i < 3\n    SET @i = @i + 1;\nSELECT @i;"
        );
        assert_eq!(
            terminate_statements("IF @a = 1\n    IF @b = 2\n        SET @c = 1\nSET @d = 2", &ctx()),
            "IF @a = 1\n    IF @b = 2\n        SET @c = 1;\nSET @d = 2;"
        );
    }

    #[test]
    fn test_terminate_statements_blocks() {
        let src = "IF @a = 1 BEGIN SET @b = 2 SELECT @b END ELSE BEGIN SET @b = CASE WHEN @a > 2 THEN 1 ELSE 0 END END SET @c = 1";
        assert_eq!(
            terminate_statements(src, &ctx()),
            "IF @a = 1 BEGIN SET @b = 2; SELECT @b; END ELSE BEGIN SET @b = CASE WHEN @a > 2 THEN 1 ELSE 0 END; END; SET @c = 1;"
        );
        let once = terminate_statements(src, &ctx());
        assert_eq!(terminate_statements(&once, &ctx()), once);
    }

    #[test]
    fn test_cast_types() {
        let map = |t: &str| if t.eq_ignore_ascii_case("SIGNED") { "bigint".to_string() } else { t.to_string() };
        assert_eq!(cast_types("SELECT CAST(a AS SIGNED), CAST(b AS text)", &map), "SELECT CAST(a AS bigint), CAST(b AS text)");
    }

    #[test]
    fn test_date_part_functions() {
        assert_eq!(
            date_part_functions("WHERE YEAR(created) = 2024", &ctx()),
            "WHERE EXTRACT(YEAR FROM created)::integer = 2024"
        );
    }
}

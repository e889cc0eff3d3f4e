//! Pre-apply checks for rewritten views and PL/pgSQL bodies.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use super::lexer::{tokenize, Token, TokenKind};

/// Result of checking a rewritten body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Only `IF` blocks are left open; this many `END IF` closers are missing.
    MissingClosers(usize),
    Invalid(String),
}

/// Parse a view query against the PostgreSQL grammar.
pub fn check_view(query: &str) -> Verdict {
    let tokens = tokenize(query);
    if let Some(problem) = lexical_problem(&tokens).or_else(|| residual_marker(&tokens)) {
        return Verdict::Invalid(problem);
    }
    match Parser::parse_sql(&PostgreSqlDialect {}, query) {
        Ok(statements) if statements.len() == 1 => Verdict::Valid,
        Ok(statements) => Verdict::Invalid(format!(
            "expected one query, found {} statements",
            statements.len()
        )),
        Err(e) => Verdict::Invalid(e.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Begin,
    If,
    Loop,
    Case,
}

impl Block {
    fn closer(self) -> &'static str {
        match self {
            Block::Begin => "END",
            Block::If => "END IF",
            Block::Loop => "END LOOP",
            Block::Case => "END CASE",
        }
    }
}

/// Check block structure, quoting and leftover source syntax in a PL/pgSQL
/// body (the text between the function's `BEGIN` and `END`).
pub fn check_body(body: &str) -> Verdict {
    let tokens = tokenize(body);
    if let Some(problem) = lexical_problem(&tokens).or_else(|| residual_marker(&tokens)) {
        return Verdict::Invalid(problem);
    }

    let mut stack: Vec<Block> = Vec::new();
    let mut k = 0;
    while k < tokens.len() {
        let t = &tokens[k];
        let after_end = k > 0 && tokens[k - 1].is_word("END");
        if t.is_word("BEGIN") {
            stack.push(Block::Begin);
        } else if t.is_word("IF") && !after_end && is_statement_start(&tokens, k) {
            stack.push(Block::If);
        } else if t.is_word("LOOP") && !after_end {
            stack.push(Block::Loop);
        } else if t.is_word("CASE") && !after_end {
            stack.push(Block::Case);
        } else if t.is_word("END") {
            let expected = match tokens.get(k + 1) {
                Some(n) if n.is_word("IF") => Some(Block::If),
                Some(n) if n.is_word("LOOP") => Some(Block::Loop),
                Some(n) if n.is_word("CASE") => Some(Block::Case),
                _ => None,
            };
            let Some(open) = stack.pop() else {
                return Verdict::Invalid(format!("unmatched END at offset {}", t.start));
            };
            let matches = match expected {
                Some(kind) => kind == open,
                // A CASE expression closes with a bare END.
                None => matches!(open, Block::Begin | Block::Case),
            };
            if !matches {
                return Verdict::Invalid(format!(
                    "{} found at offset {} where {} was expected",
                    expected.map(Block::closer).unwrap_or("END"),
                    t.start,
                    open.closer()
                ));
            }
            if expected.is_some() {
                k += 1;
            }
        }
        k += 1;
    }

    if stack.is_empty() {
        Verdict::Valid
    } else if stack.iter().all(|b| *b == Block::If) {
        Verdict::MissingClosers(stack.len())
    } else {
        let open: Vec<&str> = stack.iter().map(|b| b.closer()).collect();
        Verdict::Invalid(format!("unclosed blocks, missing {}", open.join(", ")))
    }
}

/// `IF` opening a statement, as opposed to `DROP TABLE IF EXISTS`.
fn is_statement_start(tokens: &[Token<'_>], k: usize) -> bool {
    match k.checked_sub(1).map(|p| &tokens[p]) {
        None => true,
        Some(prev) => {
            prev.is_punct(';')
                || prev.is_punct('>')
                || prev.is_any_word(&["THEN", "ELSE", "LOOP", "BEGIN"])
        }
    }
}

fn lexical_problem(tokens: &[Token<'_>]) -> Option<String> {
    if let Some(t) = tokens.iter().find(|t| !t.terminated) {
        return Some(format!("unterminated quote at offset {}", t.start));
    }
    let mut depth = 0i32;
    for t in tokens {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
            if depth < 0 {
                return Some(format!("unbalanced ')' at offset {}", t.start));
            }
        }
    }
    (depth != 0).then(|| format!("{} unclosed parentheses", depth))
}

/// Syntax that only makes sense in the source dialect.
fn residual_marker(tokens: &[Token<'_>]) -> Option<String> {
    tokens.iter().find_map(|t| {
        let residual = match t.kind {
            TokenKind::Variable | TokenKind::Backtick => true,
            TokenKind::Punct => ["@", "[", "]", "#"].contains(&t.text),
            TokenKind::Word => t.is_any_word(&["DELIMITER", "DECLARE", "HANDLER"]),
            _ => false,
        };
        residual.then(|| format!("source syntax '{}' left at offset {}", t.text, t.start))
    })
}

/// Append `count` closers for unterminated `IF` blocks.
pub fn insert_closers(body: &str, count: usize) -> String {
    let mut out = body.trim_end().to_string();
    for _ in 0..count {
        out.push_str("\nEND IF;");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_body() {
        let body = "IF x > 0 THEN\n  y := 1;\nELSIF x < 0 THEN\n  y := CASE WHEN z THEN 1 ELSE 2 END;\nEND IF;\nWHILE y < 10 LOOP\n  y := y + 1;\nEND LOOP;\nBEGIN\n  NULL;\nEXCEPTION WHEN OTHERS THEN\n  RAISE;\nEND;";
        assert_eq!(check_body(body), Verdict::Valid);
    }

    #[test]
    fn test_drop_if_exists_is_not_a_block() {
        assert_eq!(
            check_body("DROP TABLE IF EXISTS tmp;\nIF EXISTS (SELECT 1) THEN\n  NULL;\nEND IF;"),
            Verdict::Valid
        );
    }

    #[test]
    fn test_missing_end_if() {
        let body = "IF a THEN\n  IF b THEN\n    x := 1;\n  END IF;\n  y := 2;";
        assert_eq!(check_body(body), Verdict::MissingClosers(1));
        assert_eq!(check_body(&insert_closers(body, 1)), Verdict::Valid);
    }

    #[test]
    fn test_mismatched_closer() {
        assert!(matches!(
            check_body("LOOP\n  x := 1;\nEND IF;"),
            Verdict::Invalid(_)
        ));
        assert!(matches!(check_body("BEGIN\n  NULL;"), Verdict::Invalid(_)));
    }

    #[test]
    fn test_residual_markers() {
        for body in [
            "x := @y;",
            "SELECT `a` FROM t;",
            "SELECT [a] FROM t;",
            "DECLARE c CURSOR FOR SELECT 1;",
            "INSERT INTO #tmp VALUES (1);",
        ] {
            assert!(matches!(check_body(body), Verdict::Invalid(_)), "{}", body);
        }
    }

    #[test]
    fn test_unbalanced_quotes_and_parens() {
        assert!(matches!(check_body("x := 'oops;"), Verdict::Invalid(_)));
        assert!(matches!(check_body("x := (1 + 2;"), Verdict::Invalid(_)));
    }

    #[test]
    fn test_check_view() {
        assert_eq!(
            check_view("SELECT id, name FROM customers WHERE active LIMIT 10"),
            Verdict::Valid
        );
        assert!(matches!(check_view("SELECT FROM WHERE"), Verdict::Invalid(_)));
        assert!(matches!(
            check_view("SELECT TOP 5 [name] FROM t"),
            Verdict::Invalid(_)
        ));
    }
}

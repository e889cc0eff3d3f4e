//! A small SQL tokenizer shared by the rewrite rules and the validator.
//!
//! Tokens carry byte offsets into the source so rules can splice text while
//! leaving everything they do not touch (whitespace, layout) unchanged.
//! Comments are skipped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Number,
    /// `'...'` string literal.
    Str,
    /// `"..."` identifier.
    QuotedIdent,
    /// `` `...` `` identifier.
    Backtick,
    /// `@name` or `@@name`.
    Variable,
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
    /// False for a quoted token that runs to the end of input.
    pub terminated: bool,
}

impl Token<'_> {
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_any_word(&self, words: &[&str]) -> bool {
        self.kind == TokenKind::Word && words.iter().any(|w| self.text.eq_ignore_ascii_case(w))
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '#'
}

/// Tokenize `src`, skipping whitespace and comments.
pub fn tokenize(src: &str) -> Vec<Token<'_>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        // Comments
        if c == '-' && bytes.get(start + 1) == Some(&b'-') {
            while let Some(&(_, c)) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }
        if c == '/' && bytes.get(start + 1) == Some(&b'*') {
            chars.next();
            chars.next();
            let mut prev = '\0';
            for (_, c) in chars.by_ref() {
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            continue;
        }

        let (kind, end, terminated) = match c {
            '\'' | '"' | '`' => {
                chars.next();
                let (end, terminated) = scan_quoted(src, &mut chars, c);
                let kind = match c {
                    '\'' => TokenKind::Str,
                    '"' => TokenKind::QuotedIdent,
                    _ => TokenKind::Backtick,
                };
                (kind, end, terminated)
            }
            '@' => {
                chars.next();
                let mut end = start + 1;
                while let Some(&(i, c)) = chars.peek() {
                    if c == '@' || is_word_char(c) {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end == start + 1 {
                    (TokenKind::Punct, end, true)
                } else {
                    (TokenKind::Variable, end, true)
                }
            }
            c if is_word_start(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if is_word_char(c) {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                (TokenKind::Word, end, true)
            }
            c if c.is_ascii_digit() => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' {
                        end = i + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                (TokenKind::Number, end, true)
            }
            c => {
                chars.next();
                (TokenKind::Punct, start + c.len_utf8(), true)
            }
        };

        tokens.push(Token {
            kind,
            text: &src[start..end],
            start,
            end,
            terminated,
        });
    }

    tokens
}

/// Scan past a quoted token whose opening quote was consumed. A doubled
/// quote is an escaped quote.
fn scan_quoted(
    src: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
) -> (usize, bool) {
    while let Some((i, c)) = chars.next() {
        if c == quote {
            match chars.peek() {
                Some(&(_, next)) if next == quote => {
                    chars.next();
                }
                _ => return (i + 1, true),
            }
        }
    }
    (src.len(), false)
}

/// Index of the `)` matching the `(` at `open`.
pub fn matching_paren(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (k, t) in tokens.iter().enumerate().skip(open) {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(k);
            }
        }
    }
    None
}

/// Split the tokens strictly between `open` and `close` on top-level commas,
/// returning each argument's source text, trimmed.
pub fn split_args<'a>(src: &'a str, tokens: &[Token<'_>], open: usize, close: usize) -> Vec<&'a str> {
    if close <= open + 1 {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut arg_start = tokens[open].end;
    for t in &tokens[open + 1..close] {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
        } else if depth == 0 && t.is_punct(',') {
            args.push(src[arg_start..t.start].trim());
            arg_start = t.end;
        }
    }
    args.push(src[arg_start..tokens[close].start].trim());
    args
}

/// Split `text` on top-level commas.
pub fn split_top_level(text: &str) -> Vec<String> {
    let wrapped = format!("({})", text);
    let tokens = tokenize(&wrapped);
    match matching_paren(&tokens, 0) {
        Some(close) if close == tokens.len() - 1 => split_args(&wrapped, &tokens, 0, close)
            .into_iter()
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect(),
        _ => vec![text.trim().to_string()],
    }
}

//! ECMAScript tokenizer for the bundler.
//!
//! Only as much lexing as static import/export analysis needs: every token
//! carries its byte span, its bracket depth and whether a line terminator
//! precedes it. Whitespace, comments, template chunks and regular
//! expressions are scanned by hand (they depend on context); everything else
//! goes through logos.

use logos::Logos;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier or keyword.
    Ident,
    /// `#field`
    PrivateName,
    Number,
    /// Single- or double-quoted string.
    Str,
    /// A template chunk ending in a backtick.
    Template,
    /// A template chunk ending in `${`.
    TemplateHead,
    Regex,
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Number of enclosing `{`, `(`, `[` and `${`.
    pub depth: u32,
    pub newline_before: bool,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.span.start..self.span.end]
    }

    pub fn is_punct(&self, src: &str, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text(src) == punct
    }

    pub fn is_ident(&self, src: &str, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text(src) == name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LexError {
    pub message: String,
    pub offset: usize,
}

impl LexError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
enum RawToken {
    #[regex(r"[A-Za-z_$\x{80}-\x{10FFFF}][A-Za-z0-9_$\x{80}-\x{10FFFF}]*")]
    Ident,

    #[regex(r"#[A-Za-z_$\x{80}-\x{10FFFF}][A-Za-z0-9_$\x{80}-\x{10FFFF}]*")]
    PrivateName,

    #[regex(r"[0-9][0-9_]*(\.[0-9_]*)?([eE][+-]?[0-9_]+)?n?")]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9_]+)?")]
    #[regex(r"0[xX][0-9a-fA-F_]+n?")]
    #[regex(r"0[oO][0-7_]+n?")]
    #[regex(r"0[bB][01_]+n?")]
    Number,

    #[regex(r#""([^"\\\r\n]|\\[^\r\n]|\\\r?\n)*""#)]
    #[regex(r#"'([^'\\\r\n]|\\[^\r\n]|\\\r?\n)*'"#)]
    Str,

    #[token("{")]
    #[token("(")]
    #[token(")")]
    #[token("[")]
    #[token("]")]
    #[token(";")]
    #[token(",")]
    #[token("~")]
    #[token("?")]
    #[token(":")]
    #[token(".")]
    #[token("...")]
    #[token("@")]
    #[token("=>")]
    #[token("=")]
    #[token("==")]
    #[token("===")]
    #[token("!")]
    #[token("!=")]
    #[token("!==")]
    #[token("<")]
    #[token("<=")]
    #[token("<<")]
    #[token("<<=")]
    #[token(">")]
    #[token(">=")]
    #[token(">>")]
    #[token(">>=")]
    #[token(">>>")]
    #[token(">>>=")]
    #[token("+")]
    #[token("+=")]
    #[token("++")]
    #[token("-")]
    #[token("-=")]
    #[token("--")]
    #[token("*")]
    #[token("*=")]
    #[token("**")]
    #[token("**=")]
    #[token("%")]
    #[token("%=")]
    #[token("&")]
    #[token("&=")]
    #[token("&&")]
    #[token("&&=")]
    #[token("|")]
    #[token("|=")]
    #[token("||")]
    #[token("||=")]
    #[token("^")]
    #[token("^=")]
    #[token("??")]
    #[token("??=")]
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    /// `block` is false for object literals and other expression braces.
    Brace { block: bool },
    /// `control` is set for the heads of `if`, `while`, `for` and `with`.
    Paren { control: bool },
    Bracket,
    Template,
}

/// Keywords after which a `/` starts a regular expression.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await", "extends",
];

/// Keywords whose parenthesised head is followed by a statement.
const CONTROL_KEYWORDS: &[&str] = &["if", "while", "for", "with"];

/// Tokenize `src`. Fails on unterminated literals/comments and unbalanced
/// brackets.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let bytes = src.as_bytes();
    let mut tokens: Vec<Token> = Vec::new();
    let mut stack: Vec<(Open, usize)> = Vec::new();
    let mut newline_before = false;
    // Whether the last token closed a block or a control head, so that a
    // following `/` starts a statement rather than a division.
    let mut after_statement = false;
    let mut pos = 0;

    // Hashbang
    if src.starts_with("#!") {
        pos = src.find('\n').unwrap_or(src.len());
    }

    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b' ' | b'\t' | b'\r' | 0x0b | 0x0c => {
                pos += 1;
                continue;
            }
            b'\n' => {
                newline_before = true;
                pos += 1;
                continue;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                pos = src[pos..].find('\n').map_or(src.len(), |i| pos + i);
                continue;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                let end = src[pos + 2..]
                    .find("*/")
                    .map(|i| pos + 2 + i + 2)
                    .ok_or_else(|| LexError::new("Unterminated comment", pos))?;
                if src[pos..end].contains('\n') {
                    newline_before = true;
                }
                pos = end;
                continue;
            }
            _ => {}
        }

        if b >= 0x80 {
            if let Some(ch) = src[pos..].chars().next() {
                if ch.is_whitespace() || ch == '\u{feff}' {
                    if ch == '\u{2028}' || ch == '\u{2029}' {
                        newline_before = true;
                    }
                    pos += ch.len_utf8();
                    continue;
                }
            }
        }

        let start = pos;
        let mut depth = stack.len() as u32;
        let mut closes_statement = false;
        let (kind, end) = match b {
            b'`' => {
                let (end, head) = scan_template(src, pos + 1)?;
                if head {
                    stack.push((Open::Template, start));
                    (TokenKind::TemplateHead, end)
                } else {
                    (TokenKind::Template, end)
                }
            }
            b'}' => match stack.pop() {
                Some((Open::Template, _)) => {
                    depth = stack.len() as u32;
                    let (end, head) = scan_template(src, pos + 1)?;
                    if head {
                        stack.push((Open::Template, start));
                        (TokenKind::TemplateHead, end)
                    } else {
                        (TokenKind::Template, end)
                    }
                }
                Some((Open::Brace { block }, _)) => {
                    depth = stack.len() as u32;
                    closes_statement = block;
                    (TokenKind::Punct, pos + 1)
                }
                _ => return Err(LexError::new("Unexpected '}'", pos)),
            },
            b'/' => {
                if regex_allowed(src, tokens.last(), after_statement) {
                    (TokenKind::Regex, scan_regex(src, pos)?)
                } else if bytes.get(pos + 1) == Some(&b'=') {
                    (TokenKind::Punct, pos + 2)
                } else {
                    (TokenKind::Punct, pos + 1)
                }
            }
            _ => {
                let mut lexer = RawToken::lexer(&src[pos..]);
                match lexer.next() {
                    Some(Ok(raw)) => {
                        let kind = match raw {
                            RawToken::Ident => TokenKind::Ident,
                            RawToken::PrivateName => TokenKind::PrivateName,
                            RawToken::Number => TokenKind::Number,
                            RawToken::Str => TokenKind::Str,
                            RawToken::Punct => TokenKind::Punct,
                        };
                        (kind, pos + lexer.span().end)
                    }
                    _ => {
                        let ch = src[pos..].chars().next().unwrap_or('\0');
                        let message = if ch == '"' || ch == '\'' {
                            "Unterminated string literal".to_string()
                        } else {
                            format!("Unexpected character '{}'", ch)
                        };
                        return Err(LexError::new(message, pos));
                    }
                }
            }
        };

        if kind == TokenKind::Punct {
            match &src[start..end] {
                "{" => {
                    let block = brace_starts_block(src, tokens.last());
                    stack.push((Open::Brace { block }, start));
                }
                "(" => {
                    let control = tokens
                        .last()
                        .is_some_and(|t| t.kind == TokenKind::Ident && CONTROL_KEYWORDS.contains(&t.text(src)));
                    stack.push((Open::Paren { control }, start));
                }
                "[" => stack.push((Open::Bracket, start)),
                ")" => {
                    match stack.pop() {
                        Some((Open::Paren { control }, _)) => closes_statement = control,
                        _ => return Err(LexError::new("Unexpected ')'", start)),
                    }
                    depth = stack.len() as u32;
                }
                "]" => {
                    match stack.pop() {
                        Some((Open::Bracket, _)) => {}
                        _ => return Err(LexError::new("Unexpected ']'", start)),
                    }
                    depth = stack.len() as u32;
                }
                _ => {}
            }
        }

        tokens.push(Token {
            kind,
            span: Span::new(start, end),
            depth,
            newline_before,
        });
        newline_before = false;
        after_statement = closes_statement;
        pos = end;
    }

    if let Some((open, offset)) = stack.last() {
        let what = match open {
            Open::Brace { .. } => "Unclosed '{'",
            Open::Paren { .. } => "Unclosed '('",
            Open::Bracket => "Unclosed '['",
            Open::Template => "Unterminated template literal",
        };
        return Err(LexError::new(what, *offset));
    }

    Ok(tokens)
}

/// Whether a `{` after `prev` opens a block (or class/function body)
/// rather than an object literal.
fn brace_starts_block(src: &str, prev: Option<&Token>) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    match prev.kind {
        TokenKind::Punct => matches!(prev.text(src), ")" | ";" | "{" | "}" | "=>"),
        TokenKind::Ident => {
            let word = prev.text(src);
            word == "do" || word == "else" || !REGEX_PRECEDING_KEYWORDS.contains(&word)
        }
        _ => false,
    }
}

fn regex_allowed(src: &str, prev: Option<&Token>, after_statement: bool) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    match prev.kind {
        TokenKind::Number
        | TokenKind::Str
        | TokenKind::Template
        | TokenKind::Regex
        | TokenKind::PrivateName => false,
        TokenKind::TemplateHead => true,
        TokenKind::Ident => REGEX_PRECEDING_KEYWORDS.contains(&prev.text(src)),
        TokenKind::Punct => match prev.text(src) {
            ")" | "}" => after_statement,
            "]" | "++" | "--" => false,
            _ => true,
        },
    }
}

/// Scan a template chunk starting just after "`" or "}". Returns the end
/// offset and whether the chunk opened a substitution.
fn scan_template(src: &str, start: usize) -> Result<(usize, bool), LexError> {
    let bytes = src.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return Ok((i + 1, false)),
            b'$' if bytes.get(i + 1) == Some(&b'{') => return Ok((i + 2, true)),
            _ => i += 1,
        }
    }
    Err(LexError::new("Unterminated template literal", start.saturating_sub(1)))
}

/// Scan a regular expression literal starting at its opening `/`.
fn scan_regex(src: &str, start: usize) -> Result<usize, LexError> {
    let bytes = src.as_bytes();
    let unterminated = || LexError::new("Unterminated regular expression", start);
    let mut i = start + 1;
    let mut in_class = false;
    loop {
        match bytes.get(i) {
            None | Some(b'\n') | Some(b'\r') => return Err(unterminated()),
            Some(b'\\') => {
                if matches!(bytes.get(i + 1), None | Some(b'\n') | Some(b'\r')) {
                    return Err(unterminated());
                }
                i += 2;
            }
            Some(b'[') => {
                in_class = true;
                i += 1;
            }
            Some(b']') => {
                in_class = false;
                i += 1;
            }
            Some(b'/') if !in_class => {
                i += 1;
                break;
            }
            Some(_) => i += 1,
        }
    }
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$') {
        i += 1;
    }
    Ok(i)
}

/// Decode the value of a quoted string token.
pub fn string_value(text: &str) -> String {
    let inner = &text[1..text.len().saturating_sub(1).max(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(ch);
                }
            }
            Some('u') => {
                let hex: String = if chars.peek() == Some(&'{') {
                    chars.next();
                    chars.by_ref().take_while(|c| *c != '}').collect()
                } else {
                    chars.by_ref().take(4).collect()
                };
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(ch);
                }
            }
            // Line continuation
            Some('\r') => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            Some('\n') => {}
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// 1-based line and column of a byte offset.
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(src.len());
    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map_or(before.chars().count(), |i| before[i + 1..].chars().count())
        + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, String)> {
        tokenize(src)
            .unwrap()
            .iter()
            .map(|t| (t.kind, t.text(src).to_string()))
            .collect()
    }

    #[test]
    fn test_import_statement_tokens() {
        let src = r#"import { jsx as _jsx } from "react/jsx-runtime";"#;
        let toks = kinds(src);
        assert_eq!(toks[0], (TokenKind::Ident, "import".into()));
        assert_eq!(toks[1], (TokenKind::Punct, "{".into()));
        assert_eq!(toks[6], (TokenKind::Ident, "from".into()));
        assert_eq!(toks[7], (TokenKind::Str, "\"react/jsx-runtime\"".into()));
        assert_eq!(toks[8], (TokenKind::Punct, ";".into()));
    }

    #[test]
    fn test_regex_versus_division() {
        let toks = kinds("const r = /ab+c/gi; const d = a / b / c;");
        assert!(toks.contains(&(TokenKind::Regex, "/ab+c/gi".into())));
        assert_eq!(toks.iter().filter(|(k, t)| *k == TokenKind::Punct && t == "/").count(), 2);

        // A slash inside a class does not terminate the literal.
        let toks = kinds("x = /[/]+/.test(s)");
        assert!(toks.contains(&(TokenKind::Regex, "/[/]+/".into())));
    }

    #[test]
    fn test_regex_after_block_or_control_head() {
        let toks = kinds("function f() {}\n/`/.test('a');");
        assert!(toks.contains(&(TokenKind::Regex, "/`/".into())));

        let toks = kinds("if (ok) /x/.test(s);");
        assert!(toks.contains(&(TokenKind::Regex, "/x/".into())));

        // Closing an expression is still followed by division.
        let toks = kinds("const n = ({}) / 2; const m = f(a) / 2; const o = { a: 1 } / 2;");
        assert!(toks.iter().all(|(k, _)| *k != TokenKind::Regex));
        assert_eq!(toks.iter().filter(|(k, t)| *k == TokenKind::Punct && t == "/").count(), 3);
    }

    #[test]
    fn test_nested_templates_track_depth() {
        let src = "const s = `a ${ `b ${c} d` } e`; export default s;";
        let tokens = tokenize(src).unwrap();
        let export = tokens.iter().find(|t| t.is_ident(src, "export")).unwrap();
        assert_eq!(export.depth, 0);
        let c = tokens.iter().find(|t| t.is_ident(src, "c")).unwrap();
        assert_eq!(c.depth, 2);
        let tail = tokens.iter().filter(|t| t.kind == TokenKind::Template).count();
        assert_eq!(tail, 2);
    }

    #[test]
    fn test_comments_and_newlines() {
        let src = "a // trailing\n/* block\n */ b /* inline */ c";
        let tokens = tokenize(src).unwrap();
        assert_eq!(tokens.len(), 3);
        assert!(tokens[1].newline_before);
        assert!(!tokens[2].newline_before);
    }

    #[test]
    fn test_closing_brace_depth_matches_opening() {
        let src = "function f() { return { a: [1] }; }";
        let tokens = tokenize(src).unwrap();
        let braces: Vec<u32> = tokens
            .iter()
            .filter(|t| t.is_punct(src, "{") || t.is_punct(src, "}"))
            .map(|t| t.depth)
            .collect();
        assert_eq!(braces, vec![0, 1, 1, 0]);
    }

    #[test]
    fn test_lexical_errors() {
        assert_eq!(tokenize("let s = 'open").unwrap_err().message, "Unterminated string literal");
        assert_eq!(tokenize("/* never closed").unwrap_err().message, "Unterminated comment");
        assert_eq!(tokenize("let t = `x ${y").unwrap_err().message, "Unterminated template literal");
        assert_eq!(tokenize("f(a]").unwrap_err().message, "Unexpected ']'");
        assert_eq!(tokenize("{ a").unwrap_err().message, "Unclosed '{'");
        assert_eq!(tokenize("x = /abc\n").unwrap_err().message, "Unterminated regular expression");
    }

    #[test]
    fn test_private_names_and_numbers() {
        let toks = kinds("class A { #x = 0x1F; y = .5e3; z = 10n }");
        assert!(toks.contains(&(TokenKind::PrivateName, "#x".into())));
        assert!(toks.contains(&(TokenKind::Number, "0x1F".into())));
        assert!(toks.contains(&(TokenKind::Number, ".5e3".into())));
        assert!(toks.contains(&(TokenKind::Number, "10n".into())));
    }

    #[test]
    fn test_string_value_unescapes() {
        assert_eq!(string_value(r#""react/jsx-runtime""#), "react/jsx-runtime");
        assert_eq!(string_value(r"'a\'b\x41B\u{43}'"), "a'bABC");
    }

    #[test]
    fn test_line_col() {
        let src = "line one\nline two";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 9), (2, 1));
        assert_eq!(line_col(src, 14), (2, 6));
    }
}

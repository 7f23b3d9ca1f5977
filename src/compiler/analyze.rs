//! Static import/export analysis of a single ES module.
//!
//! Works on the token stream: finds top-level `import`/`export`
//! declarations, dynamic `import(...)`, `import.meta` and define targets,
//! recording byte spans so the emitter can rewrite the module in place.

use super::lexer::{string_value, tokenize, LexError, Span, Token, TokenKind};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl From<LexError> for SyntaxError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            offset: err.offset,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportBindings {
    pub default: Option<String>,
    pub namespace: Option<String>,
    /// `(imported, local)` pairs.
    pub named: Vec<(String, String)>,
}

impl ImportBindings {
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.namespace.is_none() && self.named.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpecifier {
    pub local: String,
    pub exported: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `import … from "x"` / `import "x"`; the whole statement is removed.
    Import {
        span: Span,
        specifier: String,
        bindings: ImportBindings,
    },
    /// `export const|let|var|function|class …`; only the keyword is removed.
    ExportDecl { keyword: Span, names: Vec<String> },
    /// `export default function|class …`; `prefix` covers `export default`.
    /// Anonymous declarations get a name inserted at `name_insert`.
    ExportDefaultDecl {
        prefix: Span,
        name: Option<String>,
        name_insert: usize,
    },
    /// `export default <expr>`; `prefix` becomes a `var` binding.
    ExportDefaultExpr { prefix: Span },
    /// `export { a, b as c } [from "x"]`
    ExportNamed {
        span: Span,
        specifiers: Vec<ExportSpecifier>,
        from: Option<String>,
    },
    /// `export * [as ns] from "x"`
    ExportAll {
        span: Span,
        from: String,
        alias: Option<String>,
    },
}

impl Statement {
    /// Specifier this statement loads, if any.
    pub fn source(&self) -> Option<&str> {
        match self {
            Statement::Import { specifier, .. } => Some(specifier),
            Statement::ExportNamed { from, .. } => from.as_deref(),
            Statement::ExportAll { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicImport {
    /// Span of the `import` keyword.
    pub keyword: Span,
    /// The specifier when the argument is a plain string literal.
    pub specifier: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAnalysis {
    pub statements: Vec<Statement>,
    pub dynamic_imports: Vec<DynamicImport>,
    /// Spans of `import.meta`.
    pub meta: Vec<Span>,
    /// Define targets and their replacement text.
    pub defines: Vec<(Span, String)>,
}

impl ModuleAnalysis {
    /// Statically imported specifiers, first occurrence order.
    pub fn static_specifiers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .filter_map(Statement::source)
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// String-literal dynamic import specifiers, first occurrence order.
    pub fn dynamic_specifiers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.dynamic_imports
            .iter()
            .filter_map(|d| d.specifier.as_deref())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Whether the module uses any ES module syntax at all.
    pub fn is_esm(&self) -> bool {
        !self.statements.is_empty() || !self.meta.is_empty()
    }
}

/// A compile-time replacement such as `process.env.NODE_ENV` → `"production"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Define {
    path: Vec<String>,
    replacement: String,
}

impl Define {
    pub fn new(target: &str, replacement: impl Into<String>) -> Self {
        Self {
            path: target.split('.').map(str::to_string).collect(),
            replacement: replacement.into(),
        }
    }

    pub fn target(&self) -> String {
        self.path.join(".")
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// Analyze one module's source text.
pub fn analyze(src: &str, defines: &[Define]) -> Result<ModuleAnalysis, SyntaxError> {
    let tokens = tokenize(src)?;
    Analyzer {
        src,
        tokens: &tokens,
        defines,
    }
    .run()
}

struct Analyzer<'a> {
    src: &'a str,
    tokens: &'a [Token],
    defines: &'a [Define],
}

impl<'a> Analyzer<'a> {
    fn run(&self) -> Result<ModuleAnalysis, SyntaxError> {
        let mut out = ModuleAnalysis::default();
        let mut i = 0;

        while i < self.tokens.len() {
            let tok = self.tokens[i];
            if tok.kind != TokenKind::Ident || self.after_dot(i) {
                i += 1;
                continue;
            }

            match tok.text(self.src) {
                "import" if self.punct_at(i + 1, "(") && !self.is_method_definition(i + 1) => {
                    let specifier = match (self.tokens.get(i + 2), self.tokens.get(i + 3)) {
                        (Some(arg), Some(close))
                            if arg.kind == TokenKind::Str
                                && (close.is_punct(self.src, ")") || close.is_punct(self.src, ",")) =>
                        {
                            Some(string_value(arg.text(self.src)))
                        }
                        _ => None,
                    };
                    out.dynamic_imports.push(DynamicImport {
                        keyword: tok.span,
                        specifier,
                    });
                    i += 1;
                }
                "import" if self.punct_at(i + 1, ".") => {
                    if !self.ident_at(i + 2, "meta") {
                        return Err(self.error("Unexpected token after 'import.'", i + 1));
                    }
                    out.meta.push(Span::new(tok.span.start, self.tokens[i + 2].span.end));
                    i += 3;
                }
                "import" if tok.depth == 0 => {
                    let (statement, next) = self.parse_import(i)?;
                    out.statements.push(statement);
                    i = next;
                }
                "export" if tok.depth == 0 => {
                    let (statement, next) = self.parse_export(i)?;
                    out.statements.push(statement);
                    i = next;
                }
                _ => {
                    if let Some((span, replacement, next)) = self.match_define(i) {
                        out.defines.push((span, replacement));
                        i = next;
                    } else {
                        i += 1;
                    }
                }
            }
        }

        self.check_duplicate_exports(&out)?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn error(&self, message: impl Into<String>, index: usize) -> SyntaxError {
        let offset = self
            .tokens
            .get(index)
            .map_or(self.src.len(), |t| t.span.start);
        SyntaxError {
            message: message.into(),
            offset,
        }
    }

    fn after_dot(&self, i: usize) -> bool {
        i > 0 && self.tokens[i - 1].is_punct(self.src, ".")
    }

    fn punct_at(&self, i: usize, punct: &str) -> bool {
        self.tokens.get(i).is_some_and(|t| t.is_punct(self.src, punct))
    }

    fn ident_at(&self, i: usize, name: &str) -> bool {
        self.tokens.get(i).is_some_and(|t| t.is_ident(self.src, name))
    }

    /// `import() {}` inside a class or object literal.
    fn is_method_definition(&self, open: usize) -> bool {
        let depth = self.tokens[open].depth;
        let close = (open + 1..self.tokens.len())
            .find(|&k| self.tokens[k].depth == depth && self.tokens[k].is_punct(self.src, ")"));
        close.is_some_and(|k| self.punct_at(k + 1, "{"))
    }

    fn kind_at(&self, i: usize) -> Option<TokenKind> {
        self.tokens.get(i).map(|t| t.kind)
    }

    fn text_at(&self, i: usize) -> &'a str {
        self.tokens.get(i).map_or("", |t| t.text(self.src))
    }

    fn string_at(&self, i: usize) -> Option<String> {
        self.tokens
            .get(i)
            .filter(|t| t.kind == TokenKind::Str)
            .map(|t| string_value(t.text(self.src)))
    }

    /// An export/import name: identifier (keywords included) or string.
    fn module_name_at(&self, i: usize) -> Option<String> {
        match self.kind_at(i)? {
            TokenKind::Ident => Some(self.text_at(i).to_string()),
            TokenKind::Str => self.string_at(i),
            _ => None,
        }
    }

    fn span_between(&self, first: usize, last_exclusive: usize) -> Span {
        let start = self.tokens[first].span.start;
        let end = self.tokens[last_exclusive - 1].span.end;
        Span::new(start, end)
    }

    /// Skip `with { … }` / `assert { … }` import attributes.
    fn skip_attributes(&self, mut j: usize) -> usize {
        if (self.ident_at(j, "with") || self.ident_at(j, "assert")) && self.punct_at(j + 1, "{") {
            let depth = self.tokens[j + 1].depth;
            j += 2;
            while j < self.tokens.len() && !(self.tokens[j].is_punct(self.src, "}") && self.tokens[j].depth == depth) {
                j += 1;
            }
            j += 1;
        }
        j
    }

    fn skip_semicolon(&self, j: usize) -> usize {
        if self.punct_at(j, ";") {
            j + 1
        } else {
            j
        }
    }

    // ------------------------------------------------------------------
    // import
    // ------------------------------------------------------------------

    fn parse_import(&self, i: usize) -> Result<(Statement, usize), SyntaxError> {
        let malformed = |j: usize| self.error("Malformed import declaration", j);
        let mut j = i + 1;
        let mut bindings = ImportBindings::default();

        if self.kind_at(j) != Some(TokenKind::Str) {
            if self.kind_at(j) == Some(TokenKind::Ident) && !self.ident_at(j, "from") {
                bindings.default = Some(self.text_at(j).to_string());
                j += 1;
                if self.punct_at(j, ",") {
                    j += 1;
                } else if !self.ident_at(j, "from") {
                    return Err(malformed(j));
                }
            }

            if self.punct_at(j, "*") {
                if !self.ident_at(j + 1, "as") || self.kind_at(j + 2) != Some(TokenKind::Ident) {
                    return Err(malformed(j));
                }
                bindings.namespace = Some(self.text_at(j + 2).to_string());
                j += 3;
            } else if self.punct_at(j, "{") {
                let (named, next) = self.parse_import_specifiers(j)?;
                bindings.named = named;
                j = next;
            }

            if bindings.is_empty() || !self.ident_at(j, "from") {
                return Err(malformed(j));
            }
            j += 1;
        }

        let specifier = self.string_at(j).ok_or_else(|| malformed(j))?;
        j = self.skip_semicolon(self.skip_attributes(j + 1));

        Ok((
            Statement::Import {
                span: self.span_between(i, j),
                specifier,
                bindings,
            },
            j,
        ))
    }

    fn parse_import_specifiers(&self, open: usize) -> Result<(Vec<(String, String)>, usize), SyntaxError> {
        let mut named = Vec::new();
        let mut j = open + 1;
        loop {
            if self.punct_at(j, "}") {
                return Ok((named, j + 1));
            }
            let imported = self.module_name_at(j).ok_or_else(|| self.error("Malformed import specifier", j))?;
            j += 1;
            let local = if self.ident_at(j, "as") {
                if self.kind_at(j + 1) != Some(TokenKind::Ident) {
                    return Err(self.error("Malformed import specifier", j + 1));
                }
                j += 2;
                self.text_at(j - 1).to_string()
            } else if self.kind_at(j - 1) == Some(TokenKind::Ident) {
                imported.clone()
            } else {
                return Err(self.error("String import names need an 'as' binding", j - 1));
            };
            named.push((imported, local));

            if self.punct_at(j, ",") {
                j += 1;
            } else if !self.punct_at(j, "}") {
                return Err(self.error("Malformed import specifier list", j));
            }
        }
    }

    // ------------------------------------------------------------------
    // export
    // ------------------------------------------------------------------

    fn parse_export(&self, i: usize) -> Result<(Statement, usize), SyntaxError> {
        let keyword = self.tokens[i].span;
        let j = i + 1;

        match (self.kind_at(j), self.text_at(j)) {
            (Some(TokenKind::Ident), "default") => self.parse_export_default(i),
            (Some(TokenKind::Ident), "const" | "let" | "var") => {
                let end = self.statement_end(j + 1);
                let names = self.declarator_names(j + 1, end)?;
                Ok((Statement::ExportDecl { keyword, names }, j))
            }
            (Some(TokenKind::Ident), "function" | "async" | "class") => {
                let mut k = j;
                if self.ident_at(k, "async") {
                    k += 1;
                    if !self.ident_at(k, "function") {
                        return Err(self.error("Malformed export declaration", k));
                    }
                }
                k += 1;
                if self.punct_at(k, "*") {
                    k += 1;
                }
                if self.kind_at(k) != Some(TokenKind::Ident) {
                    return Err(self.error("Exported declarations need a name", k));
                }
                let names = vec![self.text_at(k).to_string()];
                Ok((Statement::ExportDecl { keyword, names }, j))
            }
            (Some(TokenKind::Punct), "{") => self.parse_export_named(i),
            (Some(TokenKind::Punct), "*") => self.parse_export_all(i),
            _ => Err(self.error("Malformed export declaration", j)),
        }
    }

    fn parse_export_default(&self, i: usize) -> Result<(Statement, usize), SyntaxError> {
        let prefix = self.span_between(i, i + 2);
        let mut k = i + 2;

        let is_async_fn = self.ident_at(k, "async")
            && self.ident_at(k + 1, "function")
            && !self.tokens[k + 1].newline_before;
        if is_async_fn {
            k += 1;
        }

        if self.ident_at(k, "function") || self.ident_at(k, "class") {
            let is_class = self.ident_at(k, "class");
            let mut after = k + 1;
            if !is_class && self.punct_at(after, "*") {
                after += 1;
            }
            let named = self.kind_at(after) == Some(TokenKind::Ident) && !self.ident_at(after, "extends");
            let name = named.then(|| self.text_at(after).to_string());
            let name_insert = self.tokens[after - 1].span.end;
            return Ok((
                Statement::ExportDefaultDecl {
                    prefix,
                    name,
                    name_insert,
                },
                i + 2,
            ));
        }

        if k >= self.tokens.len() {
            return Err(self.error("Expected expression after 'export default'", k));
        }
        Ok((Statement::ExportDefaultExpr { prefix }, i + 2))
    }

    fn parse_export_named(&self, i: usize) -> Result<(Statement, usize), SyntaxError> {
        let mut specifiers = Vec::new();
        let mut string_local = None;
        let mut j = i + 2;
        loop {
            if self.punct_at(j, "}") {
                j += 1;
                break;
            }
            if self.kind_at(j) == Some(TokenKind::Str) && string_local.is_none() {
                string_local = Some(j);
            }
            let local = self.module_name_at(j).ok_or_else(|| self.error("Malformed export specifier", j))?;
            j += 1;
            let exported = if self.ident_at(j, "as") {
                let name = self
                    .module_name_at(j + 1)
                    .ok_or_else(|| self.error("Malformed export specifier", j + 1))?;
                j += 2;
                name
            } else {
                local.clone()
            };
            specifiers.push(ExportSpecifier { local, exported });

            if self.punct_at(j, ",") {
                j += 1;
            } else if !self.punct_at(j, "}") {
                return Err(self.error("Malformed export specifier list", j));
            }
        }

        let from = if self.ident_at(j, "from") {
            let specifier = self
                .string_at(j + 1)
                .ok_or_else(|| self.error("Expected module specifier", j + 1))?;
            j = self.skip_attributes(j + 2);
            Some(specifier)
        } else {
            None
        };
        if let (None, Some(at)) = (&from, string_local) {
            return Err(self.error("String export names need a 'from' clause", at));
        }
        j = self.skip_semicolon(j);

        Ok((
            Statement::ExportNamed {
                span: self.span_between(i, j),
                specifiers,
                from,
            },
            j,
        ))
    }

    fn parse_export_all(&self, i: usize) -> Result<(Statement, usize), SyntaxError> {
        let mut j = i + 2;
        let alias = if self.ident_at(j, "as") {
            let name = self
                .module_name_at(j + 1)
                .ok_or_else(|| self.error("Malformed export declaration", j + 1))?;
            j += 2;
            Some(name)
        } else {
            None
        };
        if !self.ident_at(j, "from") {
            return Err(self.error("Expected 'from'", j));
        }
        let from = self
            .string_at(j + 1)
            .ok_or_else(|| self.error("Expected module specifier", j + 1))?;
        j = self.skip_semicolon(self.skip_attributes(j + 2));

        Ok((
            Statement::ExportAll {
                span: self.span_between(i, j),
                from,
                alias,
            },
            j,
        ))
    }

    // ------------------------------------------------------------------
    // Declarations and binding patterns
    // ------------------------------------------------------------------

    /// Index one past the last token of the statement starting at `start`,
    /// honouring `;` and automatic semicolon insertion at line breaks.
    fn statement_end(&self, start: usize) -> usize {
        let depth = self.tokens.get(start).map_or(0, |t| t.depth);
        let mut k = start;
        while k < self.tokens.len() {
            let tok = self.tokens[k];
            if tok.depth < depth {
                return k;
            }
            if tok.depth == depth {
                if tok.is_punct(self.src, ";") {
                    return k;
                }
                if k > start && tok.newline_before && self.can_end(&self.tokens[k - 1]) && self.starts_statement(&tok) {
                    return k;
                }
            }
            k += 1;
        }
        k
    }

    fn can_end(&self, tok: &Token) -> bool {
        match tok.kind {
            TokenKind::Ident => !matches!(
                tok.text(self.src),
                "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void" | "throw"
                    | "case" | "do" | "else" | "yield" | "await" | "extends"
            ),
            TokenKind::Number | TokenKind::Str | TokenKind::Template | TokenKind::Regex | TokenKind::PrivateName => true,
            TokenKind::TemplateHead => false,
            TokenKind::Punct => matches!(tok.text(self.src), ")" | "]" | "}" | "++" | "--"),
        }
    }

    fn starts_statement(&self, tok: &Token) -> bool {
        match tok.kind {
            TokenKind::Ident => !matches!(tok.text(self.src), "in" | "instanceof"),
            TokenKind::Number | TokenKind::Str | TokenKind::PrivateName => true,
            TokenKind::Template | TokenKind::TemplateHead | TokenKind::Regex => false,
            TokenKind::Punct => matches!(tok.text(self.src), "++" | "--" | "{" | "!" | "~" | "@"),
        }
    }

    fn declarator_names(&self, start: usize, end: usize) -> Result<Vec<String>, SyntaxError> {
        if start >= end {
            return Err(self.error("Expected variable declarator", start));
        }
        let depth = self.tokens[start].depth;
        let mut names = Vec::new();
        for (a, b) in self.split(start, end, depth, ",") {
            let pattern_end = (a..b)
                .find(|&k| self.tokens[k].depth == depth && self.tokens[k].is_punct(self.src, "="))
                .unwrap_or(b);
            self.binding_names(a, pattern_end, &mut names)?;
        }
        Ok(names)
    }

    /// Split `[start, end)` at `sep` tokens sitting at `depth`.
    fn split(&self, start: usize, end: usize, depth: u32, sep: &str) -> Vec<(usize, usize)> {
        let mut parts = Vec::new();
        let mut from = start;
        for k in start..end {
            let tok = &self.tokens[k];
            if tok.depth == depth && tok.is_punct(self.src, sep) {
                parts.push((from, k));
                from = k + 1;
            }
        }
        parts.push((from, end));
        parts
    }

    fn strip_default(&self, start: usize, end: usize, depth: u32) -> usize {
        (start..end)
            .find(|&k| self.tokens[k].depth == depth && self.tokens[k].is_punct(self.src, "="))
            .unwrap_or(end)
    }

    fn binding_names(&self, start: usize, end: usize, out: &mut Vec<String>) -> Result<(), SyntaxError> {
        if start >= end {
            return Err(self.error("Expected binding pattern", start));
        }
        let first = self.tokens[start];

        if first.kind == TokenKind::Ident && end - start == 1 {
            out.push(first.text(self.src).to_string());
            return Ok(());
        }

        let (close, is_object) = if first.is_punct(self.src, "{") {
            ("}", true)
        } else if first.is_punct(self.src, "[") {
            ("]", false)
        } else {
            return Err(self.error("Unsupported binding pattern", start));
        };
        if !self.tokens[end - 1].is_punct(self.src, close) || self.tokens[end - 1].depth != first.depth {
            return Err(self.error("Unsupported binding pattern", start));
        }

        let inner = first.depth + 1;
        for (a, b) in self.split(start + 1, end - 1, inner, ",") {
            if a == b {
                // Array hole or trailing comma.
                continue;
            }
            if self.tokens[a].is_punct(self.src, "...") {
                self.binding_names(a + 1, b, out)?;
                continue;
            }
            if is_object {
                let colon = (a..b).find(|&k| self.tokens[k].depth == inner && self.tokens[k].is_punct(self.src, ":"));
                match colon {
                    Some(c) => {
                        let value_end = self.strip_default(c + 1, b, inner);
                        self.binding_names(c + 1, value_end, out)?;
                    }
                    None => {
                        let key_end = self.strip_default(a, b, inner);
                        self.binding_names(a, key_end, out)?;
                    }
                }
            } else {
                let elem_end = self.strip_default(a, b, inner);
                self.binding_names(a, elem_end, out)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Defines and validation
    // ------------------------------------------------------------------

    fn match_define(&self, i: usize) -> Option<(Span, String, usize)> {
        self.defines.iter().find_map(|define| {
            let mut k = i;
            for (n, part) in define.path.iter().enumerate() {
                if n > 0 {
                    if !self.punct_at(k, ".") {
                        return None;
                    }
                    k += 1;
                }
                if !self.ident_at(k, part) {
                    return None;
                }
                k += 1;
            }
            // Leave assignment targets alone.
            if self.punct_at(k, "=") {
                return None;
            }
            Some((self.span_between(i, k), define.replacement.clone(), k))
        })
    }

    fn check_duplicate_exports(&self, analysis: &ModuleAnalysis) -> Result<(), SyntaxError> {
        let mut seen = HashSet::new();
        for statement in &analysis.statements {
            let (names, offset): (Vec<&str>, usize) = match statement {
                Statement::ExportDecl { keyword, names } => (names.iter().map(String::as_str).collect(), keyword.start),
                Statement::ExportDefaultDecl { prefix, .. } | Statement::ExportDefaultExpr { prefix } => {
                    (vec!["default"], prefix.start)
                }
                Statement::ExportNamed { span, specifiers, .. } => {
                    (specifiers.iter().map(|s| s.exported.as_str()).collect(), span.start)
                }
                Statement::ExportAll {
                    span, alias: Some(alias), ..
                } => (vec![alias.as_str()], span.start),
                _ => continue,
            };
            for name in names {
                if !seen.insert(name) {
                    return Err(SyntaxError {
                        message: format!("Duplicate export '{}'", name),
                        offset,
                    });
                }
            }
        }
        Ok(())
    }
}

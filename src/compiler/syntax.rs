//! Full syntax check of emitted modules.
//!
//! The tokenizer only sees as much grammar as import/export analysis needs.
//! Before a bundle is handed out, every module wrapper is compiled (never
//! run) by V8 in a throwaway isolate, so grammar errors surface at compile
//! time with a module-relative position.

use deno_core::{v8, JsRuntime, RuntimeOptions};

/// One module wrapper as it will appear in the bundle.
#[derive(Debug, Clone)]
pub struct CheckUnit {
    pub module: String,
    /// A `function (…) { … }` expression.
    pub code: String,
    /// Lines of wrapper and prologue before the module's own first line.
    pub header_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub module: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Compile every unit; the first failure wins.
pub fn check(units: &[CheckUnit]) -> Result<(), SyntaxIssue> {
    let mut runtime = JsRuntime::new(RuntimeOptions::default());
    let scope = &mut runtime.handle_scope();

    for unit in units {
        let issue = |line: usize, column: usize, message: String| SyntaxIssue {
            module: unit.module.clone(),
            line: line.saturating_sub(unit.header_lines).max(1),
            column,
            message,
        };

        let source = format!("({})", unit.code);
        let Some(code) = v8::String::new(scope, &source) else {
            return Err(issue(1, 1, "module is too large to compile".to_string()));
        };

        let tc = &mut v8::TryCatch::new(scope);
        if v8::Script::compile(tc, code, None).is_some() {
            continue;
        }

        let Some(message) = tc.message() else {
            return Err(issue(1, 1, "SyntaxError: invalid module".to_string()));
        };
        let line = message.get_line_number(tc).unwrap_or(1);
        let column = message.get_start_column() + 1;
        let text = message.get(tc).to_rust_string_lossy(tc);
        let text = text.strip_prefix("Uncaught ").unwrap_or(&text).to_string();
        return Err(issue(line, column, text));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(body: &str) -> CheckUnit {
        CheckUnit {
            module: "<component>".to_string(),
            code: format!("function (module, exports) {{\n\"use strict\";\n{}\n}}", body),
            header_lines: 2,
        }
    }

    #[test]
    fn test_valid_module_passes() {
        assert!(check(&[unit("const a = 1;\nfunction f() { return a + 1; }\nreturn f();")]).is_ok());
    }

    #[test]
    fn test_grammar_error_has_module_position() {
        let issue = check(&[unit("const ok = 1;"), unit("const a = 1;\nfunction f() { return 1 +; }")])
            .unwrap_err();
        assert_eq!(issue.module, "<component>");
        assert_eq!(issue.line, 2);
        assert!(issue.message.starts_with("SyntaxError"));
    }

    #[test]
    fn test_strict_mode_errors_are_reported() {
        let issue = check(&[unit("with (Math) { max(1, 2); }")]).unwrap_err();
        assert_eq!(issue.line, 1);
    }
}

//! Compiler/bundler adapter.
//!
//! Turns component source plus its resolvable dependency graph into one
//! self-contained script that the sandbox can evaluate without any module
//! loader. Externals stay as `require(name)` calls against the sandbox's
//! capability loader; everything else is fetched (or read from the request's
//! virtual files) and inlined.

pub mod analyze;
pub mod graph;
pub mod lexer;
pub mod syntax;

use crate::fetch::FetchError;
use crate::import_map::{ImportMap, ModuleId, ResolveError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub use analyze::Define;
pub use graph::GraphBundler;

/// Default cap on the number of modules in one graph.
pub const DEFAULT_MAX_MODULES: usize = 256;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{module}:{line}:{column}: {message}")]
    Syntax {
        module: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Local module not found: {path} (imported by {referrer})")]
    LocalNotFound { path: String, referrer: String },

    #[error("Circular re-export: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Module graph exceeds {0} modules")]
    GraphTooLarge(usize),

    #[error("Bundling timed out after {0}ms")]
    TimedOut(u64),

    #[error("Syntax check failed: {0}")]
    Checker(String),
}

/// Output of a successful compilation: one script with no module syntax.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    code: String,
    modules: Vec<ModuleId>,
}

impl CompiledModule {
    pub(crate) fn new(code: String, modules: Vec<ModuleId>) -> Self {
        Self { code, modules }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Modules inlined into the bundle, entry first.
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn into_code(self) -> String {
        self.code
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub defines: Vec<Define>,
    pub max_modules: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            defines: vec![Define::new("process.env.NODE_ENV", "\"production\"")],
            max_modules: DEFAULT_MAX_MODULES,
        }
    }
}

/// What one compilation works on.
#[derive(Debug, Clone, Copy)]
pub struct BundleInput<'a> {
    /// Entry module source text.
    pub source: &'a str,
    /// The merged (defaults + per-call) Import Map.
    pub import_map: &'a ImportMap,
    /// Virtual files addressable by relative specifiers.
    pub files: &'a BTreeMap<String, String>,
}

/// A bundler backend, chosen once when the renderer is built.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, input: BundleInput<'_>) -> Result<CompiledModule, CompileError>;
}

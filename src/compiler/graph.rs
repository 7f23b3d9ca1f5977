//! Module-graph bundler.
//!
//! Walks the import graph breadth-first from the entry source, fetching each
//! level's remote modules concurrently, rejects re-export chains that loop
//! back on themselves, then emits every module as a wrapper function in one
//! script. Import bindings stay live across static cycles.

use super::analyze::{analyze, ModuleAnalysis, Statement, SyntaxError};
use super::lexer::{line_col, Span};
use super::syntax::{self, CheckUnit};
use super::{BundleInput, Bundler, CompileError, CompileOptions, CompiledModule};
use crate::fetch::{FetchedModule, ModuleFetcher};
use crate::import_map::{join_path, ImportPolicy, ModuleId, Resolution};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use url::Url;

const PRELUDE: &str = include_str!("prelude.js");

/// Extensions tried, in order, when a local specifier has no exact match.
const LOCAL_PROBES: &[&str] = &["", ".js", ".mjs", ".jsx", "/index.js"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Module(usize),
    External(String),
}

#[derive(Debug)]
struct GraphModule {
    id: ModuleId,
    source: Arc<str>,
    analysis: ModuleAnalysis,
    targets: HashMap<String, Target>,
}

/// The default [`Bundler`]: resolves through an [`ImportPolicy`], fetches
/// through a [`ModuleFetcher`], emits a loader-free script.
pub struct GraphBundler {
    fetcher: Arc<dyn ModuleFetcher>,
    remote_origin: Url,
    options: CompileOptions,
}

impl GraphBundler {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>, remote_origin: Url, options: CompileOptions) -> Self {
        Self {
            fetcher,
            remote_origin,
            options,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }
}

#[async_trait]
impl Bundler for GraphBundler {
    async fn bundle(&self, input: BundleInput<'_>) -> Result<CompiledModule, CompileError> {
        let mut builder = GraphBuilder {
            policy: ImportPolicy::new(input.import_map.clone(), self.remote_origin.clone()),
            files: normalize_files(input.files)?,
            options: &self.options,
            fetcher: self.fetcher.as_ref(),
            modules: Vec::new(),
            index: HashMap::new(),
            requested: HashMap::new(),
        };
        builder.build(input.source).await?;

        if let Some(cycle) = find_reexport_cycle(&builder.modules) {
            return Err(CompileError::Cycle(cycle));
        }

        let wrappers: Vec<Wrapper> = builder.modules.iter().map(wrap_module).collect();
        let units: Vec<CheckUnit> = builder
            .modules
            .iter()
            .zip(&wrappers)
            .map(|(module, wrapper)| CheckUnit {
                module: module.id.to_string(),
                code: wrapper.code.clone(),
                header_lines: wrapper.header_lines,
            })
            .collect();
        tokio::task::spawn_blocking(move || syntax::check(&units))
            .await
            .map_err(|e| CompileError::Checker(e.to_string()))?
            .map_err(|issue| CompileError::Syntax {
                module: issue.module,
                line: issue.line,
                column: issue.column,
                message: issue.message,
            })?;

        let code = emit(&builder.modules, &wrappers);
        debug!(modules = builder.modules.len(), bytes = code.len(), "bundled module graph");
        Ok(CompiledModule::new(
            code,
            builder.modules.into_iter().map(|m| m.id).collect(),
        ))
    }
}

fn normalize_files(files: &BTreeMap<String, String>) -> Result<BTreeMap<String, Arc<str>>, CompileError> {
    files
        .iter()
        .map(|(path, source)| Ok((join_path("/", path)?, Arc::from(source.as_str()))))
        .collect()
}

struct GraphBuilder<'a> {
    policy: ImportPolicy,
    files: BTreeMap<String, Arc<str>>,
    options: &'a CompileOptions,
    fetcher: &'a dyn ModuleFetcher,
    modules: Vec<GraphModule>,
    index: HashMap<ModuleId, usize>,
    /// Requested and final URLs of fetched modules.
    requested: HashMap<Url, usize>,
}

struct PendingFetch {
    from: usize,
    specifier: String,
    url: Url,
    integrity: Option<String>,
}

impl<'a> GraphBuilder<'a> {
    async fn build(&mut self, entry: &str) -> Result<(), CompileError> {
        let root = self.add_module(ModuleId::Entry, Arc::from(entry))?;
        let mut frontier = vec![root];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            let mut pending = Vec::new();

            for &from in &frontier {
                self.resolve_imports(from, &mut next, &mut pending)?;
            }

            let mut unique: Vec<(&Url, Option<&str>)> = Vec::new();
            for fetch in &pending {
                if !unique.iter().any(|(url, _)| *url == &fetch.url) {
                    unique.push((&fetch.url, fetch.integrity.as_deref()));
                }
            }
            let fetcher = self.fetcher;
            let fetched = try_join_all(
                unique
                    .iter()
                    .map(|(url, integrity)| fetch_module(fetcher, url, *integrity)),
            )
            .await?;
            let requested: Vec<Url> = unique.into_iter().map(|(url, _)| url.clone()).collect();

            for (url, module) in requested.into_iter().zip(fetched) {
                let id = ModuleId::Remote(module.url.clone());
                let index = match self.index.get(&id) {
                    Some(&index) => index,
                    None => {
                        let index = self.add_module(id, module.source)?;
                        next.push(index);
                        index
                    }
                };
                self.requested.insert(module.url, index);
                self.requested.insert(url, index);
            }

            for fetch in pending {
                if let Some(&index) = self.requested.get(&fetch.url) {
                    self.modules[fetch.from].targets.insert(fetch.specifier, Target::Module(index));
                }
            }

            frontier = next;
        }
        Ok(())
    }

    fn resolve_imports(
        &mut self,
        from: usize,
        next: &mut Vec<usize>,
        pending: &mut Vec<PendingFetch>,
    ) -> Result<(), CompileError> {
        let referrer = self.modules[from].id.clone();
        let specifiers: Vec<String> = {
            let analysis = &self.modules[from].analysis;
            analysis
                .static_specifiers()
                .into_iter()
                .chain(analysis.dynamic_specifiers())
                .map(str::to_string)
                .collect()
        };

        for specifier in specifiers {
            if self.modules[from].targets.contains_key(&specifier) {
                continue;
            }
            let target = match self.policy.resolve(&specifier, &referrer)? {
                Resolution::External(name) => Target::External(name),
                Resolution::Local(path) => {
                    let (path, source) = self.find_local(&path).ok_or_else(|| CompileError::LocalNotFound {
                        path: path.clone(),
                        referrer: referrer.to_string(),
                    })?;
                    let id = ModuleId::Local(path);
                    match self.index.get(&id) {
                        Some(&index) => Target::Module(index),
                        None => {
                            let index = self.add_module(id, source)?;
                            next.push(index);
                            Target::Module(index)
                        }
                    }
                }
                Resolution::Remote { url, integrity } => match self.requested.get(&url) {
                    Some(&index) => Target::Module(index),
                    None => {
                        pending.push(PendingFetch {
                            from,
                            specifier,
                            url,
                            integrity,
                        });
                        continue;
                    }
                },
            };
            self.modules[from].targets.insert(specifier, target);
        }
        Ok(())
    }

    fn find_local(&self, path: &str) -> Option<(String, Arc<str>)> {
        let base = if path == "/" { "/index" } else { path };
        LOCAL_PROBES.iter().find_map(|suffix| {
            let candidate = format!("{}{}", base, suffix);
            self.files.get(&candidate).map(|source| (candidate, source.clone()))
        })
    }

    fn add_module(&mut self, id: ModuleId, source: Arc<str>) -> Result<usize, CompileError> {
        if self.modules.len() >= self.options.max_modules {
            return Err(CompileError::GraphTooLarge(self.options.max_modules));
        }
        let analysis = analyze(&source, &self.options.defines).map_err(|err| syntax_error(&id, &source, err))?;
        let index = self.modules.len();
        self.index.insert(id.clone(), index);
        self.modules.push(GraphModule {
            id,
            source,
            analysis,
            targets: HashMap::new(),
        });
        Ok(index)
    }
}

async fn fetch_module(
    fetcher: &dyn ModuleFetcher,
    url: &Url,
    integrity: Option<&str>,
) -> Result<FetchedModule, CompileError> {
    debug!(url = %url, "fetching module");
    let wrap = |source| CompileError::Fetch {
        url: url.to_string(),
        source,
    };
    let module = fetcher.fetch(url).await.map_err(wrap)?;
    if let Some(expected) = integrity {
        module.verify(expected).map_err(wrap)?;
    }
    Ok(module)
}

fn syntax_error(id: &ModuleId, source: &str, err: SyntaxError) -> CompileError {
    let (line, column) = line_col(source, err.offset);
    CompileError::Syntax {
        module: id.to_string(),
        line,
        column,
        message: err.message,
    }
}

/// Where one exported name of one module comes from.
enum Origin {
    /// Declared here, external, CommonJS or not found: nothing to follow.
    Settled,
    /// Forwarded from `(module, name)`.
    Forwarded(usize, String),
}

fn export_origin(modules: &[GraphModule], index: usize, name: &str) -> Origin {
    let module = &modules[index];
    let follow = |specifier: &str, imported: &str| match module.targets.get(specifier) {
        Some(Target::Module(next)) if modules[*next].analysis.is_esm() => Origin::Forwarded(*next, imported.to_string()),
        _ => Origin::Settled,
    };

    for statement in &module.analysis.statements {
        let Statement::ExportNamed { specifiers, from, .. } = statement else {
            continue;
        };
        let Some(spec) = specifiers.iter().find(|spec| spec.exported == name) else {
            continue;
        };
        if let Some(source) = from {
            return follow(source, &spec.local);
        }
        // `export { x }` of an imported binding forwards that import.
        for statement in &module.analysis.statements {
            if let Statement::Import {
                specifier, bindings, ..
            } = statement
            {
                if bindings.default.as_deref() == Some(spec.local.as_str()) {
                    return follow(specifier, "default");
                }
                if let Some((imported, _)) = bindings.named.iter().find(|(_, local)| *local == spec.local) {
                    return follow(specifier, imported);
                }
            }
        }
        return Origin::Settled;
    }
    Origin::Settled
}

/// A re-export chain that never reaches a declaration, e.g. `a` exporting
/// `x` from `b` while `b` exports `x` from `a`. Such a binding can never be
/// initialised. Plain import cycles are fine.
fn find_reexport_cycle(modules: &[GraphModule]) -> Option<Vec<String>> {
    for (index, module) in modules.iter().enumerate() {
        for statement in &module.analysis.statements {
            let Statement::ExportNamed { specifiers, .. } = statement else {
                continue;
            };
            for spec in specifiers {
                let mut seen: HashSet<(usize, String)> = HashSet::new();
                let mut path = vec![module.id.to_string()];
                let mut current = (index, spec.exported.clone());
                seen.insert(current.clone());

                while let Origin::Forwarded(next, name) = export_origin(modules, current.0, &current.1) {
                    path.push(modules[next].id.to_string());
                    if (next, name.as_str()) == (index, spec.exported.as_str()) {
                        return Some(path);
                    }
                    if !seen.insert((next, name.clone())) {
                        // Loops further down; reported from its own start.
                        break;
                    }
                    current = (next, name);
                }
            }
        }
    }
    None
}

// ----------------------------------------------------------------------
// Emission
// ----------------------------------------------------------------------

fn quote(text: &str) -> String {
    serde_json::Value::from(text).to_string()
}

fn emit(modules: &[GraphModule], wrappers: &[Wrapper]) -> String {
    let capacity = wrappers.iter().map(|w| w.code.len() + 2).sum::<usize>() + PRELUDE.len() + 64 * modules.len();
    let mut out = String::with_capacity(capacity);

    out.push_str("var __bundle$modules = [\n");
    for wrapper in wrappers {
        out.push_str(&wrapper.code);
        out.push_str(",\n");
    }
    out.push_str("];\n");

    out.push_str("var __bundle$dynamic = [\n");
    for module in modules {
        out.push_str(&dynamic_table(module));
        out.push_str(",\n");
    }
    out.push_str("];\n");

    out.push_str(PRELUDE);
    out.push_str("\nmodule.exports = __bundle$load(0);\n");
    out
}

/// A module's wrapper function expression.
struct Wrapper {
    code: String,
    /// Lines before the module's own first line.
    header_lines: usize,
}

fn wrap_module(module: &GraphModule) -> Wrapper {
    let mut code = if module.analysis.is_esm() {
        let mut header = String::from("function (__bundle$module, __bundle$exports, __bundle$import) {\n\"use strict\";\n");
        header.push_str(&prologue(module));
        header
    } else {
        String::from("function (module, exports, __bundle$import) {\n")
    };
    let header_lines = code.matches('\n').count();
    code.push_str(&rewrite_body(module));
    code.push_str("\n}");
    Wrapper { code, header_lines }
}

/// Every specifier this module can reach at run time, for `import()`.
fn dynamic_table(module: &GraphModule) -> String {
    let table: serde_json::Map<String, serde_json::Value> = module
        .targets
        .iter()
        .map(|(specifier, target)| {
            let value = match target {
                Target::Module(index) => serde_json::Value::from(*index),
                Target::External(name) => serde_json::Value::from(name.as_str()),
            };
            (specifier.clone(), value)
        })
        .collect();
    serde_json::Value::Object(table).to_string()
}

fn prologue(module: &GraphModule) -> String {
    let analysis = &module.analysis;
    let specifiers = analysis.static_specifiers();
    let dep = |specifier: &str| {
        let ordinal = specifiers.iter().position(|s| *s == specifier).unwrap_or(0);
        format!("__bundle$dep{}", ordinal)
    };

    let mut getters: Vec<(String, String)> = Vec::new();
    for statement in &analysis.statements {
        match statement {
            Statement::ExportDecl { names, .. } => {
                getters.extend(names.iter().map(|n| (n.clone(), n.clone())));
            }
            Statement::ExportDefaultDecl { name, .. } => {
                let local = name.clone().unwrap_or_else(|| "__bundle$default".to_string());
                getters.push(("default".to_string(), local));
            }
            Statement::ExportDefaultExpr { .. } => {
                getters.push(("default".to_string(), "__bundle$default".to_string()));
            }
            Statement::ExportNamed { specifiers, from, .. } => {
                for spec in specifiers {
                    let expr = match from {
                        Some(source) => format!("{}[{}]", dep(source), quote(&spec.local)),
                        None => spec.local.clone(),
                    };
                    getters.push((spec.exported.clone(), expr));
                }
            }
            Statement::ExportAll {
                from, alias: Some(alias), ..
            } => getters.push((alias.clone(), dep(from))),
            _ => {}
        }
    }

    let mut out = String::from("__bundle$export(__bundle$exports, {\n");
    for (name, expr) in &getters {
        out.push_str(&format!("  {}: () => {},\n", quote(name), expr));
    }
    out.push_str("});\n");

    for (ordinal, specifier) in specifiers.iter().enumerate() {
        let load = match module.targets.get(*specifier) {
            Some(Target::Module(index)) => format!("__bundle$load({})", index),
            Some(Target::External(name)) => format!("__bundle$require({})", quote(name)),
            None => continue,
        };
        out.push_str(&format!("const __bundle$dep{} = __bundle$interop({});\n", ordinal, load));
    }

    for statement in &analysis.statements {
        match statement {
            Statement::Import {
                specifier, bindings, ..
            } => {
                let source = dep(specifier);
                if let Some(local) = &bindings.namespace {
                    out.push_str(&format!("const {} = {};\n", local, source));
                }

                let mut fields: Vec<(&str, &str)> = Vec::new();
                if let Some(local) = &bindings.default {
                    fields.push(("default", local.as_str()));
                }
                fields.extend(bindings.named.iter().map(|(imported, local)| (imported.as_str(), local.as_str())));
                if fields.is_empty() {
                    continue;
                }

                match module.targets.get(specifier.as_str()) {
                    // Inlined modules may still be evaluating (a cycle), so
                    // bindings are refreshed once the dependency finishes.
                    Some(Target::Module(index)) => {
                        let locals: Vec<&str> = fields.iter().map(|(_, local)| *local).collect();
                        let assigns: Vec<String> = fields
                            .iter()
                            .map(|(imported, local)| format!("{} = __bundle$ns[{}];", local, quote(imported)))
                            .collect();
                        out.push_str(&format!("let {};\n", locals.join(", ")));
                        out.push_str(&format!(
                            "__bundle$bind({}, function (__bundle$ns) {{ {} }});\n",
                            index,
                            assigns.join(" ")
                        ));
                    }
                    _ => {
                        let pairs: Vec<String> = fields
                            .iter()
                            .map(|(imported, local)| format!("{}: {}", quote(imported), local))
                            .collect();
                        out.push_str(&format!("const {{ {} }} = {};\n", pairs.join(", "), source));
                    }
                }
            }
            Statement::ExportAll { from, alias: None, .. } => {
                out.push_str(&format!("__bundle$reexport(__bundle$exports, {});\n", dep(from)));
            }
            _ => {}
        }
    }
    out
}

/// Module source with all module syntax rewritten. Line breaks inside
/// removed spans are kept so line numbers survive.
fn rewrite_body(module: &GraphModule) -> String {
    let source = &*module.source;
    let analysis = &module.analysis;
    let mut edits: Vec<(Span, String)> = Vec::new();

    if source.starts_with("#!") {
        let end = source.find('\n').unwrap_or(source.len());
        edits.push((Span::new(0, end), String::new()));
    }

    for statement in &analysis.statements {
        match statement {
            Statement::Import { span, .. } | Statement::ExportNamed { span, .. } | Statement::ExportAll { span, .. } => {
                edits.push((*span, String::new()));
            }
            Statement::ExportDecl { keyword, .. } => edits.push((*keyword, String::new())),
            Statement::ExportDefaultDecl {
                prefix,
                name,
                name_insert,
            } => {
                edits.push((*prefix, String::new()));
                if name.is_none() {
                    edits.push((Span::new(*name_insert, *name_insert), " __bundle$default".to_string()));
                }
            }
            Statement::ExportDefaultExpr { prefix } => {
                edits.push((*prefix, "var __bundle$default =".to_string()));
            }
        }
    }

    for dynamic in &analysis.dynamic_imports {
        edits.push((dynamic.keyword, "__bundle$import".to_string()));
    }
    let meta = format!("({{ url: {} }})", quote(&module.id.to_string()));
    for span in &analysis.meta {
        edits.push((*span, meta.clone()));
    }
    edits.extend(analysis.defines.iter().cloned());
    edits.sort_by_key(|(span, _)| (span.start, span.end));

    let mut out = String::with_capacity(source.len() + 64);
    let mut cursor = 0;
    for (span, replacement) in edits {
        if span.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..span.start]);
        out.push_str(&replacement);
        out.extend(source[span.start..span.end].matches('\n'));
        cursor = span.end;
    }
    out.push_str(&source[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::import_map::{ImportConfig, ImportMap, DEFAULT_REMOTE_ORIGIN};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed sources; `redirects` maps a requested URL to the final one.
    #[derive(Default)]
    struct StaticFetcher {
        modules: HashMap<String, String>,
        redirects: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn with(mut self, url: &str, source: &str) -> Self {
            self.modules.insert(url.to_string(), source.to_string());
            self
        }

        fn redirect(mut self, from: &str, to: &str) -> Self {
            self.redirects.insert(from.to_string(), to.to_string());
            self
        }
    }

    #[async_trait]
    impl ModuleFetcher for StaticFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedModule, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let final_url = self.redirects.get(url.as_str()).cloned().unwrap_or_else(|| url.to_string());
            match self.modules.get(&final_url) {
                Some(source) => Ok(FetchedModule::new(Url::parse(&final_url).unwrap(), source.as_str())),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn bundler(fetcher: StaticFetcher) -> (GraphBundler, Arc<StaticFetcher>) {
        let fetcher = Arc::new(fetcher);
        let bundler = GraphBundler::new(
            fetcher.clone(),
            Url::parse(DEFAULT_REMOTE_ORIGIN).unwrap(),
            CompileOptions::default(),
        );
        (bundler, fetcher)
    }

    async fn bundle(
        bundler: &GraphBundler,
        source: &str,
        map: &ImportMap,
        files: &BTreeMap<String, String>,
    ) -> Result<CompiledModule, CompileError> {
        bundler
            .bundle(BundleInput {
                source,
                import_map: map,
                files,
            })
            .await
    }

    #[tokio::test]
    async fn test_externals_stay_as_require() {
        let (bundler, fetcher) = bundler(StaticFetcher::default());
        let src = r#"import { jsx } from "react/jsx-runtime";
export default function App() { return jsx("p", { children: "hi" }); }"#;
        let compiled = bundle(&bundler, src, &ImportMap::with_runtime_defaults(), &BTreeMap::new())
            .await
            .unwrap();

        let code = compiled.code();
        assert!(code.contains(r#"__bundle$require("react/jsx-runtime")"#));
        assert!(code.contains(r#""default": () => App"#));
        assert!(code.contains("module.exports = __bundle$load(0);"));
        assert!(!code.contains("import {"));
        assert!(!code.contains("export default"));
        assert_eq!(compiled.modules(), &[ModuleId::Entry]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_graph_is_inlined_and_deduplicated() {
        let fetcher = StaticFetcher::default()
            .with("https://esm.sh/v1/greet.mjs", "export const greet = (n) => `hi ${n}`;")
            .with("https://esm.sh/v1/lib.mjs", "export { greet } from './greet.mjs';\nexport * from '/v1/greet.mjs';")
            .redirect("https://esm.sh/lib", "https://esm.sh/v1/lib.mjs");
        let (bundler, fetcher) = bundler(fetcher);

        let mut map = ImportMap::with_runtime_defaults();
        map.insert("lib", ImportConfig::new("https://esm.sh/lib"));
        let src = "import { greet } from 'lib';\nimport again from '/lib';\nexport default () => greet('x');";

        let compiled = bundle(&bundler, src, &map, &BTreeMap::new()).await.unwrap();
        assert_eq!(compiled.modules().len(), 3);
        assert!(compiled
            .modules()
            .contains(&ModuleId::Remote(Url::parse("https://esm.sh/v1/greet.mjs").unwrap())));
        // `lib` and `/lib` share one fetch; greet.mjs is fetched once.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(compiled.code().contains("var __bundle$default ="));
    }

    #[tokio::test]
    async fn test_local_files_resolve_with_probing() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let mut files = BTreeMap::new();
        files.insert("lib/format.js".to_string(), "export const upper = (s) => s.toUpperCase();".to_string());
        files.insert("./lib/index.js".to_string(), "export * from './format';".to_string());

        let src = "import { upper } from './lib';\nexport default (p) => upper(p.name);";
        let compiled = bundle(&bundler, src, &ImportMap::new(), &files).await.unwrap();
        assert_eq!(
            compiled.modules(),
            &[
                ModuleId::Entry,
                ModuleId::Local("/lib/index.js".to_string()),
                ModuleId::Local("/lib/format.js".to_string()),
            ]
        );
        assert!(compiled.code().contains("__bundle$reexport(__bundle$exports, __bundle$dep0);"));
    }

    #[tokio::test]
    async fn test_bare_specifier_is_unresolved() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let err = bundle(&bundler, "import x from 'lodash';", &ImportMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Resolve(_)));
        assert!(err.to_string().contains("lodash"));
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let err = bundle(&bundler, "import './nope.js';", &ImportMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::LocalNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_compile_error() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let err = bundle(
            &bundler,
            "import x from 'https://esm.sh/missing';",
            &ImportMap::new(),
            &BTreeMap::new(),
        )
        .await
        .unwrap_err();
        match err {
            CompileError::Fetch { url, source } => {
                assert_eq!(url, "https://esm.sh/missing");
                assert!(matches!(source, FetchError::HttpStatus { status: 404, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_integrity_mismatch() {
        let fetcher = StaticFetcher::default().with("https://esm.sh/pinned", "export default 1;");
        let (bundler, _) = bundler(fetcher);
        let mut map = ImportMap::new();
        map.insert(
            "pinned",
            ImportConfig {
                integrity: Some("sha256-AAAA".to_string()),
                ..ImportConfig::new("https://esm.sh/pinned")
            },
        );
        let err = bundle(&bundler, "import p from 'pinned';", &map, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::Fetch {
                source: FetchError::IntegrityMismatch { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_static_cycle_bundles_with_live_bindings() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let mut files = BTreeMap::new();
        files.insert("/a.js".to_string(), "import { b } from './b.js'; export const a = () => 'a' + b();".to_string());
        files.insert("/b.js".to_string(), "import { a } from './a.js'; export const b = () => 'b';".to_string());

        let compiled = bundle(&bundler, "import { a } from './a.js';", &ImportMap::new(), &files)
            .await
            .unwrap();
        assert_eq!(compiled.modules().len(), 3);
        assert!(compiled.code().contains("let a;\n__bundle$bind(1, function (__bundle$ns) { a = __bundle$ns[\"a\"]; });"));
    }

    #[tokio::test]
    async fn test_reexport_cycle_is_rejected() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let mut files = BTreeMap::new();
        files.insert("/a.js".to_string(), "export { x } from './b.js';".to_string());
        files.insert("/b.js".to_string(), "import { x } from './a.js'; export { x };".to_string());

        let err = bundle(&bundler, "import { x } from './a.js';", &ImportMap::new(), &files)
            .await
            .unwrap_err();
        match err {
            CompileError::Cycle(path) => assert_eq!(path, vec!["/a.js", "/b.js", "/a.js"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_grammar_error_is_syntax_error() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let mut files = BTreeMap::new();
        files.insert("/util.js".to_string(), "export const ok = 1;\nexport function f() { return 1 +; }".to_string());

        let err = bundle(&bundler, "import { f } from './util.js';\nexport default f;", &ImportMap::new(), &files)
            .await
            .unwrap_err();
        match err {
            CompileError::Syntax {
                module, line, message, ..
            } => {
                assert_eq!(module, "/util.js");
                assert_eq!(line, 2);
                assert!(message.contains("SyntaxError"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_regex_after_block_bundles() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let src = "function f() {}\n/`/.test('a');\nexport default () => 'ok';";
        assert!(bundle(&bundler, src, &ImportMap::new(), &BTreeMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dynamic_cycle_is_allowed() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let mut files = BTreeMap::new();
        files.insert("/a.js".to_string(), "export const load = () => import('./a.js');".to_string());
        let compiled = bundle(&bundler, "import './a.js';", &ImportMap::new(), &files)
            .await
            .unwrap();
        assert!(compiled.code().contains(r#"{"./a.js":1}"#));
    }

    #[tokio::test]
    async fn test_graph_size_cap() {
        let fetcher = Arc::new(StaticFetcher::default());
        let bundler = GraphBundler::new(
            fetcher,
            Url::parse(DEFAULT_REMOTE_ORIGIN).unwrap(),
            CompileOptions {
                max_modules: 1,
                ..Default::default()
            },
        );
        let mut files = BTreeMap::new();
        files.insert("/a.js".to_string(), "export const a = 1;".to_string());
        let err = bundle(&bundler, "import './a.js';", &ImportMap::new(), &files)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::GraphTooLarge(1)));
    }

    #[tokio::test]
    async fn test_syntax_error_location() {
        let (bundler, _) = bundler(StaticFetcher::default());
        let err = bundle(&bundler, "const a = 1;\nconst b = 'open;", &ImportMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            CompileError::Syntax {
                module, line, column, ..
            } => {
                assert_eq!(module, "<component>");
                assert_eq!(line, 2);
                assert_eq!(column, 11);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rewrite_preserves_line_count() {
        let source = "import {\n  a\n} from './a.js';\nexport default function () {}\nconsole.log(import.meta.url, process.env.NODE_ENV);";
        let module = GraphModule {
            id: ModuleId::Entry,
            source: Arc::from(source),
            analysis: analyze(source, &CompileOptions::default().defines).unwrap(),
            targets: HashMap::new(),
        };
        let body = rewrite_body(&module);
        assert_eq!(body.lines().count(), source.lines().count());
        assert!(body.contains("function __bundle$default ()"));
        assert!(body.contains(r#"({ url: "<component>" }).url"#));
        assert!(body.contains(r#""production""#));
    }
}

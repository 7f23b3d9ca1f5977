//! Sandboxed execution engine.
//!
//! Every render gets a brand-new V8 isolate. The isolate exposes:
//! - console.log/warn/error (captured, not printed)
//! - a `require` that resolves only `react`, `react/jsx-runtime` and
//!   `react/jsx-dev-runtime`, passed to the compiled module as a parameter
//! - nothing else: no `Deno`, no fetch, no timers, no file system, no env
//!
//! The harness capability object (`evaluate`, `element`, `resolve`) is
//! reachable only from Rust through a [`v8::Global`].

pub mod ops;

use crate::compiler::CompiledModule;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use ops::ConsoleOutput;

const HARNESS: &str = include_str!("harness.js");

/// Removes the last path from scripts back to the host ops.
const SEAL: &str = r#"for (const name of ["Deno", "__bootstrap"]) {
  if (!Reflect.deleteProperty(globalThis, name)) {
    Object.defineProperty(globalThis, name, { value: undefined });
  }
}
"#;

/// Default V8 heap cap per isolate.
pub const DEFAULT_MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(DEFAULT_MAX_HEAP_SIZE),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{message}")]
    Threw { message: String },

    #[error("Module \"{name}\" is not available in the sandbox")]
    MissingCapability { name: String },

    #[error("no valid component found in module exports (default export is {found})")]
    NoComponent { found: String },

    #[error("Execution timed out")]
    TimedOut,

    #[error("Execution exceeded the heap limit")]
    HeapLimit,

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Failed to initialise sandbox: {0}")]
    Setup(String),
}

/// Why an isolate was forcibly stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Timeout,
    HeapLimit,
    Cancelled,
}

/// Thread-safe handle that stops a running isolate and remembers why.
#[derive(Clone)]
pub struct Terminator {
    handle: v8::IsolateHandle,
    reason: Arc<Mutex<Option<Termination>>>,
}

impl Terminator {
    fn new(handle: v8::IsolateHandle) -> Self {
        Self {
            handle,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Stop execution. The first reason recorded wins.
    pub fn terminate(&self, reason: Termination) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.handle.terminate_execution();
    }

    pub fn reason(&self) -> Option<Termination> {
        *self.reason.lock()
    }
}

/// A callable default export, alive only as long as its [`Sandbox`].
pub struct Component {
    function: v8::Global<v8::Function>,
}

/// An element built by the jsx factory, not yet resolved.
pub struct Element {
    value: v8::Global<v8::Value>,
}

/// A failed call into the harness, before it is attributed to a stage.
#[derive(Debug)]
pub(crate) enum Fault {
    Threw {
        message: String,
        missing_capability: Option<String>,
    },
    Terminated(Option<Termination>),
    Harness(String),
}

enum Arg<'a> {
    Str(&'a str),
    Value(&'a v8::Global<v8::Value>),
    Function(&'a v8::Global<v8::Function>),
}

/// One isolate, one render. Never reused.
pub struct Sandbox {
    runtime: JsRuntime,
    harness: v8::Global<v8::Object>,
    terminator: Terminator,
}

impl Sandbox {
    /// Create a sealed isolate with the harness installed.
    pub fn new(config: &SandboxConfig) -> Result<Self, ExecutionError> {
        let create_params = config
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ops::component_sandbox::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let terminator = Terminator::new(runtime.v8_isolate().thread_safe_handle());

        if config.max_heap_size.is_some() {
            let on_limit = terminator.clone();
            runtime.add_near_heap_limit_callback(move |current, initial| {
                warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "near heap limit, terminating component"
                );
                on_limit.terminate(Termination::HeapLimit);
                // Headroom so termination can unwind instead of aborting the process.
                current * 2
            });
        }

        runtime.op_state().borrow_mut().put(ConsoleOutput::default());

        runtime
            .execute_script("<seal>", SEAL.to_string())
            .map_err(|e| ExecutionError::Setup(e.to_string()))?;
        let installed = runtime
            .execute_script("<harness>", HARNESS.to_string())
            .map_err(|e| ExecutionError::Setup(e.to_string()))?;

        let harness = {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, &installed);
            let object = v8::Local::<v8::Object>::try_from(local)
                .map_err(|_| ExecutionError::Setup("harness did not produce an object".to_string()))?;
            v8::Global::new(scope, object)
        };

        Ok(Self {
            runtime,
            harness,
            terminator,
        })
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// Evaluate the compiled module and return its callable default export.
    pub fn execute(&mut self, module: &CompiledModule) -> Result<Component, ExecutionError> {
        let exported = self
            .call("evaluate", &[Arg::Str(module.code())])
            .map_err(execution_error)?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &exported);
        if let Ok(function) = v8::Local::<v8::Function>::try_from(local) {
            return Ok(Component {
                function: v8::Global::new(scope, function),
            });
        }

        let found = if local.is_undefined() {
            "missing".to_string()
        } else if local.is_null() {
            "null".to_string()
        } else {
            format!("a value of type {}", local.type_of(scope).to_rust_string_lossy(scope))
        };
        Err(ExecutionError::NoComponent { found })
    }

    /// Apply the jsx factory to `(component, props)`.
    pub(crate) fn create_element(&mut self, component: &Component, props_json: &str) -> Result<Element, Fault> {
        let value = self.call(
            "element",
            &[Arg::Function(&component.function), Arg::Str(props_json)],
        )?;
        Ok(Element { value })
    }

    /// Render the element tree to host nodes, as JSON text.
    pub(crate) fn resolve(&mut self, element: &Element) -> Result<String, Fault> {
        let value = self.call("resolve", &[Arg::Value(&element.value)])?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value);
        if !local.is_string() {
            return Err(Fault::Harness("resolve did not return a string".to_string()));
        }
        Ok(local.to_rust_string_lossy(scope))
    }

    /// Console output captured so far.
    pub fn console(&mut self) -> ConsoleOutput {
        self.runtime
            .op_state()
            .borrow()
            .try_borrow::<ConsoleOutput>()
            .cloned()
            .unwrap_or_default()
    }

    fn call(&mut self, name: &str, args: &[Arg<'_>]) -> Result<v8::Global<v8::Value>, Fault> {
        let terminator = self.terminator.clone();
        let scope = &mut self.runtime.handle_scope();
        let harness = v8::Local::new(scope, &self.harness);

        let function = v8::String::new(scope, name)
            .and_then(|key| harness.get(scope, key.into()))
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| Fault::Harness(format!("harness has no '{}' capability", name)))?;

        let mut locals: Vec<v8::Local<v8::Value>> = Vec::with_capacity(args.len());
        for arg in args {
            let local: v8::Local<v8::Value> = match arg {
                Arg::Str(text) => v8::String::new(scope, text)
                    .ok_or_else(|| Fault::Harness("argument too large for a V8 string".to_string()))?
                    .into(),
                Arg::Value(value) => v8::Local::new(scope, *value),
                Arg::Function(function) => v8::Local::new(scope, *function).into(),
            };
            locals.push(local);
        }

        let tc = &mut v8::TryCatch::new(scope);
        let receiver: v8::Local<v8::Value> = harness.into();
        if let Some(value) = function.call(tc, receiver, &locals) {
            return Ok(v8::Global::new(tc, value));
        }

        if tc.has_terminated() || tc.is_execution_terminating() {
            return Err(Fault::Terminated(terminator.reason()));
        }
        let Some(exception) = tc.exception() else {
            return Err(Fault::Threw {
                message: "Unknown error".to_string(),
                missing_capability: None,
            });
        };
        Err(describe_exception(tc, harness, exception))
    }
}

pub(crate) fn execution_error(fault: Fault) -> ExecutionError {
    match fault {
        Fault::Threw {
            missing_capability: Some(name),
            ..
        } => ExecutionError::MissingCapability { name },
        Fault::Threw { message, .. } => ExecutionError::Threw { message },
        Fault::Terminated(Some(Termination::Timeout)) => ExecutionError::TimedOut,
        Fault::Terminated(Some(Termination::HeapLimit)) => ExecutionError::HeapLimit,
        Fault::Terminated(_) => ExecutionError::Cancelled,
        Fault::Harness(message) => ExecutionError::Setup(message),
    }
}

fn describe_exception<'s>(
    scope: &mut v8::HandleScope<'s>,
    harness: v8::Local<'s, v8::Object>,
    exception: v8::Local<'s, v8::Value>,
) -> Fault {
    Fault::Threw {
        missing_capability: loader_error_name(scope, harness, exception),
        message: exception.to_rust_string_lossy(scope),
    }
}

/// Asks the harness whether `exception` came from its loader. A
/// `missingCapability` property set by component code does not count.
fn loader_error_name<'s>(
    scope: &mut v8::HandleScope<'s>,
    harness: v8::Local<'s, v8::Object>,
    exception: v8::Local<'s, v8::Value>,
) -> Option<String> {
    if !exception.is_object() {
        return None;
    }
    let key = v8::String::new(scope, "missingCapability")?;
    let check = v8::Local::<v8::Function>::try_from(harness.get(scope, key.into())?).ok()?;
    let name = check.call(scope, harness.into(), &[exception])?;
    name.is_string().then(|| name.to_rust_string_lossy(scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import_map::ModuleId;

    fn module(code: &str) -> CompiledModule {
        CompiledModule::new(code.to_string(), vec![ModuleId::Entry])
    }

    #[test]
    fn test_sealed_globals() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let component = sandbox
            .execute(&module(
                r#"module.exports = { default: function () {
                    return [typeof Deno, typeof fetch, typeof process, typeof require].join(",");
                } };"#,
            ))
            .unwrap();
        let element = sandbox.create_element(&component, "{}").unwrap();
        let json = sandbox.resolve(&element).unwrap();
        assert_eq!(json, r#"["undefined,undefined,undefined,function"]"#);
    }

    #[test]
    fn test_missing_capability() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox.execute(&module(r#"require("fs");"#)).err().unwrap();
        match err {
            ExecutionError::MissingCapability { name } => assert_eq!(name, "fs"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_forged_missing_capability_is_a_plain_throw() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox
            .execute(&module(
                r#"const e = new Error("fake"); e.missingCapability = "fs"; throw e;"#,
            ))
            .err()
            .unwrap();
        match err {
            ExecutionError::Threw { message } => assert_eq!(message, "Error: fake"),
            other => panic!("unexpected {other:?}"),
        }

        // Tampering with WeakMap does not help either.
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox
            .execute(&module(
                r#"WeakMap.prototype.get = () => "fs"; throw new Error("fake");"#,
            ))
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::Threw { .. }));
    }

    #[test]
    fn test_no_component() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox.execute(&module("exports.Test = () => null;")).err().unwrap();
        assert!(err.to_string().contains("no valid component found"));

        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox
            .execute(&module("module.exports = { default: 42 };"))
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::NoComponent { ref found } if found.contains("number")));
    }

    #[test]
    fn test_console_is_captured() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        sandbox
            .execute(&module(
                r#"console.log("hello", { a: 1 }); console.warn("careful"); console.error("bad");
                   module.exports = { default: () => null };"#,
            ))
            .unwrap();
        let console = sandbox.console();
        assert_eq!(console.logs, vec![r#"hello {"a":1}"#]);
        assert_eq!(console.warns, vec!["careful"]);
        assert_eq!(console.errors, vec!["bad"]);
    }

    #[test]
    fn test_throw_is_execution_error() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let err = sandbox.execute(&module(r#"throw new Error("boom");"#)).err().unwrap();
        assert_eq!(err.to_string(), "Error: boom");
    }

    #[test]
    fn test_terminate_reports_reason() {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let terminator = sandbox.terminator();
        let watchdog = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            terminator.terminate(Termination::Timeout);
        });
        let err = sandbox.execute(&module("for (;;) {}")).err().unwrap();
        watchdog.join().unwrap();
        assert!(matches!(err, ExecutionError::TimedOut));
    }
}

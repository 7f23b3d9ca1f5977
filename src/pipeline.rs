//! The render pipeline: compile → execute → render, strictly forward.
//!
//! Compilation runs on the async runtime (it suspends on remote fetches).
//! Execution and rendering share one isolate, so they run together on a
//! blocking worker thread. A watchdog stops that isolate when the deadline
//! passes, and dropping the render future stops it too.

use crate::compiler::{BundleInput, Bundler, CompileError, CompiledModule};
use crate::config::{ConfigError, RendererConfig};
use crate::import_map::ImportMap;
use crate::invoker::{Invoker, RenderError};
use crate::sanitize::{sanitize_props, SanitizeError};
use crate::sandbox::{ConsoleOutput, ExecutionError, Sandbox, SandboxConfig, Termination, Terminator};
use crate::serializer::{HtmlSerializer, TreeSerializer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Where a pipeline failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The request was rejected before compilation.
    Input,
    Compile,
    Execution,
    Render,
    /// The sandbox worker itself crashed.
    Internal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "InputError",
            Stage::Compile => "CompileError",
            Stage::Execution => "ExecutionError",
            Stage::Render => "RenderError",
            Stage::Internal => "InternalError",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid props: {0}")]
    Props(#[from] SanitizeError),

    #[error("Module bundling failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Component execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Component rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Render worker failed: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Props(_) => Stage::Input,
            PipelineError::Compile(_) => Stage::Compile,
            PipelineError::Execution(_) => Stage::Execution,
            PipelineError::Render(_) => Stage::Render,
            PipelineError::Internal(_) => Stage::Internal,
        }
    }
}

/// Pipeline state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Compiling,
    Executing,
    Rendering,
    Done,
    Failed(Stage),
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }

    /// Only forward moves are legal; `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Received, Compiling) | (Compiling, Executing) | (Executing, Rendering) | (Rendering, Done)
        ) || (!self.is_terminal() && matches!(next, Failed(_)))
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(self.can_advance_to(next), "illegal transition {:?} -> {:?}", self, next);
        debug!(from = ?*self, to = ?next, "pipeline state");
        *self = next;
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        self.advance(PipelineState::Failed(error.stage()));
        warn!(stage = error.stage().as_str(), error = %error, "render failed");
        error
    }
}

/// One render call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    /// Component source (JSX already compiled to JS).
    pub code: String,
    /// Property bag handed to the component. `null` is treated as `{}`.
    #[serde(default)]
    pub props: Value,
    /// Merged over the renderer's default map, override wins.
    #[serde(default, alias = "importMapOverride")]
    pub import_map: Option<ImportMap>,
    /// Virtual local modules, keyed by path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl RenderRequest {
    pub fn new(code: impl Into<String>, props: Value) -> Self {
        Self {
            code: code.into(),
            props,
            ..Default::default()
        }
    }

    pub fn with_import_map(mut self, import_map: ImportMap) -> Self {
        self.import_map = Some(import_map);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

/// Result of a successful render
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub html: String,
    pub console: ConsoleOutput,
}

/// `{ html }` or `{ error }`, as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HtmlResult {
    Html { html: String },
    Error { error: String },
}

impl From<Result<RenderOutput, PipelineError>> for HtmlResult {
    fn from(result: Result<RenderOutput, PipelineError>) -> Self {
        match result {
            Ok(output) => HtmlResult::Html { html: output.html },
            Err(e) => HtmlResult::Error { error: e.to_string() },
        }
    }
}

/// The render pipeline. Holds configuration only; every call builds its own
/// Import Map, compiled module and sandbox.
pub struct Renderer {
    bundler: Arc<dyn Bundler>,
    serializer: Arc<dyn TreeSerializer>,
    import_map: ImportMap,
    sandbox: SandboxConfig,
    timeout: Option<Duration>,
}

impl Renderer {
    /// Renderer with the HTTP-fetching graph bundler and the HTML serializer.
    pub fn new(config: RendererConfig) -> Result<Self, ConfigError> {
        let bundler = config.build_bundler()?;
        Ok(Self::with_backends(config, bundler, Arc::new(HtmlSerializer)))
    }

    pub fn with_backends(
        config: RendererConfig,
        bundler: Arc<dyn Bundler>,
        serializer: Arc<dyn TreeSerializer>,
    ) -> Self {
        Self {
            bundler,
            serializer,
            import_map: config.import_map,
            sandbox: config.sandbox,
            timeout: config.timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `render(code, props, importMapOverride?) -> HtmlResult`
    pub async fn render_html(&self, code: &str, props: Value, import_map: Option<ImportMap>) -> HtmlResult {
        let request = RenderRequest {
            import_map,
            ..RenderRequest::new(code, props)
        };
        self.render(request).await.into()
    }

    pub async fn render(&self, request: RenderRequest) -> Result<RenderOutput, PipelineError> {
        let request_id = Uuid::new_v4();
        self.run(request)
            .instrument(info_span!("render", %request_id))
            .await
    }

    async fn run(&self, mut request: RenderRequest) -> Result<RenderOutput, PipelineError> {
        let started = Instant::now();
        let deadline = self.timeout.map(|timeout| started + timeout);
        let mut state = PipelineState::Received;

        let props = sanitize_props(std::mem::take(&mut request.props)).map_err(|e| state.fail(e.into()))?;

        state.advance(PipelineState::Compiling);
        let compiled = self
            .compile(&request, deadline)
            .await
            .map_err(|e| state.fail(e.into()))?;

        let (result, mut state) = self.execute_and_render(compiled, props, deadline, state).await;
        let output = result.map_err(|e| state.fail(e))?;

        state.advance(PipelineState::Done);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = output.html.len(),
            "rendered"
        );
        Ok(output)
    }

    async fn compile(&self, request: &RenderRequest, deadline: Option<Instant>) -> Result<CompiledModule, CompileError> {
        let import_map = match &request.import_map {
            Some(overrides) => self.import_map.merged(overrides),
            None => self.import_map.clone(),
        };
        let input = BundleInput {
            source: &request.code,
            import_map: &import_map,
            files: &request.files,
        };

        match (deadline, self.timeout) {
            (Some(deadline), Some(timeout)) => tokio::time::timeout_at(deadline, self.bundler.bundle(input))
                .await
                .unwrap_or_else(|_| Err(CompileError::TimedOut(timeout.as_millis() as u64))),
            _ => self.bundler.bundle(input).await,
        }
    }

    async fn execute_and_render(
        &self,
        compiled: CompiledModule,
        props: Value,
        deadline: Option<Instant>,
        state: PipelineState,
    ) -> (Result<RenderOutput, PipelineError>, PipelineState) {
        let stop = StopHandle::default();
        let guard = StopOnDrop(Some(stop.clone()));
        let watchdog = deadline.map(|deadline| {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                stop.stop(Termination::Timeout);
            })
        });

        let config = self.sandbox.clone();
        let serializer = Arc::clone(&self.serializer);
        let span = Span::current();
        let joined = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut state = state;
            let result = run_sandbox(&config, &compiled, &props, serializer.as_ref(), &mut state, &stop);
            (result, state)
        })
        .await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        guard.disarm();

        joined.unwrap_or_else(|e| {
            (
                Err(PipelineError::Internal(e.to_string())),
                PipelineState::Executing,
            )
        })
    }
}

fn run_sandbox(
    config: &SandboxConfig,
    compiled: &CompiledModule,
    props: &Value,
    serializer: &dyn TreeSerializer,
    state: &mut PipelineState,
    stop: &StopHandle,
) -> Result<RenderOutput, PipelineError> {
    state.advance(PipelineState::Executing);
    let mut sandbox = Sandbox::new(config)?;
    stop.attach(sandbox.terminator()).map_err(stopped_before_start)?;
    let component = sandbox.execute(compiled)?;

    state.advance(PipelineState::Rendering);
    let html = Invoker::new(serializer).invoke(&mut sandbox, &component, props)?;
    Ok(RenderOutput {
        html,
        console: sandbox.console(),
    })
}

fn stopped_before_start(reason: Termination) -> ExecutionError {
    match reason {
        Termination::Timeout => ExecutionError::TimedOut,
        Termination::HeapLimit => ExecutionError::HeapLimit,
        Termination::Cancelled => ExecutionError::Cancelled,
    }
}

#[derive(Default)]
struct StopState {
    terminator: Option<Terminator>,
    reason: Option<Termination>,
}

/// Stop request shared by the watchdog, the drop guard and the worker. A
/// stop that arrives before the isolate exists is applied when it attaches.
#[derive(Clone, Default)]
struct StopHandle(Arc<Mutex<StopState>>);

impl StopHandle {
    fn attach(&self, terminator: Terminator) -> Result<(), Termination> {
        let mut state = self.0.lock();
        if let Some(reason) = state.reason {
            return Err(reason);
        }
        state.terminator = Some(terminator);
        Ok(())
    }

    fn stop(&self, reason: Termination) {
        let mut state = self.0.lock();
        if state.reason.is_none() {
            state.reason = Some(reason);
        }
        if let Some(terminator) = &state.terminator {
            terminator.terminate(reason);
        }
    }
}

/// Stops the sandbox if the render future is dropped mid-flight.
struct StopOnDrop(Option<StopHandle>);

impl StopOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(stop) = self.0.take() {
            debug!("render cancelled, stopping sandbox");
            stop.stop(Termination::Cancelled);
        }
    }
}

//! # component-ssr
//!
//! Renders untrusted UI components to HTML: compile → sandbox → render.
//!
//! ## Security Guarantees
//!
//! - **Fresh isolate per render**: no pooled or reused JS state between calls
//! - **No ambient globals**: `Deno`, `fetch`, `process`, timers and the file
//!   system don't exist inside the sandbox
//! - **Closed loader**: `require` resolves only `react`, `react/jsx-runtime`
//!   and `react/jsx-dev-runtime`; anything else fails immediately
//! - **Network only at compile time**: remote modules are fetched by the host
//!   from allowlisted origins, then inlined
//! - **Bounded**: heap cap, whole-render deadline, cancellation on drop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use component_ssr::{RenderRequest, Renderer, RendererConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let renderer = Renderer::new(RendererConfig::default()).unwrap();
//!     let output = renderer
//!         .render(RenderRequest::new(
//!             r#"import { jsx } from "react/jsx-runtime";
//!                export default ({ name }) => jsx("p", { children: name });"#,
//!             serde_json::json!({ "name": "Ada" }),
//!         ))
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(output.html, "<p>Ada</p>");
//! }
//! ```

pub mod compiler;
pub mod config;
pub mod fetch;
pub mod import_map;
pub mod invoker;
pub mod pipeline;
pub mod sandbox;
pub mod sanitize;
pub mod serializer;
pub mod server;

pub use compiler::{Bundler, CompileError, CompileOptions, CompiledModule, GraphBundler};
pub use config::{ConfigError, RendererConfig};
pub use fetch::{FetchConfig, FetchError, ModuleFetcher};
pub use import_map::{ImportConfig, ImportMap, DEFAULT_REMOTE_ORIGIN};
pub use invoker::RenderError;
pub use pipeline::{HtmlResult, PipelineError, PipelineState, RenderOutput, RenderRequest, Renderer, Stage};
pub use sandbox::{ConsoleOutput, ExecutionError, SandboxConfig};
pub use sanitize::sanitize_props;
pub use serializer::{HtmlSerializer, TreeSerializer};

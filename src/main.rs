//! component-ssr CLI
//!
//! Server mode:
//!   component-ssr serve [--host 0.0.0.0] [--port 3000]
//!
//! Single-shot mode:
//!   component-ssr render <file> [props-json]
//!
//!   HTML goes to stdout, captured console output to stderr.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use component_ssr::{server, RenderRequest, Renderer, RendererConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "component-ssr")]
#[command(about = "Compile, sandbox and render untrusted JSX components to HTML")]
struct Cli {
    #[command(flatten)]
    options: RendererOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP render service
    Serve {
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,
    },
    /// Render one component file and exit
    Render {
        /// Component source (JSX already compiled to JS)
        file: PathBuf,

        /// Props as a JSON object
        props: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RendererOptions {
    /// Origin for root-relative and URL-shaped imports
    #[arg(long, global = true, env = "SSR_REMOTE_ORIGIN", default_value = component_ssr::DEFAULT_REMOTE_ORIGIN)]
    remote_origin: String,

    /// Extra origins remote modules may be fetched from (comma separated)
    #[arg(long, global = true, env = "SSR_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Whole-render deadline in milliseconds (0 = none)
    #[arg(long, global = true, env = "SSR_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// V8 heap cap per render in MiB (0 = V8 default)
    #[arg(long, global = true, env = "SSR_MAX_HEAP_MB", default_value_t = 64)]
    max_heap_mb: usize,

    /// Fetch remote modules on every render
    #[arg(long, global = true, env = "SSR_NO_MODULE_CACHE")]
    no_module_cache: bool,
}

impl RendererOptions {
    fn into_config(self) -> RendererConfig {
        let mut config = RendererConfig::with_remote_origin(self.remote_origin);
        config
            .fetch
            .allowed_origins
            .extend(self.allowed_origins.into_iter().filter(|o| !o.is_empty()));
        config.timeout = (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms));
        config.sandbox.max_heap_size = (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024);
        config.cache_remote_modules = !self.no_module_cache;
        config
    }
}

async fn run_server(renderer: Renderer, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("component-ssr listening on http://{}", addr);
    axum::serve(listener, server::router(Arc::new(renderer)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn run_single_shot(renderer: Renderer, file: &Path, props_json: Option<&str>) -> Result<()> {
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let props = match props_json {
        Some(json) => serde_json::from_str(json).map_err(|e| anyhow!("Invalid props JSON: {}", e))?,
        None => serde_json::json!({}),
    };
    let props = component_ssr::sanitize_props(props)?;

    let output = renderer.render(RenderRequest::new(code, props)).await?;

    for log in &output.console.logs {
        eprintln!("[LOG] {}", log);
    }
    for warn in &output.console.warns {
        eprintln!("[WARN] {}", warn);
    }
    for err in &output.console.errors {
        eprintln!("[ERROR] {}", err);
    }

    println!("{}", output.html);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "component_ssr=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let renderer = Renderer::new(cli.options.into_config())?;

    match cli.command {
        Command::Serve { host, port } => run_server(renderer, &host, port).await,
        Command::Render { file, props } => run_single_shot(renderer, &file, props.as_deref()).await,
    }
}

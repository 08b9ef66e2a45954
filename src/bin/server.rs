use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use container_webui::backend::helper::DEFAULT_HELPER_DIR;
use container_webui::config::{default_shell, BackendChoice, ServerConfig};
use container_webui::history::DEFAULT_HISTORY_LIMIT;
use container_webui::{build_router, AppState, ContainerRuntime, HistoryStore};
use container_webui::{DEFAULT_HTTP_PORT, DEFAULT_RUNTIME};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "container-webui", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "CONSOLE_BIND")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "CONSOLE_PORT")]
    port: u16,
    /// Container runtime command-line tool
    #[arg(long, default_value = DEFAULT_RUNTIME, env = "CONSOLE_RUNTIME")]
    runtime: String,
    /// Shell started inside containers (repeat for arguments)
    #[arg(
        long = "shell",
        env = "CONSOLE_SHELL",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    shell: Vec<String>,
    /// Terminal backend
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto, env = "CONSOLE_BACKEND")]
    backend: BackendChoice,
    /// Directory holding the terminal helper artifacts
    #[arg(long, default_value = DEFAULT_HELPER_DIR, env = "CONSOLE_HELPER_DIR")]
    helper_dir: PathBuf,
    /// Download URL of the terminal helper executable
    #[arg(long, env = "CONSOLE_HELPER_EXECUTABLE_URL")]
    helper_executable_url: Option<String>,
    /// Download URL of the terminal helper support library
    #[arg(long, env = "CONSOLE_HELPER_LIBRARY_URL")]
    helper_library_url: Option<String>,
    /// Bytes of shell output kept per container (0 keeps everything)
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT, env = "CONSOLE_HISTORY_LIMIT")]
    history_limit: usize,
    /// Directory used for logs
    #[arg(long, env = "CONSOLE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Options {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind: parse_bind_ip(&self.bind),
            port: self.port,
            runtime: self.runtime,
            shell: if self.shell.is_empty() {
                default_shell()
            } else {
                self.shell
            },
            backend: self.backend,
            helper_dir: self.helper_dir,
            helper_executable_url: self
                .helper_executable_url
                .unwrap_or(defaults.helper_executable_url),
            helper_library_url: self
                .helper_library_url
                .unwrap_or(defaults.helper_library_url),
            history_limit: self.history_limit,
            log_dir: self.log_dir,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log_dir.as_deref());

    run_server(options.into_config()).await
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "container-webui.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let runtime = match ContainerRuntime::locate(&config.runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::warn!(
                %error,
                "runtime not found in PATH; container operations will fail until it is installed"
            );
            ContainerRuntime::new(&config.runtime)
        }
    };

    let backend = config
        .build_backend(runtime.binary())
        .await
        .context("failed to prepare terminal backend")?;
    tracing::info!(
        "using {} terminal backend with shell {:?}",
        backend.kind().as_str(),
        config.shell
    );

    let history = HistoryStore::new(config.history_limit);
    let state = AppState::new(Arc::new(runtime), backend, history, config.shell.clone());
    let app = build_router(state);

    let addr = config.addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("container-webui listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;

use crate::backend::helper::{DEFAULT_EXECUTABLE_URL, DEFAULT_HELPER_DIR, DEFAULT_LIBRARY_URL};
use crate::backend::{
    Artifact, BackendKind, HelperArtifacts, HelperBackend, NativeBackend, SessionBackend,
};
use crate::errors::ConsoleResult;
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::{DEFAULT_HTTP_PORT, DEFAULT_RUNTIME};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    /// Native pseudo-terminal where the host has one, helper process otherwise
    #[default]
    Auto,
    Native,
    Helper,
}

impl BackendChoice {
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendChoice::Auto => BackendKind::detect(),
            BackendChoice::Native => BackendKind::Native,
            BackendChoice::Helper => BackendKind::Helper,
        }
    }
}

/// Shell started inside containers when none is configured.
pub fn default_shell() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".to_string()]
    } else {
        vec!["sh".to_string()]
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub runtime: String,
    pub shell: Vec<String>,
    pub backend: BackendChoice,
    pub helper_dir: PathBuf,
    pub helper_executable_url: String,
    pub helper_library_url: String,
    /// Bytes of session output kept per container; `0` keeps everything.
    pub history_limit: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_HTTP_PORT,
            runtime: DEFAULT_RUNTIME.to_string(),
            shell: default_shell(),
            backend: BackendChoice::Auto,
            helper_dir: PathBuf::from(DEFAULT_HELPER_DIR),
            helper_executable_url: DEFAULT_EXECUTABLE_URL.to_string(),
            helper_library_url: DEFAULT_LIBRARY_URL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn helper_artifacts(&self) -> HelperArtifacts {
        HelperArtifacts::new(
            &self.helper_dir,
            Artifact::new(&self.helper_executable_url),
            Artifact::new(&self.helper_library_url),
        )
    }

    /// Builds the configured backend. The helper backend fetches its
    /// artifacts here so a missing download fails startup, not the first session.
    pub async fn build_backend(&self, runtime: &Path) -> ConsoleResult<Arc<dyn SessionBackend>> {
        match self.backend.resolve() {
            BackendKind::Native => Ok(Arc::new(NativeBackend::new(runtime))),
            BackendKind::Helper => {
                let backend = HelperBackend::new(runtime, self.helper_artifacts());
                let dir = backend.prepare().await?;
                tracing::info!("[backend] helper artifacts ready in {}", dir.display());
                Ok(Arc::new(backend))
            }
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::SessionBackend;
use crate::errors::ConsoleResult;
use crate::history::HistoryStore;
use crate::models::{ContainerSummary, CreateContainerRequest, CreateContainerResponse};
use crate::registry::SessionRegistry;

/// Container lifecycle operations exposed over REST.
#[async_trait]
pub trait ContainerService: Send + Sync + 'static {
    async fn list(&self) -> ConsoleResult<Vec<ContainerSummary>>;
    async fn create(&self, request: CreateContainerRequest)
        -> ConsoleResult<CreateContainerResponse>;
    async fn start(&self, id: String) -> ConsoleResult<()>;
    async fn stop(&self, id: String) -> ConsoleResult<()>;
    /// Raw inspect document for one container.
    async fn inspect(&self, id: String) -> ConsoleResult<serde_json::Value>;
    /// Last `tail` log lines (all when `None`), stdout before stderr.
    async fn logs(&self, id: String, tail: Option<usize>) -> ConsoleResult<Vec<String>>;
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn ContainerService>,
    pub backend: Arc<dyn SessionBackend>,
    pub history: HistoryStore,
    pub sessions: SessionRegistry,
    /// Command run inside the container for every shell session.
    pub shell: Vec<String>,
}

impl AppState {
    pub fn new(
        service: Arc<dyn ContainerService>,
        backend: Arc<dyn SessionBackend>,
        history: HistoryStore,
        shell: Vec<String>,
    ) -> Self {
        Self {
            service,
            backend,
            history,
            sessions: SessionRegistry::default(),
            shell,
        }
    }
}

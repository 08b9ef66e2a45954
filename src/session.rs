//! One shell session per accepted WebSocket connection.
//!
//! A session opens a backend for its container, replays the recorded history,
//! runs the relay until either side stops and then releases both ends once.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{SessionBackend, ShellRequest};
use crate::errors::{ConsoleError, ConsoleResult};
use crate::history::HistoryStore;
use crate::models::SessionState;
use crate::registry::{RegistrationGuard, SessionRegistry};
use crate::relay::{Relay, RelayOutcome};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SessionManager {
    id: Uuid,
    request: ShellRequest,
    backend: Arc<dyn SessionBackend>,
    history: HistoryStore,
    registry: SessionRegistry,
    state: SessionState,
    _registration: RegistrationGuard,
}

impl SessionManager {
    pub fn new(
        request: ShellRequest,
        backend: Arc<dyn SessionBackend>,
        history: HistoryStore,
        registry: SessionRegistry,
    ) -> Self {
        let id = Uuid::new_v4();
        let registration = registry.register(id, &request.container_id, SessionState::Upgrading);
        Self {
            id,
            request,
            backend,
            history,
            registry,
            state: SessionState::Upgrading,
            _registration: registration,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn label(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "[session:{}] {} -> {}",
            self.label(),
            self.state,
            next
        );
        self.state = next;
        self.registry.update(self.id, next);
    }

    /// Drives the session to completion. The socket is always closed and the
    /// backend, if one was opened, is always terminated before returning.
    pub async fn run(mut self, mut socket: WebSocket) -> ConsoleResult<RelayOutcome> {
        let label = self.label();
        let container_id = self.request.container_id.clone();

        if container_id.is_empty() {
            self.transition(SessionState::Closing);
            close_socket(&label, socket, close_code::POLICY, "missing container id").await;
            self.transition(SessionState::Closed);
            return Err(ConsoleError::InvalidRequest(
                "container id must not be empty".into(),
            ));
        }

        self.transition(SessionState::Spawning);
        let handle = match self.backend.open(&self.request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[session:{}] backend for {} unavailable: {}", label, container_id, e);
                self.transition(SessionState::Closing);
                close_socket(&label, socket, close_code::ERROR, "backend unavailable").await;
                self.transition(SessionState::Closed);
                return Err(e);
            }
        };
        info!(
            "[session:{}] attached to {} via {} backend (pid: {:?})",
            label,
            container_id,
            self.backend.kind().as_str(),
            handle.process_id()
        );
        let (output, input, process) = handle.into_split();

        self.transition(SessionState::Replaying);
        let snapshot = self.history.replay(&container_id);
        let replayed = snapshot.len();
        let mut replay_error = None;
        for chunk in snapshot {
            if let Err(e) = socket.send(Message::Binary(chunk)).await {
                replay_error = Some(ConsoleError::RelayIo(format!("replay write failed: {e}")));
                break;
            }
        }

        let (socket, result) = match replay_error {
            Some(e) => {
                debug!("[session:{}] {}", label, e);
                (Some(socket), Err(e))
            }
            None => {
                debug!("[session:{}] replayed {} chunks", label, replayed);
                self.transition(SessionState::Relaying);
                let (sink, stream) = socket.split();
                let relay = Relay::new(label.clone(), container_id.clone(), self.history.clone());
                let result = relay.run(stream, sink, output, input).await;
                let socket = match (result.stream, result.sink) {
                    (Some(stream), Some(sink)) => stream.reunite(sink).ok(),
                    _ => None,
                };
                (socket, Ok(result.outcome))
            }
        };

        self.transition(SessionState::Closing);
        process.close().await;
        if let Some(socket) = socket {
            close_socket(&label, socket, close_code::NORMAL, "").await;
        }
        self.transition(SessionState::Closed);

        if let Ok(outcome) = &result {
            info!(
                "[session:{}] detached from {} ({} bytes in, {} bytes out)",
                label, container_id, outcome.bytes_in, outcome.bytes_out
            );
        }
        result
    }
}

async fn close_socket(label: &str, mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, socket.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[session:{}] close frame not sent: {}", label, e),
        Err(_) => debug!("[session:{}] close frame timed out", label),
    }
}

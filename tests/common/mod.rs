#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use container_webui::backend::{
    BackendHandle, BackendKind, ProcessControl, SessionBackend, ShellRequest,
};
use container_webui::errors::{ConsoleError, ConsoleResult};
use container_webui::models::{ContainerSummary, CreateContainerRequest, CreateContainerResponse};
use container_webui::{build_router, AppState, ContainerService, HistoryStore};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct FakeProcess {
    terminated: AtomicBool,
}

impl FakeProcess {
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn wait_terminated(&self) {
        tokio::time::timeout(WAIT, async {
            while !self.is_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend process was not terminated");
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    fn process_id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Test side of one opened backend: push output, observe input.
pub struct FakeSession {
    pub request: ShellRequest,
    pub output: mpsc::Sender<Bytes>,
    pub input: mpsc::Receiver<Bytes>,
    pub process: Arc<FakeProcess>,
}

impl FakeSession {
    pub async fn emit(&self, data: &'static [u8]) {
        self.output
            .send(Bytes::from_static(data))
            .await
            .expect("relay stopped reading backend output");
    }

    pub async fn next_input(&mut self) -> Bytes {
        tokio::time::timeout(WAIT, self.input.recv())
            .await
            .expect("no input reached the backend")
            .expect("backend input closed")
    }
}

pub struct FakeBackend {
    sessions: mpsc::UnboundedSender<FakeSession>,
    fail: bool,
    opened: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSession>) {
        Self::build(false)
    }

    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSession>) {
        Self::build(true)
    }

    fn build(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            sessions: tx,
            fail,
            opened: AtomicUsize::new(0),
        });
        (backend, rx)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn open(&self, request: &ShellRequest) -> ConsoleResult<BackendHandle> {
        if self.fail {
            return Err(ConsoleError::BackendUnavailable(
                "failed to spawn exec session".into(),
            ));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (out_tx, out_rx) = mpsc::channel(32);
        let (in_tx, in_rx) = mpsc::channel(32);
        let process = Arc::new(FakeProcess::default());
        let _ = self.sessions.send(FakeSession {
            request: request.clone(),
            output: out_tx,
            input: in_rx,
            process: process.clone(),
        });
        Ok(BackendHandle::new(out_rx, in_tx, process))
    }
}

pub async fn next_session(sessions: &mut mpsc::UnboundedReceiver<FakeSession>) -> FakeSession {
    tokio::time::timeout(WAIT, sessions.recv())
        .await
        .expect("no backend was opened")
        .expect("backend dropped")
}

/// In-memory stand-in for the runtime CLI.
#[derive(Default)]
pub struct FakeContainers {
    containers: Mutex<HashMap<String, ContainerSummary>>,
}

impl FakeContainers {
    pub fn with(ids: &[&str]) -> Self {
        let fake = Self::default();
        for id in ids {
            fake.containers.lock().insert(
                id.to_string(),
                ContainerSummary {
                    id: id.to_string(),
                    names: vec![format!("{id}-name")],
                    image: "alpine".into(),
                    status: "Created".into(),
                    state: "created".into(),
                },
            );
        }
        fake
    }

    fn set_state(&self, id: &str, state: &str, status: &str) -> ConsoleResult<()> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| ConsoleError::NotFound(id.to_string()))?;
        container.state = state.into();
        container.status = status.into();
        Ok(())
    }
}

#[async_trait]
impl ContainerService for FakeContainers {
    async fn list(&self) -> ConsoleResult<Vec<ContainerSummary>> {
        let mut list: Vec<_> = self.containers.lock().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn create(
        &self,
        request: CreateContainerRequest,
    ) -> ConsoleResult<CreateContainerResponse> {
        if request.image.trim().is_empty() {
            return Err(ConsoleError::InvalidRequest("image must not be empty".into()));
        }
        let mut containers = self.containers.lock();
        let id = format!("c{}", containers.len() + 1);
        containers.insert(
            id.clone(),
            ContainerSummary {
                id: id.clone(),
                names: request.name.into_iter().collect(),
                image: request.image,
                status: "Created".into(),
                state: "created".into(),
            },
        );
        Ok(CreateContainerResponse { id })
    }

    async fn start(&self, id: String) -> ConsoleResult<()> {
        self.set_state(&id, "running", "Up 1 second")
    }

    async fn stop(&self, id: String) -> ConsoleResult<()> {
        self.set_state(&id, "exited", "Exited (0) 1 second ago")
    }

    async fn inspect(&self, id: String) -> ConsoleResult<serde_json::Value> {
        let containers = self.containers.lock();
        let container = containers
            .get(&id)
            .ok_or_else(|| ConsoleError::NotFound(id.clone()))?;
        Ok(serde_json::json!({
            "Id": container.id,
            "Config": { "Image": container.image },
            "State": { "Status": container.state },
        }))
    }

    async fn logs(&self, id: String, tail: Option<usize>) -> ConsoleResult<Vec<String>> {
        if !self.containers.lock().contains_key(&id) {
            return Err(ConsoleError::NotFound(id));
        }
        let lines: Vec<String> = (1..=5).map(|i| format!("line {i}")).collect();
        let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
        Ok(lines.into_iter().skip(skip).collect())
    }
}

pub fn app_state(backend: Arc<dyn SessionBackend>) -> AppState {
    AppState::new(
        Arc::new(FakeContainers::with(&["abc123"])),
        backend,
        HistoryStore::default(),
        vec!["sh".to_string()],
    )
}

pub async fn spawn_server(state: AppState) -> (SocketAddr, JoinHandle<()>) {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

pub async fn connect(addr: SocketAddr, path: &str) -> ClientSocket {
    let (ws, _response) = tokio::time::timeout(
        WAIT,
        tokio_tungstenite::connect_async(format!("ws://{addr}{path}")),
    )
    .await
    .expect("ws connect timed out")
    .expect("ws handshake failed");
    ws
}

/// Next binary payload, skipping control frames.
pub async fn next_binary(ws: &mut ClientSocket) -> Vec<u8> {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected binary frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no binary frame in time")
}

/// Waits for the server to end the stream and returns the close code, if any.
pub async fn expect_closed(ws: &mut ClientSocket) -> Option<u16> {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(Message::Binary(data))) => {
                    panic!("unexpected data before close: {data:?}")
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("connection was not closed in time")
}

//! Shell backends: a child process running an interactive shell inside a
//! container, attached to a pseudo-terminal or a helper-hosted console.
//!
//! Both variants hand back the same [`BackendHandle`]: a bounded channel of
//! output chunks, a bounded channel for input bytes and a process control used
//! to terminate the child.

pub mod helper;
pub mod native;
#[cfg(windows)]
mod winpty;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::{ConsoleError, ConsoleResult};

pub use helper::{Artifact, HelperArtifacts, HelperBackend};
pub use native::NativeBackend;

/// Largest chunk handed out by a single backend read.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
/// How long a child gets to exit after the termination request before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub(crate) const CHANNEL_CAPACITY: usize = 32;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellRequest {
    pub container_id: String,
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellRequest {
    pub fn new(container_id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            container_id: container_id.into(),
            command,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    pub fn with_size(mut self, cols: Option<u16>, rows: Option<u16>) -> Self {
        self.cols = cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
        self.rows = rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Helper,
}

impl BackendKind {
    /// Hosts without a native pseudo-terminal go through the helper process.
    pub fn detect() -> Self {
        if cfg!(windows) {
            BackendKind::Helper
        } else {
            BackendKind::Native
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Helper => "helper",
        }
    }
}

#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;
    async fn open(&self, request: &ShellRequest) -> ConsoleResult<BackendHandle>;
}

#[async_trait]
pub trait ProcessControl: Send + Sync + 'static {
    fn process_id(&self) -> Option<u32>;
    /// Requests graceful termination, escalates to a kill after the grace
    /// period and reaps the child. Calling it again is a no-op.
    async fn terminate(&self);
}

pub struct BackendOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl BackendOutput {
    /// Next chunk of at most [`OUTPUT_CHUNK_SIZE`] bytes, or
    /// [`ConsoleError::BackendClosed`] once the child's output has ended.
    pub async fn read(&mut self) -> ConsoleResult<Bytes> {
        self.rx.recv().await.ok_or(ConsoleError::BackendClosed)
    }
}

#[derive(Clone)]
pub struct BackendInput {
    tx: mpsc::Sender<Bytes>,
}

impl BackendInput {
    pub async fn write(&self, data: Bytes) -> ConsoleResult<usize> {
        let len = data.len();
        self.tx
            .send(data)
            .await
            .map_err(|_| ConsoleError::RelayIo("backend input closed".into()))?;
        Ok(len)
    }
}

#[derive(Clone)]
pub struct BackendProcess {
    control: Arc<dyn ProcessControl>,
}

impl BackendProcess {
    pub fn process_id(&self) -> Option<u32> {
        self.control.process_id()
    }

    pub async fn close(&self) {
        self.control.terminate().await;
    }
}

pub struct BackendHandle {
    output: BackendOutput,
    input: BackendInput,
    process: BackendProcess,
}

impl BackendHandle {
    pub fn new(
        output: mpsc::Receiver<Bytes>,
        input: mpsc::Sender<Bytes>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            output: BackendOutput { rx: output },
            input: BackendInput { tx: input },
            process: BackendProcess { control },
        }
    }

    pub async fn read(&mut self) -> ConsoleResult<Bytes> {
        self.output.read().await
    }

    pub async fn write(&self, data: Bytes) -> ConsoleResult<usize> {
        self.input.write(data).await
    }

    pub async fn close(&self) {
        self.process.close().await;
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.process_id()
    }

    pub fn into_split(self) -> (BackendOutput, BackendInput, BackendProcess) {
        (self.output, self.input, self.process)
    }
}

#[cfg(unix)]
pub(crate) fn request_termination(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.filter(|p| *p != 0 && *p <= i32::MAX as u32) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("[backend] SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
pub(crate) fn request_termination(_pid: Option<u32>) {}

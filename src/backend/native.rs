use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    request_termination, BackendHandle, BackendKind, ProcessControl, SessionBackend, ShellRequest,
    CHANNEL_CAPACITY, OUTPUT_CHUNK_SIZE, TERMINATE_GRACE,
};
use crate::errors::{ConsoleError, ConsoleResult};
use crate::runtime::ContainerRuntime;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `<runtime> exec -it <id> <shell>` on the host's own pseudo-terminal.
pub struct NativeBackend {
    runtime: PathBuf,
}

impl NativeBackend {
    pub fn new(runtime: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

#[async_trait]
impl SessionBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn open(&self, request: &ShellRequest) -> ConsoleResult<BackendHandle> {
        let mut cmd = CommandBuilder::new(&self.runtime);
        cmd.args(ContainerRuntime::exec_args(
            &request.container_id,
            &request.command,
        ));
        let request = request.clone();
        tokio::task::spawn_blocking(move || spawn_on_pty(BackendKind::Native, &request, cmd))
            .await
            .map_err(|e| ConsoleError::unavailable("pty spawn task failed", e))?
    }
}

/// Starts `cmd` on a fresh pseudo-terminal sized from `request` and bridges
/// the master side to the handle's channels with two blocking threads.
pub(super) fn spawn_on_pty(
    kind: BackendKind,
    request: &ShellRequest,
    mut cmd: CommandBuilder,
) -> ConsoleResult<BackendHandle> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ConsoleError::unavailable("failed to open pty", e))?;

    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ConsoleError::unavailable("failed to spawn exec session", e))?;
    // Release slave so reads on the master fail once the child exits
    drop(pair.slave);

    let pid = child.process_id();
    let streams = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ConsoleError::unavailable("failed to attach pty streams", e));
        }
    };

    let label = request.container_id.clone();
    info!(
        "[backend:{}] {} pty session started (pid: {:?}, {}x{})",
        label,
        kind.as_str(),
        pid,
        request.cols,
        request.rows
    );

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_reader_thread(label.clone(), reader, out_tx);
    spawn_writer_thread(label, writer, in_rx);

    let process = Arc::new(NativeProcess {
        child: Mutex::new(Some(child)),
        master: Mutex::new(Some(pair.master)),
        pid,
        grace: TERMINATE_GRACE,
    });

    Ok(BackendHandle::new(out_rx, in_tx, process))
}

pub(super) fn spawn_reader_thread(label: String, mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; OUTPUT_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("[backend:{}] pty output EOF", label);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("[backend:{}] pty read ended: {}", label, e);
                    break;
                }
            }
        }
    });
}

pub(super) fn spawn_writer_thread(
    label: String,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    std::thread::spawn(move || {
        while let Some(data) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!("[backend:{}] pty write error: {}", label, e);
                break;
            }
        }
        debug!("[backend:{}] pty writer finished", label);
    });
}

struct NativeProcess {
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    pid: Option<u32>,
    grace: Duration,
}

#[async_trait]
impl ProcessControl for NativeProcess {
    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self) {
        let child = self.child.lock().take();
        let master = self.master.lock().take();
        let Some(child) = child else {
            return;
        };

        let pid = self.pid;
        let grace = self.grace;
        let reaped = tokio::task::spawn_blocking(move || {
            reap_child(child, pid, grace);
            drop(master);
        })
        .await;
        if let Err(e) = reaped {
            warn!("[backend] reaping pid {:?} failed: {}", pid, e);
        }
    }
}

/// Handles dropped without `terminate` still kill and reap their child.
impl Drop for NativeProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.get_mut().take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.kill() {
            warn!("[backend] failed to kill pid {:?} on drop: {}", self.pid, e);
        }
        if let Err(e) = child.wait() {
            warn!("[backend] failed to reap pid {:?} on drop: {}", self.pid, e);
        }
    }
}

fn reap_child(mut child: Box<dyn Child + Send + Sync>, pid: Option<u32>, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("[backend] pid {:?} already exited: {:?}", pid, status);
        return;
    }

    request_termination(pid);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("[backend] pid {:?} exited: {:?}", pid, status);
                return;
            }
            Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            Err(_) => break,
        }
    }

    warn!("[backend] pid {:?} ignored termination request, killing", pid);
    if let Err(e) = child.kill() {
        warn!("[backend] failed to kill pid {:?}: {}", pid, e);
    }
    let _ = child.wait();
}

//! Bidirectional byte pumps between a WebSocket peer and a shell backend.
//!
//! Two tasks run per session. The inbound pump forwards peer payloads to the
//! backend's input. The outbound pump records every backend chunk in the
//! history store and then sends it to the peer as one binary message. Both
//! share a cancellation token: whichever stops first cancels it, and the other
//! stops at its next read or write.

use std::fmt::Display;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendInput, BackendOutput};
use crate::errors::ConsoleError;
use crate::history::HistoryStore;

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The peer sent a close frame or its stream ended.
    PeerClosed,
    /// The backend's output ended.
    BackendClosed,
    /// The other pump stopped first.
    Cancelled,
    Failed(ConsoleError),
}

impl PumpExit {
    pub fn is_error(&self) -> bool {
        matches!(self, PumpExit::Failed(_))
    }
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub inbound: PumpExit,
    pub outbound: PumpExit,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub chunks_out: u64,
}

/// Halves handed back after relaying so the caller can close the connection.
/// A half is `None` only if its pump task panicked.
pub struct RelayResult<R, W> {
    pub stream: Option<R>,
    pub sink: Option<W>,
    pub outcome: RelayOutcome,
}

pub struct Relay {
    label: String,
    container_id: String,
    history: HistoryStore,
}

impl Relay {
    pub fn new(label: impl Into<String>, container_id: impl Into<String>, history: HistoryStore) -> Self {
        Self {
            label: label.into(),
            container_id: container_id.into(),
            history,
        }
    }

    /// Runs both pumps until one of them stops, then waits for the other.
    pub async fn run<R, W, E>(
        &self,
        stream: R,
        sink: W,
        output: BackendOutput,
        input: BackendInput,
    ) -> RelayResult<R, W>
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display + Send,
    {
        let cancel = CancellationToken::new();

        let inbound = {
            let cancel = cancel.clone();
            let label = self.label.clone();
            tokio::spawn(async move {
                let result = pump_inbound(&label, stream, input, &cancel).await;
                cancel.cancel();
                result
            })
        };

        let outbound = {
            let cancel = cancel.clone();
            let label = self.label.clone();
            let container_id = self.container_id.clone();
            let history = self.history.clone();
            tokio::spawn(async move {
                let result =
                    pump_outbound(&label, &container_id, &history, output, sink, &cancel).await;
                cancel.cancel();
                result
            })
        };

        let (inbound, outbound) = tokio::join!(inbound, outbound);

        let (stream, inbound, bytes_in) = match inbound {
            Ok((stream, exit, bytes)) => (Some(stream), exit, bytes),
            Err(e) => (
                None,
                PumpExit::Failed(ConsoleError::RelayIo(format!("inbound pump panicked: {e}"))),
                0,
            ),
        };
        let (sink, outbound, bytes_out, chunks_out) = match outbound {
            Ok((sink, exit, bytes, chunks)) => (Some(sink), exit, bytes, chunks),
            Err(e) => (
                None,
                PumpExit::Failed(ConsoleError::RelayIo(format!("outbound pump panicked: {e}"))),
                0,
                0,
            ),
        };

        debug!(
            "[relay:{}] finished (inbound: {:?}, outbound: {:?}, in: {} bytes, out: {} bytes in {} chunks)",
            self.label, inbound, outbound, bytes_in, bytes_out, chunks_out
        );

        RelayResult {
            stream,
            sink,
            outcome: RelayOutcome {
                inbound,
                outbound,
                bytes_in,
                bytes_out,
                chunks_out,
            },
        }
    }
}

async fn pump_inbound<R, E>(
    label: &str,
    mut stream: R,
    input: BackendInput,
    cancel: &CancellationToken,
) -> (R, PumpExit, u64)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return (stream, PumpExit::Cancelled, forwarded),
            next = stream.next() => next,
        };

        let payload = match next {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Close(_))) | None => {
                debug!("[relay:{}] peer closed", label);
                return (stream, PumpExit::PeerClosed, forwarded);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("[relay:{}] peer read error: {}", label, e);
                let err = ConsoleError::RelayIo(format!("peer read failed: {e}"));
                return (stream, PumpExit::Failed(err), forwarded);
            }
        };
        if payload.is_empty() {
            continue;
        }

        let written = tokio::select! {
            _ = cancel.cancelled() => return (stream, PumpExit::Cancelled, forwarded),
            written = input.write(payload) => written,
        };
        match written {
            Ok(n) => forwarded += n as u64,
            Err(e) => {
                warn!("[relay:{}] backend write failed: {}", label, e);
                return (stream, PumpExit::Failed(e), forwarded);
            }
        }
    }
}

async fn pump_outbound<W>(
    label: &str,
    container_id: &str,
    history: &HistoryStore,
    mut output: BackendOutput,
    mut sink: W,
    cancel: &CancellationToken,
) -> (W, PumpExit, u64, u64)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let (mut bytes, mut chunks) = (0u64, 0u64);
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return (sink, PumpExit::Cancelled, bytes, chunks),
            read = output.read() => read,
        };

        let chunk = match read {
            Ok(chunk) => chunk,
            Err(ConsoleError::BackendClosed) => {
                debug!("[relay:{}] backend output closed", label);
                return (sink, PumpExit::BackendClosed, bytes, chunks);
            }
            Err(e) => return (sink, PumpExit::Failed(e), bytes, chunks),
        };

        history.append(container_id, chunk.clone());
        let len = chunk.len() as u64;

        let sent = tokio::select! {
            _ = cancel.cancelled() => return (sink, PumpExit::Cancelled, bytes, chunks),
            sent = sink.send(Message::Binary(chunk)) => sent,
        };
        if let Err(e) = sent {
            debug!("[relay:{}] peer write error: {}", label, e);
            let err = ConsoleError::RelayIo(format!("peer write failed: {e}"));
            return (sink, PumpExit::Failed(err), bytes, chunks);
        }
        bytes += len;
        chunks += 1;
    }
}

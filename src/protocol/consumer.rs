//! Transport halves, the command producer and the message consumers.
//!
//! Exactly one consumer reads the transport at a time. A consumer runs as its
//! own task and forwards what it reads to the device state machine through an
//! `mpsc` queue. Stopping a consumer hands the read half back, so the state
//! machine can attach a different kind of consumer to the same transport.
//!
//! | Kind | Delivers | Used by |
//! |------|----------|---------|
//! | [`ConsumerKind::Binary`] | decoded [`DeviceMessage`]s | status and streaming |
//! | [`ConsumerKind::Text`] | idle-terminated text chunks | SD-card file list |
//! | [`ConsumerKind::Raw`] | idle-terminated byte chunks | SD-card file download |

use super::framing::{Decoded, DeviceMessageCodec};
use super::DeviceMessage;
use crate::device::DeviceCommand;
use crate::error::AppResult;
use futures::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Type-erased read half of a transport.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Type-erased write half of a transport.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A connected byte stream, split into halves.
pub struct DeviceTransport {
    /// Device → host
    pub reader: BoxReader,
    /// Host → device
    pub writer: BoxWriter,
}

impl DeviceTransport {
    /// Split any duplex stream (serial port, TCP socket, `tokio::io::duplex`).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Build from separately obtained halves.
    pub fn from_parts(reader: BoxReader, writer: BoxWriter) -> Self {
        Self { reader, writer }
    }
}

impl std::fmt::Debug for DeviceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTransport").finish_non_exhaustive()
    }
}

/// Writes commands to the device.
pub struct CommandProducer {
    writer: BoxWriter,
}

impl CommandProducer {
    /// Wrap the write half of a transport.
    pub fn new(writer: BoxWriter) -> Self {
        Self { writer }
    }

    /// Send one command, CRLF-terminated.
    pub async fn send(&mut self, command: &DeviceCommand) -> AppResult<()> {
        trace!(command = %command, "Sending device command");
        self.writer.write_all(&command.to_wire()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write half down.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// What a consumer delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Length-delimited protobuf messages
    Binary,
    /// Text, one chunk per idle-terminated response
    Text,
    /// Bytes, one chunk per idle-terminated response
    Raw,
}

/// Item delivered from a consumer to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded protobuf message
    Message(DeviceMessage),
    /// A text response
    Text(String),
    /// A binary response
    Raw(Vec<u8>),
    /// The transport reached end of stream or failed
    Closed,
}

/// A running consumer task.
pub struct ConsumerHandle {
    kind: ConsumerKind,
    cancel: CancellationToken,
    task: JoinHandle<BoxReader>,
}

impl ConsumerHandle {
    /// What this consumer delivers.
    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    /// Stop the consumer and take the read half back.
    pub async fn stop(self) -> AppResult<BoxReader> {
        self.cancel.cancel();
        Ok(self.task.await?)
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Start a consumer of `kind` reading from `reader`.
///
/// `idle` is the silence that terminates a text or raw response; the binary
/// consumer ignores it.
pub fn spawn_consumer(
    kind: ConsumerKind,
    reader: BoxReader,
    tx: mpsc::Sender<Inbound>,
    idle: Duration,
) -> ConsumerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        match kind {
            ConsumerKind::Binary => run_binary(reader, tx, token).await,
            ConsumerKind::Text | ConsumerKind::Raw => {
                run_chunked(kind, reader, tx, idle, token).await
            }
        }
    });
    debug!(?kind, "Attached consumer");
    ConsumerHandle { kind, cancel, task }
}

/// Forward one item unless cancelled first. Returns false when the consumer
/// should exit.
async fn forward(tx: &mpsc::Sender<Inbound>, cancel: &CancellationToken, item: Inbound) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn run_binary(
    reader: BoxReader,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> BoxReader {
    let mut frames = FramedRead::new(reader, DeviceMessageCodec::default());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(Decoded::Message(msg))) => {
                if !forward(&tx, &cancel, Inbound::Message(msg)).await {
                    break;
                }
            }
            Some(Ok(Decoded::Malformed(reason))) => {
                warn!(%reason, "Dropping undecodable device message");
            }
            Some(Err(e)) => {
                warn!(error = %e, "Transport read failed");
                forward(&tx, &cancel, Inbound::Closed).await;
                break;
            }
            None => {
                debug!("Transport closed");
                forward(&tx, &cancel, Inbound::Closed).await;
                break;
            }
        }
    }
    frames.into_inner()
}

async fn run_chunked(
    kind: ConsumerKind,
    mut reader: BoxReader,
    tx: mpsc::Sender<Inbound>,
    idle: Duration,
    cancel: CancellationToken,
) -> BoxReader {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 4096];

    let chunk = |bytes: Vec<u8>| match kind {
        ConsumerKind::Text => Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()),
        _ => Inbound::Raw(bytes),
    };

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(idle, reader.read(&mut buf)) => read,
        };
        match read {
            Ok(Ok(n)) if n > 0 => {
                pending.extend_from_slice(&buf[..n]);
                continue;
            }
            Err(_) => {
                if !pending.is_empty() {
                    trace!(bytes = pending.len(), ?kind, "Response complete");
                    let item = chunk(std::mem::take(&mut pending));
                    if !forward(&tx, &cancel, item).await {
                        break;
                    }
                }
                continue;
            }
            Ok(Ok(_)) => debug!("Transport closed"),
            Ok(Err(e)) => warn!(error = %e, "Transport read failed"),
        }

        if !pending.is_empty() {
            let item = chunk(std::mem::take(&mut pending));
            forward(&tx, &cancel, item).await;
        }
        forward(&tx, &cancel, Inbound::Closed).await;
        break;
    }
    reader
}

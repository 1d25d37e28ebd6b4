//! Async DAP client: sequence allocation, request/response correlation, and
//! event fan-out over any byte transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use fathom_core::DebugError;

use crate::codec::{encode, FrameDecoder};

const EVENT_CHANNEL_SIZE: usize = 256;
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("Connection closed")]
    ConnectionClosed,

    /// The adapter answered with `success: false`; carries the adapter's
    /// message or a synthetic `Request failed: <command>`.
    #[error("{0}")]
    Request(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<DapError> for DebugError {
    fn from(err: DapError) -> Self {
        match err {
            DapError::ConnectionClosed => DebugError::ConnectionClosed,
            DapError::Request(message) => DebugError::Protocol(message),
            DapError::Io(err) => DebugError::Io(err),
        }
    }
}

/// An adapter-initiated notification, dispatched by event name.
#[derive(Debug, Clone)]
pub struct DapEvent {
    pub event: String,
    pub body: Value,
}

struct Inner {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, DapError>>>>,
    next_seq: AtomicI64,
    events: broadcast::Sender<DapEvent>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to one DAP connection.
#[derive(Clone)]
pub struct DapClient {
    inner: Arc<Inner>,
}

impl DapClient {
    /// Wrap an established transport. Spawns the read loop immediately, so
    /// events arriving right after the handshake are not lost.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::new(Inner {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(1),
            events,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(read_loop(reader, inner.clone()));
        Self { inner }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, DapError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DapEvent> {
        self.inner.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the connection is shut down, explicitly or because the
    /// transport closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Send one request and wait for its correlated response. Resolves with
    /// the response `body` on success; a `success: false` response fails with
    /// the adapter's message.
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<Value, DapError> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(seq, tx);
        }

        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });

        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            async {
                writer.write_all(&encode(&message)).await?;
                writer.flush().await
            }
            .await
        };
        if let Err(err) = write_result {
            self.remove_pending(seq).await;
            return Err(err.into());
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(seq).await;
                Err(DapError::ConnectionClosed)
            }
            response = rx => match response {
                Ok(result) => result,
                Err(_) => Err(DapError::ConnectionClosed),
            }
        }
    }

    async fn remove_pending(&self, seq: i64) {
        self.inner.pending.lock().await.remove(&seq);
    }
}

async fn read_loop(mut reader: impl AsyncRead + Send + Unpin, inner: Arc<Inner>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for message in decoder.feed(&chunk[..n]) {
            dispatch(&inner, message).await;
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_seq, tx) in pending {
        let _ = tx.send(Err(DapError::ConnectionClosed));
    }
}

async fn dispatch(inner: &Inner, message: Value) {
    match message.get("type").and_then(Value::as_str) {
        Some("response") => {
            let Some(request_seq) = message.get("request_seq").and_then(Value::as_i64) else {
                return;
            };
            let tx = {
                let mut pending = inner.pending.lock().await;
                pending.remove(&request_seq)
            };
            let Some(tx) = tx else {
                return;
            };

            if message.get("success").and_then(Value::as_bool).unwrap_or(false) {
                let body = message.get("body").cloned().unwrap_or(Value::Null);
                let _ = tx.send(Ok(body));
            } else {
                let reason = message
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        let command = message
                            .get("command")
                            .and_then(Value::as_str)
                            .unwrap_or("request");
                        format!("Request failed: {command}")
                    });
                let _ = tx.send(Err(DapError::Request(reason)));
            }
        }
        Some("event") => {
            let Some(event) = message.get("event").and_then(Value::as_str) else {
                return;
            };
            let body = message.get("body").cloned().unwrap_or(Value::Null);
            let _ = inner.events.send(DapEvent {
                event: event.to_string(),
                body,
            });
        }
        _ => {}
    }
}

//! Async CDP client: id allocation, request/response correlation, and event
//! fan-out over a WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use fathom_core::DebugError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("Connection closed")]
    ConnectionClosed,

    /// The inspector answered with an `error` object.
    #[error("{0}")]
    Command(String),

    #[error("{0}")]
    Transport(String),
}

impl From<CdpError> for DebugError {
    fn from(err: CdpError) -> Self {
        match err {
            CdpError::ConnectionClosed => DebugError::ConnectionClosed,
            CdpError::Command(message) => DebugError::Protocol(message),
            CdpError::Transport(message) => DebugError::Transport(message),
        }
    }
}

/// An inspector-initiated notification, dispatched by method name.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

struct Inner {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, CdpError>>>>,
    next_id: AtomicI64,
    events: broadcast::Sender<CdpEvent>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to one inspector connection.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<Inner>,
}

impl CdpClient {
    pub async fn connect(url: &str) -> Result<Self, CdpError> {
        let (socket, _response) = connect_async(url).await.map_err(|err| {
            CdpError::Transport(format!("failed to open WebSocket to {url}: {err}"))
        })?;
        Ok(Self::new(socket))
    }

    /// Wrap an established WebSocket. Spawns the read loop immediately.
    pub fn new(socket: WsStream) -> Self {
        let (sink, stream) = socket.split();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            events,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(read_loop(stream, inner.clone()));
        Self { inner }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the connection is shut down, explicitly or because the
    /// socket closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Send one command and wait for its correlated result. An `error`
    /// response fails with the inspector's message.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let message = json!({ "id": id, "method": method, "params": params }).to_string();
        let sent = {
            let mut sink = self.inner.sink.lock().await;
            sink.send(Message::Text(message)).await
        };
        if let Err(err) = sent {
            self.inner.pending.lock().await.remove(&id);
            return Err(CdpError::Transport(format!("failed to send {method}: {err}")));
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.inner.pending.lock().await.remove(&id);
                Err(CdpError::ConnectionClosed)
            }
            response = rx => match response {
                Ok(result) => result,
                Err(_) => Err(CdpError::ConnectionClosed),
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, inner: Arc<Inner>) {
    loop {
        let message = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => dispatch(&inner, value).await,
                Err(err) => tracing::debug!("discarding malformed CDP frame: {err}"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!("CDP socket error: {err}");
                break;
            }
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(CdpError::ConnectionClosed));
    }
}

async fn dispatch(inner: &Inner, message: Value) {
    if let Some(id) = message.get("id").and_then(Value::as_i64) {
        let tx = {
            let mut pending = inner.pending.lock().await;
            pending.remove(&id)
        };
        let Some(tx) = tx else {
            return;
        };

        if let Some(error) = message.get("error") {
            let reason = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string();
            let _ = tx.send(Err(CdpError::Command(reason)));
        } else {
            let result = message.get("result").cloned().unwrap_or(Value::Null);
            let _ = tx.send(Ok(result));
        }
    } else if let Some(method) = message.get("method").and_then(Value::as_str) {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let _ = inner.events.send(CdpEvent {
            method: method.to_string(),
            params,
        });
    }
}

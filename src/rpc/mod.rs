//! JSON-RPC 2.0 over WebSocket — the transport shared by the data service,
//! the analyzers, and the bblfsh parser.
//!
//! Unary calls are plain request/response. Server-streaming calls interleave
//! `rpc.item` notifications (`{id, item}`) before the final response closes
//! the stream; the client aborts a stream early with an `rpc.cancel`
//! notification carrying the request id, which cancels the server-side
//! request token.

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ─── Status codes ────────────────────────────────────────────────────────────
//
// Standard JSON-RPC codes for protocol-level failures; the -32000 range for
// request outcomes the orchestrator dispatches on.

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Malformed revision, regex, or request payload.
pub const INVALID_ARGUMENT: i32 = -32602;
/// Upstream scanner or handler failure.
pub const INTERNAL: i32 = -32603;
/// Unknown commit or reference.
pub const NOT_FOUND: i32 = -32004;
/// The client cancelled the request.
pub const CANCELED: i32 = -32005;
/// The per-call deadline expired before the peer replied.
pub const DEADLINE_EXCEEDED: i32 = -32006;
/// The peer is unreachable or the connection dropped mid-call.
pub const UNAVAILABLE: i32 = -32007;

/// The typed error crossing the RPC seam. Callers dispatch on `code` (the
/// orchestrator maps `DEADLINE_EXCEEDED` to a config hint), so errors
/// must not be flattened to strings before reaching them.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(INVALID_ARGUMENT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(CANCELED, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(DEADLINE_EXCEEDED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(UNAVAILABLE, message)
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

fn success_response(id: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn error_response(id: &Value, code: i32, message: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string()
}

// ─── Service contract ────────────────────────────────────────────────────────

/// Handle for emitting stream items from inside a handler. Unary methods
/// simply never touch it.
#[derive(Clone)]
pub struct StreamSender {
    id: Value,
    tx: mpsc::Sender<Message>,
}

impl StreamSender {
    pub fn new(id: Value, tx: mpsc::Sender<Message>) -> Self {
        Self { id, tx }
    }

    /// Send one stream item to the peer. Fails when the connection is gone;
    /// the handler must stop sending after the first failure.
    pub async fn send_item<T: Serialize>(&self, item: &T) -> Result<(), RpcError> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "rpc.item",
            "params": {"id": self.id, "item": item},
        });
        self.tx
            .send(Message::Text(notification.to_string()))
            .await
            .map_err(|_| RpcError::unavailable("stream receiver is gone"))
    }
}

/// One RPC service: the data server, an analyzer, or the parser. The token is
/// per-request; it fires on `rpc.cancel` or when the connection drops.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: Value,
        stream: &StreamSender,
        token: &CancellationToken,
    ) -> Result<Value, RpcError>;
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Accept-loop serving `service` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new rpc connection");
                let service = service.clone();
                let conn_shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service, conn_shutdown).await {
                        debug!(peer = %peer, err = %e, "connection closed with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut reader) = ws.split();

    // All outgoing traffic (responses and stream items from concurrently
    // running handlers) funnels through one writer task.
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // In-flight requests by id; `rpc.cancel` looks its target up here.
    let inflight: Arc<tokio::sync::Mutex<HashMap<String, CancellationToken>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    let conn_token = shutdown.child_token();

    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&text, &service, &tx, &inflight, &conn_token).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(err = %e, "ws read error");
                    break;
                }
                _ => {}
            },
        }
    }

    // Dropping the connection cancels everything still running on it.
    conn_token.cancel();
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn dispatch(
    text: &str,
    service: &Arc<dyn RpcService>,
    tx: &mpsc::Sender<Message>,
    inflight: &Arc<tokio::sync::Mutex<HashMap<String, CancellationToken>>>,
    conn_token: &CancellationToken,
) {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            let _ = tx
                .send(Message::Text(error_response(&Value::Null, PARSE_ERROR, "parse error")))
                .await;
            return;
        }
    };

    if req.jsonrpc != "2.0" {
        let id = req.id.unwrap_or(Value::Null);
        let _ = tx
            .send(Message::Text(error_response(&id, INVALID_REQUEST, "invalid request")))
            .await;
        return;
    }

    if req.method == "rpc.cancel" {
        let target = req
            .params
            .as_ref()
            .and_then(|p| p.get("id"))
            .map(|id| id.to_string());
        if let Some(key) = target {
            if let Some(token) = inflight.lock().await.get(&key) {
                token.cancel();
            }
        }
        return;
    }

    // Notifications other than rpc.cancel are not part of the protocol.
    let Some(id) = req.id else {
        debug!(method = %req.method, "ignoring unknown notification");
        return;
    };

    let token = conn_token.child_token();
    let key = id.to_string();
    inflight.lock().await.insert(key.clone(), token.clone());

    let service = service.clone();
    let tx = tx.clone();
    let inflight = inflight.clone();
    let params = req.params.unwrap_or(Value::Null);
    let method = req.method;
    tokio::spawn(async move {
        let stream = StreamSender::new(id.clone(), tx.clone());
        let response = match service.call(&method, params, &stream, &token).await {
            Ok(result) => success_response(&id, result),
            Err(e) => error_response(&id, e.code, &e.message),
        };
        inflight.lock().await.remove(&key);
        let _ = tx.send(Message::Text(response)).await;
    });
}

//! Client side of the JSON-RPC WebSocket transport. One `RpcClient` holds a
//! long-lived connection; calls multiplex over it by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::RpcError;
use crate::scanner::Scanner;

struct Pending {
    resp: oneshot::Sender<Result<Value, RpcError>>,
    /// Set for streaming calls; `rpc.item` payloads are forwarded here.
    items: Option<mpsc::Sender<Value>>,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// A live connection to one RPC peer (analyzer, data server, or parser).
#[derive(Clone)]
pub struct RpcClient {
    tx: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

fn ws_url(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    }
}

impl RpcClient {
    /// Connect to `addr` (`host:port` or a full `ws://` URL) and start the
    /// background read loop.
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let url = ws_url(addr);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RpcError::unavailable(format!("can't connect to '{url}': {e}")))?;
        let (mut sink, mut reader) = ws.split();

        let (tx, mut rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routes = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => route_message(&routes, &text).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            // Connection gone: fail whatever is still waiting.
            let mut map = routes.lock().await;
            for (_, call) in map.drain() {
                let _ = call
                    .resp
                    .send(Err(RpcError::unavailable("connection closed")));
            }
        });

        Ok(Self {
            tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Unary request/response. Deadlines are the caller's concern: wrap the
    /// returned future in `tokio::time::timeout` where one applies.
    pub async fn call<P: Serialize>(&self, method: &str, params: &P) -> Result<Value, RpcError> {
        let (_id, rx) = self.send_request(method, params, None).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::unavailable("connection closed")),
        }
    }

    /// Server-streaming request; the returned scanner yields each `rpc.item`
    /// payload and surfaces the final response's error, if any.
    pub async fn call_streaming<P: Serialize, T>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<RpcScanner<T>, RpcError>
    where
        T: DeserializeOwned + Default + Send,
    {
        let (items_tx, items_rx) = mpsc::channel(32);
        let (id, resp_rx) = self.send_request(method, params, Some(items_tx)).await?;
        Ok(RpcScanner {
            id,
            writer: self.tx.clone(),
            items: items_rx,
            resp: Some(resp_rx),
            current: None,
            err: None,
            done: false,
        })
    }

    async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        items: Option<mpsc::Sender<Value>>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)
                .map_err(|e| RpcError::internal(format!("can't encode params: {e}")))?,
        });

        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id.to_string(), Pending { resp: resp_tx, items });

        if self
            .tx
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id.to_string());
            return Err(RpcError::unavailable("connection closed"));
        }

        Ok((id, resp_rx))
    }
}

async fn route_message(pending: &PendingMap, text: &str) {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(err = %e, "unparseable message from peer");
            return;
        }
    };

    // Stream item notification: {"method":"rpc.item","params":{"id":…,"item":…}}
    if msg.get("method").and_then(Value::as_str) == Some("rpc.item") {
        let Some(params) = msg.get("params") else { return };
        let Some(id) = params.get("id") else { return };
        let item = params.get("item").cloned().unwrap_or(Value::Null);
        let sender = {
            let map = pending.lock().await;
            map.get(&id.to_string())
                .and_then(|call| call.items.clone())
        };
        if let Some(tx) = sender {
            let _ = tx.send(item).await;
        }
        return;
    }

    // Final response: routes by id and retires the call.
    let Some(id) = msg.get("id") else { return };
    let Some(call) = pending.lock().await.remove(&id.to_string()) else {
        return;
    };
    let result = if let Some(error) = msg.get("error") {
        Err(serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| {
            RpcError::internal(format!("malformed error object: {error}"))
        }))
    } else {
        Ok(msg.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = call.resp.send(result);
}

// ─── Client-side stream scanner ──────────────────────────────────────────────

/// Scanner over a server-streaming call. Items arrive as they are produced;
/// the final response resolves after the last item and carries the stream's
/// termination status.
pub struct RpcScanner<T> {
    id: u64,
    writer: mpsc::Sender<Message>,
    items: mpsc::Receiver<Value>,
    resp: Option<oneshot::Receiver<Result<Value, RpcError>>>,
    current: Option<T>,
    err: Option<Error>,
    done: bool,
}

#[async_trait]
impl<T> Scanner for RpcScanner<T>
where
    T: DeserializeOwned + Default + Send,
{
    type Item = T;

    async fn next(&mut self) -> bool {
        if self.done {
            return false;
        }
        match self.items.recv().await {
            Some(value) => match serde_json::from_value::<T>(value) {
                Ok(item) => {
                    self.current = Some(item);
                    true
                }
                Err(e) => {
                    self.err = Some(Error::new(e).context("can't decode stream item"));
                    self.done = true;
                    false
                }
            },
            None => {
                self.done = true;
                if let Some(rx) = self.resp.take() {
                    match rx.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(rpc)) => self.err = Some(Error::new(rpc)),
                        Err(_) => {
                            self.err =
                                Some(RpcError::unavailable("connection closed mid-stream").into())
                        }
                    }
                }
                false
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn item(&mut self) -> T {
        self.current.take().unwrap_or_default()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.done {
            // Abort the stream server-side; best-effort.
            let cancel = json!({
                "jsonrpc": "2.0",
                "method": "rpc.cancel",
                "params": {"id": self.id},
            });
            let _ = self.writer.try_send(Message::Text(cancel.to_string()));
            self.done = true;
        }
        Ok(())
    }
}

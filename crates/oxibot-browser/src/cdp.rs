//! Raw Chrome DevTools Protocol transport.
//!
//! Speaks the CDP websocket wire format directly: `{id, method, params,
//! sessionId?}` requests, correlated to `{id, result|error}` responses by
//! `id`. Unsolicited `{method, params}` events (console API calls, target
//! lifecycle, …) are routed to a broadcast channel for interested callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::BrowserError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const CALL_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An unsolicited CDP event: `{method, params, sessionId?}`.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "sessionId")]
    session_id: Option<&'a str>,
}

struct Pending {
    tx: oneshot::Sender<Result<Value, String>>,
}

/// A live connection to a browser's `webSocketDebuggerUrl`.
///
/// One client per browser-level websocket; CDP "sessions" (one per tab,
/// obtained via `Target.attachToTarget`) are threaded through as a
/// `session_id` string on each call rather than as separate connections,
/// matching the reference client's flattened-session approach.
pub struct CdpClient {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    write_tx: tokio::sync::mpsc::UnboundedSender<WsMessage>,
    events_tx: broadcast::Sender<CdpEvent>,
}

impl CdpClient {
    /// Connect to a browser's websocket debugger URL (obtained from
    /// `GET http://host:port/json/version`).
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>, BrowserError> {
        let (ws, _) = connect_async(ws_url)
            .await
            .map_err(|e| BrowserError::ConnectFailed {
                endpoint: ws_url.to_string(),
                source: anyhow::anyhow!(e),
            })?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (write_tx, mut write_rx) = tokio::sync::mpsc::unbounded_channel::<WsMessage>();

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            write_tx,
            events_tx,
        });

        let (mut sink, mut stream) = ws.split();

        // Writer task: serializes outbound frames onto the websocket.
        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: demultiplexes responses (by `id`) from events.
        let reader_client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(t)) => t.to_string(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    warn!("received non-JSON CDP frame");
                    continue;
                };
                reader_client.dispatch_incoming(value).await;
            }
            debug!("CDP reader task exiting");
        });

        Ok(client)
    }

    async fn dispatch_incoming(&self, value: Value) {
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let mut pending = self.pending.lock().await;
            if let Some(p) = pending.remove(&id) {
                let result = if let Some(err) = value.get("error") {
                    Err(err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown CDP error")
                        .to_string())
                } else {
                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = p.tx.send(result);
            }
            return;
        }
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let event = CdpEvent {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
                session_id: value
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
            trace!(method = %event.method, "CDP event");
            let _ = self.events_tx.send(event);
        }
    }

    /// Subscribe to unsolicited CDP events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.events_tx.subscribe()
    }

    /// Send a CDP command and wait for its matching response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, Pending { tx });

        let request = CdpRequest {
            id,
            method,
            params,
            session_id,
        };
        let text = serde_json::to_string(&request).map_err(|e| BrowserError::Cdp {
            method: method.to_string(),
            message: format!("failed to encode request: {e}"),
        })?;

        if self.write_tx.send(WsMessage::Text(text.into())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BrowserError::Cdp {
                method: method.to_string(),
                message: "websocket writer task is gone".to_string(),
            });
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(BrowserError::Cdp {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(BrowserError::Cdp {
                method: method.to_string(),
                message: "response channel dropped".to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BrowserError::Timeout(format!("CDP call `{method}`")))
            }
        }
    }
}

/// Fetch the websocket debugger URL for the browser's default target
/// via the `/json/version` HTTP endpoint.
pub async fn fetch_debugger_url(host: &str, port: u16) -> Result<String, BrowserError> {
    let url = format!("http://{host}:{port}/json/version");
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| BrowserError::ConnectFailed {
            endpoint: url.clone(),
            source: anyhow::anyhow!(e),
        })?;
    let body: Value = resp
        .json()
        .await
        .map_err(|e| BrowserError::ConnectFailed {
            endpoint: url.clone(),
            source: anyhow::anyhow!(e),
        })?;
    body.get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BrowserError::ConnectFailed {
            endpoint: url,
            source: anyhow::anyhow!("response had no webSocketDebuggerUrl"),
        })
}

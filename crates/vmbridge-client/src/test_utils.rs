//! Test utilities for the VM Service client
//!
//! [`StubVmService`] is a minimal in-process Dart VM Service: a WebSocket
//! server on `127.0.0.1` that answers JSON-RPC requests through a pluggable
//! responder, records every request it sees, and can push stream events or
//! drop its connections on demand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use vmbridge_core::Endpoint;

/// Isolate id reported by the default `getVM` reply.
pub const STUB_ISOLATE_ID: &str = "isolates/1";

/// How the stub answers one request.
#[derive(Debug, Clone)]
pub enum StubReply {
    Result(Value),
    Error { code: i32, message: String },
    /// Swallow the request.
    NoReply,
    /// Answer with `result` after a delay, without blocking other requests.
    Delayed { after: Duration, result: Value },
}

/// Maps `(method, params)` to a reply.
pub type Responder = Arc<dyn Fn(&str, &Value) -> StubReply + Send + Sync>;

/// A request as seen by the stub.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// 1-based index of the WebSocket connection it arrived on.
    pub connection: usize,
    pub id: Value,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
enum StubControl {
    Frame(String),
    /// Drop every socket without a Close frame.
    Drop,
}

struct StubState {
    responder: RwLock<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
    connections: AtomicUsize,
    accepting: AtomicBool,
    control: broadcast::Sender<StubControl>,
}

/// In-process VM Service stand-in. Stops listening when dropped.
pub struct StubVmService {
    port: u16,
    state: Arc<StubState>,
    accept_task: JoinHandle<()>,
}

impl StubVmService {
    /// Start a stub with [`default_reply`] as its responder.
    pub async fn start() -> Self {
        Self::start_with(Arc::new(default_reply)).await
    }

    pub async fn start_with(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub VM Service");
        let port = listener.local_addr().expect("stub local addr").port();
        let (control, _) = broadcast::channel(64);

        let state = Arc::new(StubState {
            responder: RwLock::new(responder),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            control,
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if !accept_state.accepting.load(Ordering::SeqCst) {
                    drop(tcp);
                    continue;
                }
                tokio::spawn(serve_connection(tcp, Arc::clone(&accept_state)));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of completed WebSocket handshakes so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.state.responder.write().unwrap() = responder;
    }

    /// While `false`, new TCP connections are closed before the handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Send a `streamNotify` frame to every open connection.
    pub fn push_event(&self, stream_id: &str, event: Value) {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "streamNotify",
            "params": { "streamId": stream_id, "event": event }
        });
        let _ = self.state.control.send(StubControl::Frame(frame.to_string()));
    }

    /// Send an arbitrary text frame to every open connection.
    pub fn push_raw(&self, frame: &str) {
        let _ = self.state.control.send(StubControl::Frame(frame.to_string()));
    }

    /// Abruptly drop every open connection.
    pub fn drop_connections(&self) {
        let _ = self.state.control.send(StubControl::Drop);
    }
}

impl Drop for StubVmService {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.state.control.send(StubControl::Drop);
    }
}

/// Replies that look like a small Flutter app with one UI isolate.
///
/// Unknown methods get `-32601 Method not found`.
pub fn default_reply(method: &str, params: &Value) -> StubReply {
    match method {
        "getVM" => StubReply::Result(json!({
            "type": "VM",
            "name": "vm",
            "version": "3.5.0 (stable)",
            "isolates": [{
                "type": "@Isolate",
                "id": STUB_ISOLATE_ID,
                "name": "main",
                "number": "1",
                "isSystemIsolate": false
            }]
        })),
        "getIsolate" => StubReply::Result(json!({
            "type": "Isolate",
            "id": params.get("isolateId").cloned().unwrap_or(Value::Null),
            "name": "main",
            "number": "1",
            "runnable": true,
            "extensionRPCs": ["ext.flutter.debugPaint", "ext.flutter.reassemble"]
        })),
        "getMemoryUsage" => StubReply::Result(json!({
            "type": "MemoryUsage",
            "heapUsage": 52_428_800u64,
            "heapCapacity": 104_857_600u64,
            "externalUsage": 10_485_760u64
        })),
        "streamListen" | "streamCancel" => StubReply::Result(json!({ "type": "Success" })),
        m if m.starts_with("ext.") => StubReply::Result(json!({
            "type": "_extensionType",
            "method": m,
            "enabled": "true"
        })),
        _ => StubReply::Error {
            code: -32601,
            message: "Method not found".to_string(),
        },
    }
}

/// A port nothing listens on.
pub async fn dead_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway port");
    let port = listener.local_addr().expect("throwaway local addr").port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

async fn serve_connection(tcp: TcpStream, state: Arc<StubState>) {
    let Ok(ws) = accept_async(tcp).await else {
        return;
    };
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut control = state.control.subscribe();
    let (mut sink, mut stream) = ws.split();
    let (delayed_tx, mut delayed_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = handle_request(text.as_str(), connection, &state, &delayed_tx) {
                        if sink.send(WsMessage::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },

            Some(reply) = delayed_rx.recv() => {
                if sink.send(WsMessage::Text(reply.into())).await.is_err() {
                    break;
                }
            }

            control_msg = control.recv() => match control_msg {
                Ok(StubControl::Frame(frame)) => {
                    if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(StubControl::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Record a request and build its immediate reply, if any.
fn handle_request(
    text: &str,
    connection: usize,
    state: &StubState,
    delayed_tx: &mpsc::UnboundedSender<String>,
) -> Option<String> {
    let request: Value = serde_json::from_str(text).ok()?;
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    state.requests.lock().unwrap().push(RecordedRequest {
        connection,
        id: id.clone(),
        method: method.clone(),
        params: params.clone(),
    });

    let responder = Arc::clone(&state.responder.read().unwrap());
    match responder(&method, &params) {
        StubReply::Result(result) => {
            Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string())
        }
        StubReply::Error { code, message } => Some(
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            })
            .to_string(),
        ),
        StubReply::NoReply => None,
        StubReply::Delayed { after, result } => {
            let tx = delayed_tx.clone();
            let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(reply);
            });
            None
        }
    }
}

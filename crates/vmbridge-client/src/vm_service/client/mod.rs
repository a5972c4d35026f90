//! VM Service WebSocket client.
//!
//! [`VmServiceClient`] owns one logical connection to a Dart VM Service.
//! Each successful [`connect`](VmServiceClient::connect) spawns a background
//! I/O task that owns both halves of the socket. Callers talk to that task
//! over an mpsc command channel, and responses come back through the
//! [`VmRequestTracker`] as oneshot completions keyed by request id.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──opened──▶ Connected
//!      ▲                          │                      │
//!      │                     open failed            socket closed
//!      │                          ▼                      ▼
//!      └───────disconnect()──── Error ◀──transport error─┘
//! ```
//!
//! The client does not reconnect on its own. Unexpected closes are reported
//! through [`on_close`](VmServiceClient::on_close) observers; the connection
//! supervisor in `vmbridge-app` decides what happens next.
//!
//! Dropping the last clone of a client closes its command channel, which
//! makes the I/O task close the socket and exit.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use vmbridge_core::prelude::*;
use vmbridge_core::{ConnectionStatus, Endpoint};

use super::dispatcher::{EventDispatcher, EventHandler, ListenerId};
use super::protocol::{
    parse_vm_message, IsolateInfo, StreamNotification, VmInfo, VmRequestTracker,
    VmServiceMessage, VmServiceRequest,
};
use super::transport::{self, CloseReason, TransportSignal, TransportSink, TransportStream};


// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-call timeout for [`VmServiceClient::call`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the command channel between callers and the I/O task.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// How often the I/O task sweeps the pending map for abandoned entries.
const STALE_REQUEST_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Entries older than this are rejected by the sweep. Callers normally time
/// out long before; the sweep only catches entries nobody is waiting on.
const STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `disconnect()` waits for the I/O task before aborting it.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// `streamListen` on a stream that is already subscribed.
const STREAM_ALREADY_SUBSCRIBED: i32 = 103;

/// `streamCancel` on a stream that is not subscribed.
const STREAM_NOT_SUBSCRIBED: i32 = 104;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tunables for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connection state of a [`VmServiceClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connection attempt failed or the socket broke.
    Error,
}

impl ConnectionState {
    pub fn status(self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Error => ConnectionStatus::Error,
        }
    }
}

/// Observer invoked once per closed connection.
pub type CloseHandler = Arc<dyn Fn(&CloseReason) + Send + Sync>;

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

enum ClientCommand {
    /// Write a serialized request frame. `id` is the tracker entry it belongs to.
    Send { id: String, frame: String },
    Shutdown,
}

/// Handle on the I/O task of the current connection.
struct Link {
    generation: u64,
    cmd_tx: mpsc::Sender<ClientCommand>,
    task: JoinHandle<()>,
}

/// `None` while the attempt runs; `Some(Err(reason))` if it failed.
type ConnectOutcome = Option<std::result::Result<(), String>>;

/// State shared between the client handles and the I/O task.
///
/// The I/O task only ever holds this, never [`ClientInner`], so that dropping
/// every client handle drops the command sender.
struct Shared {
    state: RwLock<ConnectionState>,
    tracker: Mutex<VmRequestTracker>,
    dispatcher: RwLock<EventDispatcher>,
    close_observers: Mutex<Vec<CloseHandler>>,
    /// Highest generation whose close has been processed.
    finished_generation: AtomicU64,
    main_isolate: Mutex<Option<String>>,
}

struct ClientInner {
    endpoint: Endpoint,
    options: ClientOptions,
    link: Mutex<Option<Link>>,
    connect_gate: Mutex<Option<watch::Receiver<ConnectOutcome>>>,
    next_generation: AtomicU64,
    shared: Arc<Shared>,
}

enum ConnectRole {
    Leader(watch::Sender<ConnectOutcome>),
    Follower(watch::Receiver<ConnectOutcome>),
}

/// Resets the state if the leading `connect()` future is dropped mid-attempt.
struct ConnectGuard<'a> {
    inner: &'a ClientInner,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner
            .connect_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut state = self
            .inner
            .shared
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }
}

// ---------------------------------------------------------------------------
// VmServiceClient
// ---------------------------------------------------------------------------

/// Client for one Dart VM Service endpoint.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct VmServiceClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for VmServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmServiceClient")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl VmServiceClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, ClientOptions::default())
    }

    pub fn with_options(endpoint: Endpoint, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                options,
                link: Mutex::new(None),
                connect_gate: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                shared: Arc::new(Shared {
                    state: RwLock::new(ConnectionState::Disconnected),
                    tracker: Mutex::new(VmRequestTracker::new()),
                    dispatcher: RwLock::new(EventDispatcher::new()),
                    close_observers: Mutex::new(Vec::new()),
                    finished_generation: AtomicU64::new(0),
                    main_isolate: Mutex::new(None),
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> ClientOptions {
        self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .shared
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending_count()
    }

    // ── Connection management ────────────────────────────────────────────

    /// Open the WebSocket and start the I/O task.
    ///
    /// Resolves once the handshake has completed. If another `connect()` is
    /// already in flight this call waits for it and returns its outcome, so
    /// at most one socket is opened.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConnected`] if the client is connected.
    /// - [`Error::ConnectFailed`] if the handshake fails or times out.
    pub async fn connect(&self) -> Result<()> {
        let role = {
            let mut gate = self
                .inner
                .connect_gate
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match (self.state(), gate.as_ref()) {
                (ConnectionState::Connected, _) => return Err(Error::AlreadyConnected),
                (ConnectionState::Connecting, Some(rx)) => ConnectRole::Follower(rx.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *gate = Some(rx);
                    self.inner.shared.set_state(ConnectionState::Connecting);
                    ConnectRole::Leader(tx)
                }
            }
        };

        match role {
            ConnectRole::Follower(rx) => self.join_connect(rx).await,
            ConnectRole::Leader(tx) => {
                let mut guard = ConnectGuard {
                    inner: &self.inner,
                    armed: true,
                };
                let result = self.establish().await;
                guard.armed = false;

                self.inner
                    .connect_gate
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                let outcome = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(Some(outcome));
                result
            }
        }
    }

    async fn join_connect(&self, mut rx: watch::Receiver<ConnectOutcome>) -> Result<()> {
        debug!(
            "VM Service: joining in-flight connect to {}",
            self.inner.endpoint
        );
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => Some(Err("connection attempt abandoned".to_string())),
        };
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(Error::connect_failed(self.inner.endpoint.ws_uri(), reason)),
            None => Err(Error::NotConnected),
        }
    }

    async fn establish(&self) -> Result<()> {
        let shared = &self.inner.shared;
        let uri = self.inner.endpoint.ws_uri();
        info!("VM Service: connecting to {}", uri);

        let (sink, stream) = match transport::open(&uri, self.inner.options.connect_timeout).await {
            Ok(halves) => halves,
            Err(e) => {
                warn!("VM Service: connect to {} failed: {}", uri, e);
                shared.set_state(ConnectionState::Error);
                return Err(e);
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);

        // A new socket may be talking to a restarted VM.
        shared
            .main_isolate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut link = self.inner.link.lock().unwrap_or_else(|e| e.into_inner());
        shared.set_state(ConnectionState::Connected);
        let task = tokio::spawn(run_io_loop(
            Arc::clone(shared),
            generation,
            sink,
            stream,
            cmd_rx,
        ));
        *link = Some(Link {
            generation,
            cmd_tx,
            task,
        });

        info!("VM Service: connected to {} (generation {})", uri, generation);
        Ok(())
    }

    /// Close the connection and wait for the I/O task to finish.
    ///
    /// Every pending request is rejected with [`Error::ConnectionClosed`]
    /// before this returns. Safe to call in any state and more than once.
    pub async fn disconnect(&self) {
        let link = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(Link {
            generation,
            cmd_tx,
            mut task,
        }) = link
        else {
            if self.state() == ConnectionState::Error {
                self.inner.shared.set_state(ConnectionState::Disconnected);
            }
            return;
        };

        debug!("VM Service: disconnecting from {}", self.inner.endpoint);
        let graceful = tokio::time::timeout(DISCONNECT_GRACE, async {
            let _ = cmd_tx.send(ClientCommand::Shutdown).await;
            let _ = (&mut task).await;
        })
        .await;

        if graceful.is_err() {
            warn!(
                "VM Service: I/O task did not stop within {:?}, aborting",
                DISCONNECT_GRACE
            );
            task.abort();
        }

        // No-op when the task already finished this generation.
        self.inner
            .shared
            .finish_connection(generation, &CloseReason::Requested);
        self.inner.shared.set_state(ConnectionState::Disconnected);
    }

    // ── Requests ─────────────────────────────────────────────────────────

    /// Send a JSON-RPC request using the default request timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_timeout(method, params, self.inner.options.request_timeout)
            .await
    }

    /// Send a JSON-RPC request and wait at most `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the client is not connected.
    /// - [`Error::Timeout`] if no response arrives within `timeout`.
    /// - [`Error::RemoteError`] if the VM answers with an error object.
    /// - [`Error::ConnectionClosed`] if the socket closes first.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let cmd_tx = self.command_sender()?;
        let shared = &self.inner.shared;

        let (id, rx) = shared
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(method);

        let frame = match serde_json::to_string(&VmServiceRequest::new(id.clone(), method, params))
        {
            Ok(frame) => frame,
            Err(e) => {
                shared.expire(&id);
                return Err(e.into());
            }
        };

        trace!("VM Service: -> {} ({})", method, id);
        let exchange = async {
            cmd_tx
                .send(ClientCommand::Send {
                    id: id.clone(),
                    frame,
                })
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            rx.await.map_err(|_| Error::ConnectionClosed)?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Err(Error::ConnectionClosed)) => {
                shared.expire(&id);
                Err(Error::ConnectionClosed)
            }
            Ok(outcome) => outcome,
            Err(_) => {
                shared.expire(&id);
                debug!("VM Service: {} ({}) timed out after {:?}", method, id, timeout);
                Err(Error::timeout(method, timeout))
            }
        }
    }

    fn command_sender(&self) -> Result<mpsc::Sender<ClientCommand>> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.cmd_tx.clone())
            .ok_or(Error::NotConnected)
    }

    // ── Streams ──────────────────────────────────────────────────────────

    /// Subscribe to `stream_id` on the current connection.
    ///
    /// The stream is recorded as active only after the VM acknowledges it.
    /// A VM that reports the stream as already subscribed counts as success.
    pub async fn stream_listen(&self, stream_id: &str) -> Result<()> {
        match self
            .call("streamListen", Some(json!({ "streamId": stream_id })))
            .await
        {
            Ok(_) => {}
            Err(Error::RemoteError {
                code: STREAM_ALREADY_SUBSCRIBED,
                ..
            }) => debug!("VM Service: stream {} already subscribed", stream_id),
            Err(e) => return Err(e),
        }
        self.inner
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .mark_active(stream_id);
        debug!("VM Service: subscribed to {}", stream_id);
        Ok(())
    }

    /// Unsubscribe from `stream_id`. Listeners stay registered.
    pub async fn stream_cancel(&self, stream_id: &str) -> Result<()> {
        match self
            .call("streamCancel", Some(json!({ "streamId": stream_id })))
            .await
        {
            Ok(_) | Err(Error::RemoteError {
                code: STREAM_NOT_SUBSCRIBED,
                ..
            }) => {}
            Err(e) => return Err(e),
        }
        self.inner
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .mark_inactive(stream_id);
        Ok(())
    }

    /// Streams subscribed on the live socket, in subscription order.
    pub fn active_streams(&self) -> Vec<String> {
        self.inner
            .shared
            .dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active_streams()
    }

    /// Register a handler for events on `stream_id`.
    ///
    /// Purely local: nothing is sent to the VM. Handlers survive reconnects
    /// and run on the I/O task in registration order.
    pub fn on_event<F>(&self, stream_id: &str, handler: F) -> ListenerId
    where
        F: Fn(&StreamNotification) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.inner
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_listener(stream_id, handler)
    }

    /// Forward events on `stream_id` into an unbounded channel.
    pub fn event_channel(
        &self,
        stream_id: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<StreamNotification>) {
        self.inner
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add_channel(stream_id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner
            .shared
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_listener(id)
    }

    /// Register an observer for connection closes.
    ///
    /// Called once per connection with the reason, after pending requests
    /// have been rejected and the state has been updated.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&CloseReason) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .close_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    // ── Typed wrappers ───────────────────────────────────────────────────

    pub async fn get_vm(&self) -> Result<VmInfo> {
        let result = self.call("getVM", None).await?;
        serde_json::from_value(result).map_err(|e| Error::protocol(format!("bad getVM response: {e}")))
    }

    pub async fn get_isolate(&self, isolate_id: &str) -> Result<IsolateInfo> {
        let result = self
            .call("getIsolate", Some(json!({ "isolateId": isolate_id })))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::protocol(format!("bad getIsolate response: {e}")))
    }

    /// ID of the main (first non-system) isolate.
    ///
    /// Cached per connection; a new connection always asks the VM again.
    ///
    /// # Errors
    ///
    /// [`Error::NoIsolate`] if the VM reports no non-system isolate.
    pub async fn main_isolate_id(&self) -> Result<String> {
        if let Some(id) = self
            .inner
            .shared
            .main_isolate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(id);
        }

        let vm = self.get_vm().await?;
        let isolate = vm.main_isolate().ok_or(Error::NoIsolate)?;
        debug!("VM Service: main isolate is {} ({})", isolate.id, isolate.name);

        let id = isolate.id.clone();
        *self
            .inner
            .shared
            .main_isolate
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id.clone());
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Shared state helpers
// ---------------------------------------------------------------------------

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn expire(&self, id: &str) {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .expire(id);
    }

    /// Route one inbound text frame.
    fn route_frame(&self, text: &str) {
        match parse_vm_message(text) {
            VmServiceMessage::Response(response) => match response.id.clone() {
                Some(id) => {
                    let routed = self
                        .tracker
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .complete(&id, response);
                    if !routed {
                        debug!("VM Service: dropping response for unknown request {}", id);
                    }
                }
                None => debug!("VM Service: dropping response without id"),
            },
            VmServiceMessage::Event(notification) => self.dispatch(&notification),
            VmServiceMessage::Unknown(raw) => {
                let preview: String = raw.chars().take(200).collect();
                debug!("VM Service: ignoring unrecognised frame: {}", preview);
            }
        }
    }

    /// Deliver one event to its stream's handlers.
    ///
    /// The handler list is snapshotted first so handlers may add or remove
    /// listeners. A panicking handler is logged and does not affect the rest.
    fn dispatch(&self, notification: &StreamNotification) {
        let handlers = self
            .dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .handlers_for(&notification.stream_id);

        if handlers.is_empty() {
            trace!(
                "VM Service: no listeners for {} event on {}",
                notification.event.kind,
                notification.stream_id
            );
            return;
        }

        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                error!(
                    "VM Service: listener on stream {} panicked",
                    notification.stream_id
                );
            }
        }
    }

    /// Tear down bookkeeping for `generation` exactly once.
    fn finish_connection(&self, generation: u64, reason: &CloseReason) {
        if self
            .finished_generation
            .fetch_max(generation, Ordering::SeqCst)
            >= generation
        {
            return;
        }

        let drained = self
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_all();
        let streams = self
            .dispatcher
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear_active();

        self.set_state(if reason.is_error() {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        });

        if reason.is_unexpected() {
            warn!(
                "VM Service: connection lost ({}); {} pending request(s) rejected, {} stream(s) dropped",
                reason,
                drained,
                streams.len()
            );
        } else {
            info!(
                "VM Service: connection closed; {} pending request(s) rejected",
                drained
            );
        }

        let observers = self
            .close_observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| observer(reason))).is_err() {
                error!("VM Service: close observer panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// I/O task
// ---------------------------------------------------------------------------

/// Own the socket for one connection until it closes.
///
/// Exits when the remote closes, a read or write fails, a `Shutdown` command
/// arrives, or every client handle has been dropped.
async fn run_io_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut sink: TransportSink,
    mut stream: TransportStream,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    let mut cleanup = tokio::time::interval(STALE_REQUEST_CLEANUP_INTERVAL);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    cleanup.tick().await;

    let reason = loop {
        tokio::select! {
            signal = stream.next_signal() => match signal {
                TransportSignal::Message(text) => shared.route_frame(&text),
                TransportSignal::Closed(reason) => break reason,
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCommand::Send { id, frame }) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("VM Service: failed to send request {}: {}", id, e);
                        break CloseReason::TransportError(e.to_string());
                    }
                }
                Some(ClientCommand::Shutdown) | None => break CloseReason::Requested,
            },

            _ = cleanup.tick() => {
                let stale = shared
                    .tracker
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .cleanup_stale(STALE_REQUEST_TIMEOUT);
                if !stale.is_empty() {
                    warn!("VM Service: expired {} stale request(s)", stale.len());
                }
            }
        }
    };

    // Refuse further commands, then reject whatever was queued but never written.
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let ClientCommand::Send { id, .. } = cmd {
            shared
                .tracker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reject(&id, Error::ConnectionClosed);
        }
    }

    sink.close().await;
    shared.finish_connection(generation, &reason);
}

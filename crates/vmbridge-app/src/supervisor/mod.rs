//! Connection supervision for one Flutter app.
//!
//! A [`Supervisor`] owns one [`VmServiceClient`] and keeps it useful: it
//! discovers the main isolate, subscribes the configured streams, polls
//! heap usage on a fixed interval, and reconnects when the socket drops.
//!
//! ```text
//! Idle ──start()──▶ Starting ──▶ Active ──close──▶ Reconnecting ──▶ Active
//!                      │                                 │
//!                      └── connect failed ───────────────┤
//!                                                        ▼
//!                                                    Exhausted
//! ```
//!
//! Each outage first asks the shared [`RecoveryGovernor`] for permission,
//! then retries with the [`ReconnectPolicy`] schedule. Everything the
//! supervisor observes is reported as [`SupervisorEvent`]s on an unbounded
//! channel.

mod backoff;

pub use backoff::{
    ReconnectPolicy, DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_RECONNECT_ATTEMPTS,
};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use vmbridge_client::{ClientOptions, CloseReason, StreamNotification, VmServiceClient};
use vmbridge_core::prelude::*;
use vmbridge_core::{ConnectionStatus, Endpoint, MemoryUsage};

use crate::config::{DEFAULT_STREAMS, POLL_INTERVAL_MIN_MS};
use crate::governor::RecoveryGovernor;

/// How long `stop()` waits for the run task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Default heap poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive timed-out heap polls before the connection is treated as dead.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    pub client: ClientOptions,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    /// Streams subscribed on every (re)connect.
    pub streams: Vec<String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            reconnect: ReconnectPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            streams: DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Active,
    /// `attempt` is 0 while the governor is consulted, then 1-based.
    Reconnecting { attempt: u32 },
    /// Automatic recovery gave up. Only `start()` leaves this state.
    Exhausted,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Active => write!(f, "active"),
            SupervisorState::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            SupervisorState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Notifications from a running supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StatusChanged(ConnectionStatus),
    /// The main isolate was found and streams are subscribed.
    Ready { isolate_id: String },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Reconnected,
    /// Recovery gave up; a manual `start()` is required.
    Exhausted { target: String },
    Memory(MemoryUsage),
    Stream(StreamNotification),
}

/// Handle on the supervisor's background task.
struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Recovery {
    Recovered(String),
    Exhausted,
    Stopped,
}

enum ActiveExit {
    Closed(CloseReason),
    /// The socket is open but the VM stopped answering.
    Unresponsive,
    Stopped,
}

struct SupervisorInner {
    target: String,
    client: VmServiceClient,
    governor: Arc<RecoveryGovernor>,
    options: SupervisorOptions,
    state: Mutex<SupervisorState>,
    status: Mutex<ConnectionStatus>,
    /// Streams to subscribe on every connect, in order.
    streams: Mutex<Vec<String>>,
    /// Streams already forwarded as `SupervisorEvent::Stream`.
    forwarded: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    closes: tokio::sync::Mutex<mpsc::UnboundedReceiver<CloseReason>>,
    run: Mutex<Option<RunHandle>>,
}

/// Keeps one VM Service connection alive.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Create an idle supervisor. Nothing happens until [`start`](Self::start).
    pub fn new(
        endpoint: Endpoint,
        governor: Arc<RecoveryGovernor>,
        options: SupervisorOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let target = endpoint.target_id();
        let client = VmServiceClient::with_options(endpoint, options.client);

        let (close_tx, close_rx) = mpsc::unbounded_channel();
        client.on_close(move |reason| {
            let _ = close_tx.send(reason.clone());
        });

        let (events, events_rx) = mpsc::unbounded_channel();
        let streams = dedup(&options.streams);

        let inner = Arc::new(SupervisorInner {
            target,
            client,
            governor,
            options,
            state: Mutex::new(SupervisorState::Idle),
            status: Mutex::new(ConnectionStatus::Disconnected),
            streams: Mutex::new(streams),
            forwarded: Mutex::new(HashSet::new()),
            events,
            closes: tokio::sync::Mutex::new(close_rx),
            run: Mutex::new(None),
        });

        (Self { inner }, events_rx)
    }

    /// Recovery-record key for this supervisor's target.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn client(&self) -> &VmServiceClient {
        &self.inner.client
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.state()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Streams re-subscribed after every reconnect.
    pub fn streams(&self) -> Vec<String> {
        self.inner.streams()
    }

    /// Connect, discover the main isolate and subscribe streams.
    ///
    /// Returns once the supervisor is [`Active`](SupervisorState::Active).
    /// A failed connect does not fail `start()`; it goes through the same
    /// recovery path as a dropped connection. Starting from `Exhausted`
    /// clears the target's recovery history.
    ///
    /// # Errors
    ///
    /// - [`Error::NoIsolate`] if the VM has no debuggable isolate.
    /// - [`Error::RecoveryExhausted`] if recovery gave up before the first
    ///   successful connect.
    /// - [`Error::NotConnected`] if `stop()` was called meanwhile.
    pub async fn start(&self) -> Result<()> {
        let ready = {
            let mut run = self.inner.run.lock().unwrap_or_else(|e| e.into_inner());
            match self.inner.state() {
                SupervisorState::Active => return Ok(()),
                SupervisorState::Idle => {}
                SupervisorState::Exhausted => {
                    info!("Manual restart of {}; clearing recovery history", self.inner.target);
                    self.inner.governor.reset(&self.inner.target);
                }
                other => {
                    return Err(Error::vm_service(format!(
                        "supervisor for {} is already {}",
                        self.inner.target, other
                    )))
                }
            }

            if let Some(previous) = run.take() {
                previous.task.abort();
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            self.inner.set_state(SupervisorState::Starting);
            let task = tokio::spawn(Arc::clone(&self.inner).run(shutdown_rx, ready_tx));
            *run = Some(RunHandle {
                shutdown: shutdown_tx,
                task,
            });
            ready_rx
        };

        ready.await.unwrap_or(Err(Error::NotConnected))
    }

    /// Stop supervising and disconnect.
    ///
    /// Cancels any pending reconnect delay, the poll timer and an in-flight
    /// poll. Pending calls are rejected with [`Error::ConnectionClosed`].
    pub async fn stop(&self) {
        let run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(RunHandle { shutdown, mut task }) = run {
            let _ = shutdown.send(true);
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Supervisor task for {} did not stop, aborting", self.inner.target);
                task.abort();
            }
        }

        self.inner.client.disconnect().await;
        self.inner.set_state(SupervisorState::Idle);
        self.inner.set_status(ConnectionStatus::Disconnected);
        info!("Stopped supervising {}", self.inner.target);
    }

    /// Subscribe to `stream_id` now (if connected) and after every reconnect.
    ///
    /// Events are forwarded as [`SupervisorEvent::Stream`].
    pub async fn stream_listen(&self, stream_id: &str) -> Result<()> {
        {
            let mut streams = self.inner.streams.lock().unwrap_or_else(|e| e.into_inner());
            if !streams.iter().any(|s| s == stream_id) {
                streams.push(stream_id.to_string());
            }
        }
        self.inner.ensure_forwarding(stream_id);

        if self.inner.client.is_connected() {
            self.inner.client.stream_listen(stream_id).await?;
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(run) = self
            .inner
            .run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = run.shutdown.send(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

impl SupervisorInner {
    fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SupervisorState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("Supervisor {}: {} -> {}", self.target, *state, next);
            *state = next;
        }
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *status != next;
            *status = next;
            changed
        };
        if changed {
            self.emit(SupervisorEvent::StatusChanged(next));
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn streams(&self) -> Vec<String> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Forward `stream_id` events into the supervisor channel, once.
    fn ensure_forwarding(&self, stream_id: &str) {
        let mut forwarded = self.forwarded.lock().unwrap_or_else(|e| e.into_inner());
        if !forwarded.insert(stream_id.to_string()) {
            return;
        }
        let events = self.events.clone();
        self.client.on_event(stream_id, move |notification| {
            let _ = events.send(SupervisorEvent::Stream(notification.clone()));
        });
    }

    async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut closes = self.closes.lock().await;
        info!("Supervising {}", self.target);
        self.set_status(ConnectionStatus::Connecting);

        let first = tokio::select! {
            _ = stopped(&mut shutdown) => return,
            result = self.bring_up() => result,
        };

        let mut isolate_id = match first {
            Ok(id) => id,
            Err(Error::NoIsolate) => {
                error!("No debuggable isolate on {}", self.target);
                self.client.disconnect().await;
                self.set_state(SupervisorState::Idle);
                self.set_status(ConnectionStatus::Error);
                let _ = ready.send(Err(Error::NoIsolate));
                return;
            }
            Err(e) => {
                warn!("Initial connect to {} failed: {}", self.target, e);
                self.client.disconnect().await;
                match self.recover(&mut shutdown).await {
                    Recovery::Recovered(id) => id,
                    Recovery::Exhausted => {
                        let _ = ready.send(Err(Error::recovery_exhausted(&self.target)));
                        return;
                    }
                    Recovery::Stopped => return,
                }
            }
        };

        self.activate(&isolate_id);
        let _ = ready.send(Ok(()));

        loop {
            match self
                .watch_active(&isolate_id, &mut shutdown, &mut closes)
                .await
            {
                ActiveExit::Stopped => return,
                exit => {
                    if let ActiveExit::Closed(reason) = exit {
                        warn!("Lost connection to {}: {}", self.target, reason);
                    }
                    match self.recover(&mut shutdown).await {
                        Recovery::Recovered(id) => {
                            isolate_id = id;
                            self.activate(&isolate_id);
                            self.emit(SupervisorEvent::Reconnected);
                        }
                        Recovery::Exhausted | Recovery::Stopped => return,
                    }
                }
            }
        }
    }

    fn activate(&self, isolate_id: &str) {
        self.set_state(SupervisorState::Active);
        self.set_status(ConnectionStatus::Connected);
        self.emit(SupervisorEvent::Ready {
            isolate_id: isolate_id.to_string(),
        });
        info!("Supervisor {} active (isolate {})", self.target, isolate_id);
    }

    /// Connect, find the main isolate and (re)subscribe every stream.
    async fn bring_up(&self) -> Result<String> {
        match self.client.connect().await {
            Ok(()) | Err(Error::AlreadyConnected) => {}
            Err(e) => return Err(e),
        }

        let isolate_id = self.client.main_isolate_id().await?;

        for stream in self.streams() {
            self.ensure_forwarding(&stream);
            match self.client.stream_listen(&stream).await {
                Ok(()) => {}
                // The VM refused this stream; the others are still useful.
                Err(e @ Error::RemoteError { .. }) => {
                    warn!("Could not subscribe to {} on {}: {}", stream, self.target, e)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(isolate_id)
    }

    /// Steady state: poll heap usage until the socket closes or we are stopped.
    async fn watch_active(
        &self,
        isolate_id: &str,
        shutdown: &mut watch::Receiver<bool>,
        closes: &mut mpsc::UnboundedReceiver<CloseReason>,
    ) -> ActiveExit {
        // Closes queued before this connection came up belong to older sockets.
        while closes.try_recv().is_ok() {}
        if !self.client.is_connected() {
            return ActiveExit::Closed(CloseReason::StreamEnded);
        }

        // `interval` panics on a zero period.
        let period = self
            .options
            .poll_interval
            .max(Duration::from_millis(POLL_INTERVAL_MIN_MS));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll: Option<JoinHandle<()>> = None;
        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel::<Result<()>>();
        let mut consecutive_failures: u32 = 0;

        let exit = loop {
            tokio::select! {
                _ = stopped(shutdown) => break ActiveExit::Stopped,

                reason = closes.recv() => match reason {
                    Some(_) if self.client.is_connected() => {
                        debug!("Ignoring close of a previous connection to {}", self.target);
                    }
                    Some(reason) => break ActiveExit::Closed(reason),
                    None => break ActiveExit::Stopped,
                },

                _ = ticker.tick() => {
                    if poll.as_ref().is_some_and(|task| !task.is_finished()) {
                        trace!("Previous memory poll for {} still running, skipping tick", self.target);
                        continue;
                    }
                    poll = Some(self.spawn_poll(isolate_id, outcome_tx.clone()));
                }

                Some(outcome) = outcomes.recv() => match outcome {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            debug!(
                                "Memory poll for {} answered again after {} failure(s)",
                                self.target, consecutive_failures
                            );
                        }
                        consecutive_failures = 0;
                    }
                    Err(e @ Error::Timeout { .. }) => {
                        consecutive_failures += 1;
                        warn!(
                            "Memory poll for {} timed out ({}/{}): {}",
                            self.target, consecutive_failures, MAX_POLL_FAILURES, e
                        );
                        if consecutive_failures >= MAX_POLL_FAILURES {
                            error!(
                                "{} unresponsive after {} timed-out polls, reconnecting",
                                self.target, consecutive_failures
                            );
                            self.client.disconnect().await;
                            break ActiveExit::Unresponsive;
                        }
                    }
                    // Expected while the isolate is paused or during a reload.
                    Err(e) => debug!("Memory poll failed: {}", e),
                },
            }
        };

        if let Some(task) = poll {
            task.abort();
        }
        exit
    }

    fn spawn_poll(
        &self,
        isolate_id: &str,
        outcome: mpsc::UnboundedSender<Result<()>>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let events = self.events.clone();
        let isolate_id = isolate_id.to_string();
        tokio::spawn(async move {
            let result = client.get_memory_usage(&isolate_id).await.map(|memory| {
                let _ = events.send(SupervisorEvent::Memory(memory));
            });
            let _ = outcome.send(result);
        })
    }

    /// Handle one outage: consult the governor, then retry with backoff.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) -> Recovery {
        self.set_state(SupervisorState::Reconnecting { attempt: 0 });
        self.set_status(ConnectionStatus::Disconnected);

        if !self.governor.attempt(&self.target) {
            return self.exhaust().await;
        }

        let policy = self.options.reconnect;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            self.set_state(SupervisorState::Reconnecting { attempt });
            self.emit(SupervisorEvent::Reconnecting {
                attempt,
                max_attempts: policy.max_attempts,
                delay,
            });
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.target, delay, attempt, policy.max_attempts
            );

            tokio::select! {
                _ = stopped(shutdown) => return Recovery::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_status(ConnectionStatus::Connecting);
            let outcome = tokio::select! {
                _ = stopped(shutdown) => return Recovery::Stopped,
                result = self.bring_up() => result,
            };

            match outcome {
                Ok(isolate_id) => {
                    info!("Reconnected to {} on attempt {}", self.target, attempt);
                    return Recovery::Recovered(isolate_id);
                }
                Err(e) => {
                    warn!(
                        "Reconnect attempt {}/{} to {} failed: {}",
                        attempt, policy.max_attempts, self.target, e
                    );
                    self.client.disconnect().await;
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }
        }

        self.exhaust().await
    }

    async fn exhaust(&self) -> Recovery {
        error!(
            "Giving up on {}: recovery exhausted, manual restart required",
            self.target
        );
        self.client.disconnect().await;
        self.set_state(SupervisorState::Exhausted);
        self.set_status(ConnectionStatus::Error);
        self.emit(SupervisorEvent::Exhausted {
            target: self.target.clone(),
        });
        Recovery::Exhausted
    }
}

/// Resolves once shutdown was requested or the supervisor handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn dedup(streams: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    streams
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

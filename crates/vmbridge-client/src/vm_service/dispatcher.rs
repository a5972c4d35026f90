//! Listener table for VM Service stream events.
//!
//! The [`EventDispatcher`] keeps, per stream id, the handlers registered with
//! [`VmServiceClient::on_event`](super::VmServiceClient::on_event) and the set
//! of streams that currently have an acknowledged `streamListen` on the live
//! socket.
//!
//! Handlers are local registrations and survive reconnects. Active streams do
//! not: a fresh socket has no subscriptions, so the set is cleared whenever
//! the connection closes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::protocol::StreamNotification;

/// Callback invoked for each event on a stream.
///
/// Handlers run on the connection's I/O task and must not block. Anything
/// that needs to await (including further RPC calls) should be spawned.
pub type EventHandler = Arc<dyn Fn(&StreamNotification) + Send + Sync>;

/// Identifies one registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventDispatcher {
    next_listener: u64,
    listeners: HashMap<String, Vec<(ListenerId, EventHandler)>>,
    active: Vec<String>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `stream_id`. Handlers on the same stream run in
    /// registration order.
    pub fn add_listener(&mut self, stream_id: &str, handler: EventHandler) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners
            .entry(stream_id.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Register a handler that forwards every event on `stream_id` into an
    /// unbounded channel.
    pub fn add_channel(
        &mut self,
        stream_id: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<StreamNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |notification: &StreamNotification| {
            let _ = tx.send(notification.clone());
        });
        (self.add_listener(stream_id, handler), rx)
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        for handlers in self.listeners.values_mut() {
            let before = handlers.len();
            handlers.retain(|(listener, _)| *listener != id);
            removed |= handlers.len() != before;
        }
        self.listeners.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Snapshot of the handlers for `stream_id`, in registration order.
    ///
    /// Callers invoke the snapshot after releasing any lock on the
    /// dispatcher so a handler may register or remove listeners.
    pub fn handlers_for(&self, stream_id: &str) -> Vec<EventHandler> {
        self.listeners
            .get(stream_id)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, stream_id: &str) -> usize {
        self.listeners.get(stream_id).map_or(0, Vec::len)
    }

    // ── Active subscriptions ─────────────────────────────────────────────

    pub fn mark_active(&mut self, stream_id: &str) {
        if !self.is_active(stream_id) {
            self.active.push(stream_id.to_string());
        }
    }

    pub fn mark_inactive(&mut self, stream_id: &str) {
        self.active.retain(|s| s != stream_id);
    }

    pub fn is_active(&self, stream_id: &str) -> bool {
        self.active.iter().any(|s| s == stream_id)
    }

    /// Streams with an acknowledged `streamListen`, in subscription order.
    pub fn active_streams(&self) -> Vec<String> {
        self.active.clone()
    }

    /// Forget all active subscriptions (the socket they belonged to is gone).
    pub fn clear_active(&mut self) -> Vec<String> {
        std::mem::take(&mut self.active)
    }
}

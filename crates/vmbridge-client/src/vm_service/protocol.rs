//! JSON-RPC 2.0 protocol types for the Dart VM Service WebSocket interface.
//!
//! The Dart VM Service communicates over WebSocket using JSON-RPC 2.0. This module
//! defines the types for requests, responses, and stream events, plus a request
//! tracker for correlating async responses with their originating requests.
//!
//! Inbound frames are decoded exactly once, in [`parse_vm_message`], into the
//! tagged [`VmServiceMessage`]. Nothing downstream inspects raw JSON envelopes.
//!
//! Protocol reference:
//! <https://github.com/dart-lang/sdk/blob/main/runtime/vm/service/service.md>

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use vmbridge_core::prelude::*;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 request to the Dart VM Service.
#[derive(Debug, Serialize)]
pub struct VmServiceRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Unique request ID used to correlate the response.
    pub id: String,
    /// Method name, e.g. `"getVM"` or `"streamListen"`.
    pub method: String,
    /// Optional method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl VmServiceRequest {
    pub fn new(id: String, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response from the Dart VM Service.
#[derive(Debug, Deserialize)]
pub struct VmServiceResponse {
    /// The ID matching the original request.
    pub id: Option<String>,
    /// Successful result payload.
    pub result: Option<Value>,
    /// Error payload, present when the call failed.
    pub error: Option<VmServiceError>,
}

impl VmServiceResponse {
    /// Convert into the caller-facing result.
    ///
    /// A structured `error` becomes [`Error::RemoteError`] verbatim; a frame
    /// carrying neither field is a protocol violation.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            Err(Error::remote(error.code, error.message, error.data))
        } else if let Some(result) = self.result {
            Ok(result)
        } else {
            Err(Error::protocol(
                "VM Service response contained neither result nor error",
            ))
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
pub struct VmServiceError {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    pub data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Stream event types
// ---------------------------------------------------------------------------

/// `params` of a `"streamNotify"` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamNotification {
    /// The stream identifier, e.g. `"Extension"`, `"Logging"`, `"Debug"`.
    pub stream_id: String,
    /// The event itself.
    pub event: StreamEvent,
}

/// A single VM Service stream event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Event kind, e.g. `"Extension"`, `"Logging"`, `"PauseBreakpoint"`.
    pub kind: String,
    /// Isolate that generated the event, if applicable.
    pub isolate: Option<IsolateRef>,
    /// Milliseconds since epoch when the event was generated.
    pub timestamp: Option<i64>,
    /// Kind-specific fields, captured untyped for forward compatibility.
    #[serde(flatten)]
    pub data: Value,
}

/// `{"method": "streamNotify", "params": {...}}` envelope.
#[derive(Debug, Deserialize)]
struct StreamNotifyFrame {
    method: String,
    params: StreamNotification,
}

// ---------------------------------------------------------------------------
// VM / Isolate information types
// ---------------------------------------------------------------------------

/// Response body from the `getVM` RPC call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    /// VM name (usually `"vm"`).
    pub name: String,
    /// Dart VM version string.
    pub version: String,
    /// Running isolates.
    #[serde(default)]
    pub isolates: Vec<IsolateRef>,
}

impl VmInfo {
    /// The first non-system isolate. In a Flutter app this is the UI isolate.
    pub fn main_isolate(&self) -> Option<&IsolateRef> {
        self.isolates
            .iter()
            .find(|iso| !iso.is_system_isolate.unwrap_or(false))
    }
}

/// Lightweight reference to a Dart isolate.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateRef {
    /// Unique isolate ID (e.g. `"isolates/1234"`).
    pub id: String,
    /// Human-readable isolate name.
    pub name: String,
    /// Isolate number as a string, if provided.
    pub number: Option<String>,
    /// Whether this is an internal VM system isolate.
    pub is_system_isolate: Option<bool>,
}

/// Full isolate details from the `getIsolate` RPC call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateInfo {
    pub id: String,
    pub name: String,
    pub number: Option<String>,
    /// Whether the isolate is currently runnable.
    pub runnable: Option<bool>,
    /// Epoch milliseconds when the isolate was started.
    pub start_time: Option<i64>,
    /// Service extension RPCs registered by this isolate.
    #[serde(rename = "extensionRPCs")]
    pub extension_rpcs: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Parsed message discriminant
// ---------------------------------------------------------------------------

/// The result of parsing a raw VM Service WebSocket text frame.
#[derive(Debug)]
pub enum VmServiceMessage {
    /// A response to a request we sent (has an `id` field).
    Response(VmServiceResponse),
    /// A stream event notification (no `id`).
    Event(StreamNotification),
    /// A message we received but could not interpret.
    Unknown(String),
}

/// Parse a raw WebSocket text message into a typed [`VmServiceMessage`].
///
/// Dispatch logic:
/// - Non-null top-level `"id"` → [`VmServiceResponse`].
/// - `"method": "streamNotify"` → [`StreamNotification`] from `params`.
/// - `"type": "Event"` with top-level `streamId`/`event` → [`StreamNotification`].
/// - Anything else → [`VmServiceMessage::Unknown`].
pub fn parse_vm_message(text: &str) -> VmServiceMessage {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return VmServiceMessage::Unknown(text.to_string()),
    };

    let has_id = value.get("id").is_some_and(|v| !v.is_null());

    if has_id {
        return match serde_json::from_value::<VmServiceResponse>(value) {
            Ok(response) => VmServiceMessage::Response(response),
            Err(_) => VmServiceMessage::Unknown(text.to_string()),
        };
    }

    if value.get("method").is_some() {
        return match serde_json::from_value::<StreamNotifyFrame>(value) {
            Ok(frame) if frame.method == "streamNotify" => VmServiceMessage::Event(frame.params),
            _ => VmServiceMessage::Unknown(text.to_string()),
        };
    }

    if value.get("type").and_then(Value::as_str) == Some("Event") {
        return match serde_json::from_value::<StreamNotification>(value) {
            Ok(notification) => VmServiceMessage::Event(notification),
            Err(_) => VmServiceMessage::Unknown(text.to_string()),
        };
    }

    VmServiceMessage::Unknown(text.to_string())
}

// ---------------------------------------------------------------------------
// Request tracker
// ---------------------------------------------------------------------------

/// Generate a unique VM Service request ID string.
fn next_vm_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// A registered pending request waiting for a VM Service response.
struct PendingVmRequest {
    method: String,
    /// Channel half used to deliver the outcome to the caller.
    response_tx: oneshot::Sender<Result<Value>>,
    issued_at: Instant,
}

/// Tracks in-flight VM Service requests and matches them to responses.
///
/// Every entry leaves the map exactly once: through [`resolve`](Self::resolve),
/// [`reject`](Self::reject), [`expire`](Self::expire),
/// [`cleanup_stale`](Self::cleanup_stale) or [`drain_all`](Self::drain_all).
/// Any later attempt to complete the same id is a no-op returning `false`.
pub struct VmRequestTracker {
    pending: HashMap<String, PendingVmRequest>,
}

impl VmRequestTracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Generate a fresh request ID and register a pending slot for it.
    ///
    /// Returns `(id, receiver)` where `id` must be sent in the JSON-RPC
    /// request and `receiver` will yield the outcome when it arrives.
    pub fn register(
        &mut self,
        method: impl Into<String>,
    ) -> (String, oneshot::Receiver<Result<Value>>) {
        let id = next_vm_request_id();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            id.clone(),
            PendingVmRequest {
                method: method.into(),
                response_tx: tx,
                issued_at: Instant::now(),
            },
        );

        (id, rx)
    }

    /// Resolve a pending request with a successful result.
    pub fn resolve(&mut self, id: &str, result: Value) -> bool {
        self.finish(id, Ok(result))
    }

    /// Reject a pending request with an error.
    pub fn reject(&mut self, id: &str, error: Error) -> bool {
        self.finish(id, Err(error))
    }

    /// Route a decoded response frame to its waiting caller.
    ///
    /// Returns `true` if `id` was found in the pending map (response routed),
    /// or `false` if no matching pending request exists.
    pub fn complete(&mut self, id: &str, response: VmServiceResponse) -> bool {
        self.finish(id, response.into_result())
    }

    fn finish(&mut self, id: &str, outcome: Result<Value>) -> bool {
        match self.pending.remove(id) {
            Some(pending) => {
                // The receiver may have been dropped; ignore the error.
                let _ = pending.response_tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an entry whose caller already gave up waiting.
    pub fn expire(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Reject every pending request with [`Error::ConnectionClosed`].
    ///
    /// Returns the number of requests that were rejected.
    pub fn drain_all(&mut self) -> usize {
        let drained = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.response_tx.send(Err(Error::ConnectionClosed));
        }
        drained
    }

    /// Reject all requests that have been pending longer than `max_age`
    /// with [`Error::Timeout`].
    ///
    /// Returns the IDs of the requests that were removed.
    pub fn cleanup_stale(&mut self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();

        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, req)| now.duration_since(req.issued_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(pending) = self.pending.remove(id) {
                let err = Error::timeout(pending.method, max_age);
                let _ = pending.response_tx.send(Err(err));
            }
        }

        stale
    }

    /// Return the number of currently pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

impl Default for VmRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- parse_vm_message ----------------------------------------------------

    #[test]
    fn test_parse_get_vm_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": "1",
            "result": {
                "type": "VM",
                "name": "vm",
                "version": "3.4.0",
                "isolates": [
                    { "type": "@Isolate", "id": "isolates/1", "name": "main", "number": "1" }
                ]
            }
        }"#;

        match parse_vm_message(json) {
            VmServiceMessage::Response(resp) => {
                assert_eq!(resp.id.as_deref(), Some("1"));
                assert!(resp.result.is_some());
                assert!(resp.error.is_none());
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_stream_notify_event() {
        let json = r#"{
            "jsonrpc": "2.0",
            "method": "streamNotify",
            "params": {
                "streamId": "Extension",
                "event": {
                    "kind": "Extension",
                    "extensionKind": "Flutter.Error",
                    "extensionData": {}
                }
            }
        }"#;

        match parse_vm_message(json) {
            VmServiceMessage::Event(notification) => {
                assert_eq!(notification.stream_id, "Extension");
                assert_eq!(notification.event.kind, "Extension");
                assert_eq!(notification.event.data["extensionKind"], "Flutter.Error");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_event_frame() {
        let json = r#"{
            "type": "Event",
            "streamId": "Logging",
            "event": { "kind": "Logging", "timestamp": 1700000001234 }
        }"#;

        match parse_vm_message(json) {
            VmServiceMessage::Event(notification) => {
                assert_eq!(notification.stream_id, "Logging");
                assert_eq!(notification.event.timestamp, Some(1_700_000_001_234));
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": "42",
            "error": { "code": -32601, "message": "Method not found", "data": null }
        }"#;

        match parse_vm_message(json) {
            VmServiceMessage::Response(resp) => {
                let err = resp.error.expect("error should be present");
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "Method not found");
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_invalid_json_returns_unknown() {
        let msg = parse_vm_message("not json at all {{{");
        assert!(matches!(msg, VmServiceMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_empty_object_returns_unknown() {
        let msg = parse_vm_message(r#"{"jsonrpc": "2.0"}"#);
        assert!(matches!(msg, VmServiceMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_unknown_method_returns_unknown() {
        let msg = parse_vm_message(r#"{"jsonrpc": "2.0", "method": "registerService", "params": {}}"#);
        assert!(matches!(msg, VmServiceMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_event_missing_kind_returns_unknown() {
        let json = r#"{
            "method": "streamNotify",
            "params": { "streamId": "Logging", "event": { "timestamp": 1 } }
        }"#;
        assert!(matches!(parse_vm_message(json), VmServiceMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_null_id_treated_as_event_path() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": null,
            "method": "streamNotify",
            "params": { "streamId": "GC", "event": { "kind": "GC" } }
        }"#;
        assert!(matches!(parse_vm_message(json), VmServiceMessage::Event(_)));
    }

    // -- VmServiceRequest ----------------------------------------------------

    #[test]
    fn test_vm_service_request_serializes_correctly() {
        let req = VmServiceRequest::new("7".to_string(), "getVM", None);
        let val: Value = serde_json::to_value(&req).unwrap();

        assert_eq!(val["jsonrpc"], "2.0");
        assert_eq!(val["id"], "7");
        assert_eq!(val["method"], "getVM");
        assert!(!val.as_object().unwrap().contains_key("params"));
    }

    #[test]
    fn test_vm_service_request_with_params() {
        let params = json!({ "streamId": "Extension" });
        let req = VmServiceRequest::new("3".to_string(), "streamListen", Some(params));
        let val: Value = serde_json::to_value(&req).unwrap();

        assert_eq!(val["params"]["streamId"], "Extension");
    }

    // -- VmServiceResponse::into_result --------------------------------------

    #[test]
    fn test_into_result_success() {
        let response = VmServiceResponse {
            id: Some("1".to_string()),
            result: Some(json!({ "type": "VM" })),
            error: None,
        };
        assert_eq!(response.into_result().unwrap()["type"], "VM");
    }

    #[test]
    fn test_into_result_remote_error_is_verbatim() {
        let response = VmServiceResponse {
            id: Some("2".to_string()),
            result: None,
            error: Some(VmServiceError {
                code: 113,
                message: "Expression compilation error".to_string(),
                data: Some(json!({ "details": "x" })),
            }),
        };
        match response.into_result() {
            Err(Error::RemoteError { code, message, data }) => {
                assert_eq!(code, 113);
                assert_eq!(message, "Expression compilation error");
                assert_eq!(data.unwrap()["details"], "x");
            }
            other => panic!("Expected RemoteError, got {:?}", other),
        }
    }

    #[test]
    fn test_into_result_neither() {
        let response = VmServiceResponse {
            id: Some("3".to_string()),
            result: None,
            error: None,
        };
        assert!(matches!(response.into_result(), Err(Error::Protocol { .. })));
    }

    // -- VmInfo --------------------------------------------------------------

    #[test]
    fn test_main_isolate_skips_system_isolates() {
        let vm: VmInfo = serde_json::from_value(json!({
            "name": "vm",
            "version": "3.4.0",
            "isolates": [
                { "id": "isolates/vm-service", "name": "vm-service", "isSystemIsolate": true },
                { "id": "isolates/1", "name": "main" }
            ]
        }))
        .unwrap();

        let main = vm.main_isolate().expect("should find a non-system isolate");
        assert_eq!(main.id, "isolates/1");
    }

    #[test]
    fn test_main_isolate_none_when_only_system_isolates() {
        let vm: VmInfo = serde_json::from_value(json!({
            "name": "vm",
            "version": "3.4.0",
            "isolates": [
                { "id": "isolates/kernel", "name": "kernel-service", "isSystemIsolate": true }
            ]
        }))
        .unwrap();
        assert!(vm.main_isolate().is_none());
    }

    #[test]
    fn test_vm_info_without_isolates_field() {
        let vm: VmInfo =
            serde_json::from_value(json!({ "name": "vm", "version": "3.4.0" })).unwrap();
        assert!(vm.isolates.is_empty());
    }

    #[test]
    fn test_parse_isolate_info() {
        let info: IsolateInfo = serde_json::from_value(json!({
            "type": "Isolate",
            "id": "isolates/9",
            "name": "main",
            "runnable": true,
            "startTime": 1700000000000i64,
            "extensionRPCs": ["ext.flutter.reassemble"]
        }))
        .unwrap();
        assert_eq!(info.id, "isolates/9");
        assert_eq!(info.runnable, Some(true));
        assert!(info
            .extension_rpcs
            .unwrap()
            .contains(&"ext.flutter.reassemble".to_string()));
    }

    // -- VmRequestTracker ----------------------------------------------------

    #[test]
    fn test_request_tracker_register_and_complete() {
        let mut tracker = VmRequestTracker::new();

        let (id, mut rx) = tracker.register("getVM");
        assert!(!id.is_empty());
        assert_eq!(tracker.pending_count(), 1);

        let response = VmServiceResponse {
            id: Some(id.clone()),
            result: Some(json!({ "ok": true })),
            error: None,
        };

        assert!(tracker.complete(&id, response));
        assert_eq!(tracker.pending_count(), 0);

        let received = rx.try_recv().expect("outcome should be available");
        assert_eq!(received.unwrap()["ok"], true);
    }

    #[test]
    fn test_request_tracker_ids_are_unique() {
        let mut tracker = VmRequestTracker::new();
        let (id1, _rx1) = tracker.register("getVM");
        let (id2, _rx2) = tracker.register("getVM");
        let (id3, _rx3) = tracker.register("getVM");

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[test]
    fn test_request_tracker_out_of_order_responses() {
        let mut tracker = VmRequestTracker::new();
        let mut slots: Vec<_> = (0..5)
            .map(|i| {
                let (id, rx) = tracker.register(format!("m{i}"));
                (i, id, rx)
            })
            .collect();

        // Resolve in reverse issue order; each value carries its index.
        for (i, id, _) in slots.iter().rev() {
            assert!(tracker.resolve(id, json!(i)));
        }

        for (i, _, rx) in slots.iter_mut() {
            let value = rx.try_recv().unwrap().unwrap();
            assert_eq!(value, json!(i));
        }
    }

    #[test]
    fn test_request_tracker_double_resolve_is_noop() {
        let mut tracker = VmRequestTracker::new();
        let (id, mut rx) = tracker.register("getVM");

        assert!(tracker.resolve(&id, json!(1)));
        assert!(!tracker.resolve(&id, json!(2)));
        assert!(!tracker.reject(&id, Error::ConnectionClosed));

        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(1));
    }

    #[test]
    fn test_request_tracker_unknown_id_returns_false() {
        let mut tracker = VmRequestTracker::new();
        assert!(!tracker.resolve("999", json!(null)));
        assert!(!tracker.reject("999", Error::ConnectionClosed));
        assert!(!tracker.expire("999"));
    }

    #[test]
    fn test_request_tracker_reject_delivers_error() {
        let mut tracker = VmRequestTracker::new();
        let (id, mut rx) = tracker.register("getIsolate");
        assert!(tracker.reject(&id, Error::remote(105, "Isolate must be runnable", None)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::RemoteError { code: 105, .. })
        ));
    }

    #[test]
    fn test_request_tracker_expire_removes_without_outcome() {
        let mut tracker = VmRequestTracker::new();
        let (id, mut rx) = tracker.register("getVM");
        assert!(tracker.expire(&id));
        assert!(!tracker.is_pending(&id));
        // Sender dropped without a value.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_request_tracker_drain_all_rejects_everything() {
        let mut tracker = VmRequestTracker::new();
        let mut receivers: Vec<_> = (0..4).map(|_| tracker.register("getVM").1).collect();

        assert_eq!(tracker.drain_all(), 4);
        assert_eq!(tracker.pending_count(), 0);

        for rx in receivers.iter_mut() {
            assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        }
    }

    #[test]
    fn test_request_tracker_cleanup_stale_times_out() {
        let mut tracker = VmRequestTracker::new();
        let (_id, mut rx) = tracker.register("getMemoryUsage");

        // With a zero max age every request is immediately stale.
        std::thread::sleep(Duration::from_millis(2));
        let removed = tracker.cleanup_stale(Duration::ZERO);
        assert_eq!(removed.len(), 1);
        assert_eq!(tracker.pending_count(), 0);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Timeout { .. })));
    }

    #[test]
    fn test_request_tracker_cleanup_stale_keeps_fresh_requests() {
        let mut tracker = VmRequestTracker::new();
        let (_id, _rx) = tracker.register("getVM");

        let removed = tracker.cleanup_stale(Duration::from_secs(3600));
        assert!(removed.is_empty());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_request_tracker_default() {
        let tracker = VmRequestTracker::default();
        assert_eq!(tracker.pending_count(), 0);
    }
}

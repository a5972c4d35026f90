//! Dart VM Service WebSocket protocol client.
//!
//! ## Modules
//!
//! - [`transport`] - WebSocket open/send/close and frame-level close reasons.
//! - [`protocol`] - JSON-RPC types, the request tracker and the frame parser.
//! - [`dispatcher`] - Per-stream listener table and active subscriptions.
//! - [`client`] - [`VmServiceClient`]: connection lifecycle, calls, streams.
//! - [`extensions`] - Flutter service extension helpers.
//! - [`performance`] - `getMemoryUsage` wrapper and parser.
//!
//! ## Quick start
//!
//! ```ignore
//! use vmbridge_client::vm_service::VmServiceClient;
//! use vmbridge_core::Endpoint;
//!
//! let client = VmServiceClient::new(Endpoint::from_uri("ws://127.0.0.1:8181/ws")?);
//! client.connect().await?;
//!
//! client.on_event("Logging", |n| tracing::info!("{}: {}", n.stream_id, n.event.kind));
//! client.stream_listen("Logging").await?;
//!
//! let isolate_id = client.main_isolate_id().await?;
//! let usage = client.get_memory_usage(&isolate_id).await?;
//!
//! client.disconnect().await;
//! ```

pub mod client;
pub mod dispatcher;
pub mod extensions;
pub mod performance;
pub mod protocol;
pub mod transport;

pub use client::{
    ClientOptions, CloseHandler, ConnectionState, VmServiceClient, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use dispatcher::{EventHandler, ListenerId};
pub use extensions::{
    build_extension_params, is_extension_not_available, EXTENSION_NOT_AVAILABLE_CODE,
    METHOD_NOT_FOUND_CODE,
};
pub use performance::parse_memory_usage;
pub use protocol::{
    parse_vm_message, IsolateInfo, IsolateRef, StreamEvent, StreamNotification, VmInfo,
    VmRequestTracker, VmServiceError, VmServiceMessage, VmServiceRequest, VmServiceResponse,
};
pub use transport::CloseReason;

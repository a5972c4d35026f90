//! # vmbridge-client - Dart VM Service Client
//!
//! JSON-RPC 2.0 over WebSocket client for the Dart VM Service exposed by a
//! running Flutter app.
//!
//! Depends on [`vmbridge_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! - [`VmServiceClient`] - One connection: `connect`, `disconnect`, `call`,
//!   `stream_listen`, `on_event`, `on_close`
//! - [`ConnectionState`] - Client lifecycle state
//! - [`StreamNotification`] - A decoded `streamNotify` event
//! - [`CloseReason`] - Why a connection ended
//!
//! Enable the `test-helpers` feature for [`test_utils::StubVmService`], an
//! in-process VM Service stand-in for integration tests.

pub mod vm_service;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use vm_service::{
    ClientOptions, CloseReason, ConnectionState, ListenerId, StreamEvent, StreamNotification,
    VmServiceClient,
};

//! Headless mode - NDJSON event output
//!
//! `vmbridge watch` prints one JSON object per line to stdout for every
//! supervisor event, so scripts and tool layers can follow a running app
//! without parsing logs.
//!
//! # Example Output
//!
//! ```json
//! {"event":"status","status":"connecting","timestamp":1704700001000}
//! {"event":"status","status":"connected","timestamp":1704700001020}
//! {"event":"ready","isolate_id":"isolates/1234","timestamp":1704700001025}
//! {"event":"memory","heap_usage":52428800,"heap_capacity":104857600,"external_usage":10485760,"timestamp":1704700003000}
//! {"event":"reconnecting","attempt":1,"max_attempts":5,"delay_ms":1000,"timestamp":1704700004000}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};
use tracing::error;

use vmbridge_app::SupervisorEvent;
use vmbridge_core::ConnectionStatus;

/// Events emitted in headless mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Connection status changed
    Status {
        status: ConnectionStatus,
        timestamp: i64,
    },

    /// Main isolate found and streams subscribed
    Ready { isolate_id: String, timestamp: i64 },

    /// Reconnect attempt scheduled
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        timestamp: i64,
    },

    /// Connection restored after an outage
    Reconnected { timestamp: i64 },

    /// Automatic recovery gave up
    Exhausted { target: String, timestamp: i64 },

    /// Heap usage sample
    Memory {
        heap_usage: u64,
        heap_capacity: u64,
        external_usage: u64,
        timestamp: i64,
    },

    /// VM Service stream event
    Stream {
        stream_id: String,
        kind: String,
        isolate_id: Option<String>,
        data: Value,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        // NDJSON: one event per line, flushed immediately
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }
        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

impl From<SupervisorEvent> for HeadlessEvent {
    fn from(event: SupervisorEvent) -> Self {
        let timestamp = Self::now();
        match event {
            SupervisorEvent::StatusChanged(status) => Self::Status { status, timestamp },
            SupervisorEvent::Ready { isolate_id } => Self::Ready {
                isolate_id,
                timestamp,
            },
            SupervisorEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
            } => Self::Reconnecting {
                attempt,
                max_attempts,
                delay_ms: delay.as_millis() as u64,
                timestamp,
            },
            SupervisorEvent::Reconnected => Self::Reconnected { timestamp },
            SupervisorEvent::Exhausted { target } => Self::Exhausted { target, timestamp },
            SupervisorEvent::Memory(memory) => Self::Memory {
                heap_usage: memory.heap_usage,
                heap_capacity: memory.heap_capacity,
                external_usage: memory.external_usage,
                timestamp: memory.timestamp.timestamp_millis(),
            },
            SupervisorEvent::Stream(notification) => Self::Stream {
                stream_id: notification.stream_id,
                kind: notification.event.kind,
                isolate_id: notification.event.isolate.map(|iso| iso.id),
                data: notification.event.data,
                timestamp: notification.event.timestamp.unwrap_or(timestamp),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn to_value(event: HeadlessEvent) -> Value {
        let json = serde_json::to_string(&event).expect("serialization failed");
        serde_json::from_str(&json).expect("invalid JSON")
    }

    #[test]
    fn test_status_serialization() {
        let value = to_value(SupervisorEvent::StatusChanged(ConnectionStatus::Connecting).into());

        assert_eq!(value["event"], "status");
        assert_eq!(value["status"], "connecting");
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn test_reconnecting_serialization() {
        let value = to_value(
            SupervisorEvent::Reconnecting {
                attempt: 2,
                max_attempts: 5,
                delay: Duration::from_millis(1500),
            }
            .into(),
        );

        assert_eq!(value["event"], "reconnecting");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["max_attempts"], 5);
        assert_eq!(value["delay_ms"], 1500);
    }

    #[test]
    fn test_exhausted_serialization() {
        let value = to_value(
            SupervisorEvent::Exhausted {
                target: "127.0.0.1:8181".to_string(),
            }
            .into(),
        );

        assert_eq!(value["event"], "exhausted");
        assert_eq!(value["target"], "127.0.0.1:8181");
    }

    #[test]
    fn test_stream_serialization() {
        let notification: vmbridge_client::StreamNotification = serde_json::from_value(
            serde_json::json!({
                "streamId": "Extension",
                "event": {
                    "kind": "Extension",
                    "timestamp": 1704700000000i64,
                    "isolate": { "id": "isolates/1", "name": "main" },
                    "extensionKind": "Flutter.Frame"
                }
            }),
        )
        .expect("notification should parse");

        let value = to_value(SupervisorEvent::Stream(notification).into());

        assert_eq!(value["event"], "stream");
        assert_eq!(value["stream_id"], "Extension");
        assert_eq!(value["kind"], "Extension");
        assert_eq!(value["isolate_id"], "isolates/1");
        assert_eq!(value["data"]["extensionKind"], "Flutter.Frame");
        assert_eq!(value["timestamp"], 1704700000000i64);
    }

    #[test]
    fn test_error_serialization() {
        let value = to_value(HeadlessEvent::error("Connection failed".to_string(), true));

        assert_eq!(value["event"], "error");
        assert_eq!(value["message"], "Connection failed");
        assert_eq!(value["fatal"], true);
    }
}

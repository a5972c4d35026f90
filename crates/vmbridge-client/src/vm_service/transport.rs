//! WebSocket transport for one VM Service connection.
//!
//! [`open`] performs the handshake and hands back the two halves of the
//! socket. The read half ([`TransportStream`]) turns raw WebSocket frames into
//! [`TransportSignal`]s; the write half ([`TransportSink`]) sends text frames
//! and can be closed any number of times.
//!
//! A successful [`open`] is the "opened" signal. Everything that goes wrong
//! afterwards, including read errors, surfaces as a single
//! [`TransportSignal::Closed`].

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use vmbridge_core::prelude::*;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local side asked for the close (`disconnect()` or client drop).
    Requested,
    /// The remote sent a Close frame.
    Remote { code: Option<u16>, reason: String },
    /// The stream ended without a Close frame.
    StreamEnded,
    /// A read or write on the socket failed.
    TransportError(String),
}

impl CloseReason {
    /// `true` for closes the local side did not ask for.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, CloseReason::Requested)
    }

    /// `true` when the socket failed rather than closing cleanly.
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::TransportError(_))
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed by client"),
            CloseReason::Remote { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "closed by remote ({code}: {reason})")
            }
            CloseReason::Remote { code: Some(code), .. } => write!(f, "closed by remote ({code})"),
            CloseReason::Remote { code: None, .. } => write!(f, "closed by remote"),
            CloseReason::StreamEnded => write!(f, "stream ended"),
            CloseReason::TransportError(err) => write!(f, "transport error: {err}"),
        }
    }
}

/// What the read half produced.
#[derive(Debug)]
pub enum TransportSignal {
    /// A text frame.
    Message(String),
    /// The connection is gone; no further signals follow.
    Closed(CloseReason),
}

/// Open a WebSocket connection to `ws_uri`.
///
/// Resolves once the handshake completes. DNS failures, refused connections,
/// handshake errors and `connect_timeout` all map to
/// [`Error::ConnectFailed`].
pub async fn open(ws_uri: &str, connect_timeout: Duration) -> Result<(TransportSink, TransportStream)> {
    let (ws_stream, _response) = match tokio::time::timeout(connect_timeout, connect_async(ws_uri)).await
    {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => return Err(Error::connect_failed(ws_uri, err.to_string())),
        Err(_) => {
            return Err(Error::connect_failed(
                ws_uri,
                format!("timed out after {connect_timeout:?}"),
            ))
        }
    };

    let (sink, stream) = ws_stream.split();
    Ok((
        TransportSink {
            sink,
            closed: false,
        },
        TransportStream {
            stream,
            finished: false,
        },
    ))
}

/// Write half of an open connection.
pub struct TransportSink {
    sink: SplitSink<WsStream, WsMessage>,
    closed: bool,
}

impl TransportSink {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] once the sink has been closed.
    /// - [`Error::VmService`] if the write fails; the sink is then closed.
    pub async fn send(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if let Err(err) = self.sink.send(WsMessage::Text(text.into())).await {
            self.closed = true;
            return Err(Error::vm_service(format!("WebSocket write failed: {err}")));
        }
        Ok(())
    }

    /// Send a Close frame and shut the sink. Write errors are ignored and
    /// repeated calls do nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Read half of an open connection.
pub struct TransportStream {
    stream: SplitStream<WsStream>,
    finished: bool,
}

impl TransportStream {
    /// Wait for the next text frame or the end of the connection.
    ///
    /// Ping, pong and binary frames are skipped. After a
    /// [`TransportSignal::Closed`] has been returned, further calls return
    /// `Closed(StreamEnded)` immediately.
    pub async fn next_signal(&mut self) -> TransportSignal {
        if self.finished {
            return TransportSignal::Closed(CloseReason::StreamEnded);
        }

        loop {
            let reason = match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return TransportSignal::Message(text.as_str().to_string())
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("VM Service: received Close frame");
                    match frame {
                        Some(frame) => CloseReason::Remote {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_string(),
                        },
                        None => CloseReason::Remote {
                            code: None,
                            reason: String::new(),
                        },
                    }
                }
                Some(Ok(_)) => continue, // Ping/Pong/Binary
                Some(Err(err)) => {
                    warn!("VM Service: WebSocket read error: {}", err);
                    CloseReason::TransportError(err.to_string())
                }
                None => {
                    debug!("VM Service: WebSocket stream ended");
                    CloseReason::StreamEnded
                }
            };
            self.finished = true;
            return TransportSignal::Closed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_expectedness() {
        assert!(!CloseReason::Requested.is_unexpected());
        assert!(CloseReason::StreamEnded.is_unexpected());
        assert!(CloseReason::TransportError("reset".into()).is_unexpected());
        assert!(CloseReason::TransportError("reset".into()).is_error());
        assert!(!CloseReason::StreamEnded.is_error());
    }

    #[test]
    fn test_close_reason_display() {
        let reason = CloseReason::Remote {
            code: Some(1001),
            reason: "going away".to_string(),
        };
        assert_eq!(reason.to_string(), "closed by remote (1001: going away)");
        assert_eq!(
            CloseReason::Remote {
                code: Some(1000),
                reason: String::new()
            }
            .to_string(),
            "closed by remote (1000)"
        );
        assert_eq!(CloseReason::Requested.to_string(), "closed by client");
    }

    #[tokio::test]
    async fn test_open_refused_is_connect_failed() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let uri = format!("ws://127.0.0.1:{port}/ws");
        match open(&uri, Duration::from_secs(2)).await {
            Err(Error::ConnectFailed { uri: failed_uri, .. }) => assert_eq!(failed_uri, uri),
            Err(other) => panic!("expected ConnectFailed, got {other:?}"),
            Ok(_) => panic!("expected ConnectFailed, got a connection"),
        }
    }

    #[tokio::test]
    async fn test_open_handshake_timeout_is_connect_failed() {
        // A plain TCP listener accepts but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        let uri = format!("ws://127.0.0.1:{port}/ws");
        let err = open(&uri, Duration::from_millis(100)).await.err().unwrap();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert!(err.to_string().contains("timed out"));
    }
}

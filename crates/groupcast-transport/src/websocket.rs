//! WebSocket transport implementation.
//!
//! Adapts an upgraded `axum` WebSocket to the frame traits. The HTTP
//! upgrade itself stays with the server; this module only moves frames.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::error::Error as StdError;
use std::io::ErrorKind;
use tracing::trace;

use crate::traits::{close_code, FrameReader, FrameWriter, Transport, TransportError};

/// An upgraded WebSocket connection.
pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (
            WebSocketReader { stream },
            WebSocketWriter {
                sink,
                is_open: true,
            },
        )
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Inbound half of a WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pongs are queued by the protocol layer and flushed with
                    // the next outbound write.
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(TransportError::Closed {
                        code: frame.map(|f| f.code),
                    });
                }
                Some(Err(e)) => return Err(classify_error(e)),
                None => return Err(TransportError::Abnormal),
            }
        }
    }
}

/// Outbound half of a WebSocket.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
    is_open: bool,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn write_frame(&mut self, payload: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::Closed { code: None });
        }

        self.sink
            .send(Message::Text(payload))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        };
        // The peer may already be gone; closing the sink below still
        // releases our side.
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Map a socket read error onto the transport taxonomy.
fn classify_error(err: axum::Error) -> TransportError {
    let inner = err.into_inner();

    let mut source: Option<&(dyn StdError + 'static)> = Some(inner.as_ref());
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if is_disconnect_kind(io.kind()) {
                return TransportError::Abnormal;
            }
        }
        source = e.source();
    }

    let message = inner.to_string();
    if message.contains("without closing handshake") {
        return TransportError::Abnormal;
    }
    TransportError::ReceiveFailed(message)
}

fn is_disconnect_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_abnormal() {
        let io = std::io::Error::new(ErrorKind::ConnectionReset, "reset by peer");
        let err = classify_error(axum::Error::new(io));
        assert!(matches!(err, TransportError::Abnormal));
        assert!(err.is_expected_close());
    }

    #[test]
    fn test_other_errors_are_unexpected() {
        let io = std::io::Error::new(ErrorKind::InvalidData, "invalid utf-8");
        let err = classify_error(axum::Error::new(io));
        assert!(matches!(err, TransportError::ReceiveFailed(_)));
        assert!(!err.is_expected_close());
    }
}

//! Transport abstraction traits for groupcast.
//!
//! A connected participant is served by two independent loops, one per
//! direction, so every transport splits into a [`FrameReader`] and a
//! [`FrameWriter`] that can be moved into separate tasks.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Close codes the relay cares about.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The peer is going away (page navigation, server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

/// Transport errors.
///
/// Every error is terminal for the connection that produced it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer sent a close frame, or the outbound side was closed locally.
    #[error("Connection closed (code: {code:?})")]
    Closed {
        /// Close code carried by the close frame, if any.
        code: Option<u16>,
    },

    /// The connection went away without a closing handshake.
    #[error("Connection reset without closing handshake")]
    Abnormal,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is an ordinary disconnect that should not be logged.
    #[must_use]
    pub fn is_expected_close(&self) -> bool {
        match self {
            Self::Abnormal => true,
            Self::Closed { code: None } => true,
            Self::Closed { code: Some(code) } => matches!(
                *code,
                close_code::NORMAL | close_code::GOING_AWAY | close_code::ABNORMAL
            ),
            _ => false,
        }
    }
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the payload of the next data frame.
    ///
    /// Control frames are handled internally. A close frame or the end of
    /// the stream is reported as an error.
    async fn read_frame(&mut self) -> Result<Bytes, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame.
    async fn write_frame(&mut self, payload: String) -> Result<(), TransportError>;

    /// Close the outbound direction.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A bidirectional frame transport.
pub trait Transport: Send {
    /// Inbound half.
    type Reader: FrameReader + 'static;
    /// Outbound half.
    type Writer: FrameWriter + 'static;

    /// Split into independently owned halves.
    fn split(self) -> (Self::Reader, Self::Writer);

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_close_classes() {
        assert!(TransportError::Abnormal.is_expected_close());
        assert!(TransportError::Closed { code: None }.is_expected_close());
        assert!(TransportError::Closed {
            code: Some(close_code::GOING_AWAY)
        }
        .is_expected_close());
        assert!(TransportError::Closed {
            code: Some(close_code::ABNORMAL)
        }
        .is_expected_close());
    }

    #[test]
    fn test_unexpected_errors() {
        assert!(!TransportError::Closed { code: Some(1011) }.is_expected_close());
        assert!(!TransportError::ReceiveFailed("bad utf-8".into()).is_expected_close());
        assert!(!TransportError::SendFailed("broken".into()).is_expected_close());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(!TransportError::from(io).is_expected_close());
    }
}

//! In-process transport.
//!
//! A duplex pair of bounded channels standing in for a socket. The server
//! side is a [`MemoryTransport`]; the client side is a [`MemoryPeer`] that
//! can send frames, close with a code, and observe the server closing.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, FrameWriter, Transport, TransportError};

/// Default per-direction capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// What a peer can put on the wire.
#[derive(Debug)]
enum PeerFrame {
    Data(Bytes),
    Close(Option<u16>),
    Fail(String),
}

/// Server side of an in-memory connection.
pub struct MemoryTransport {
    inbound: mpsc::Receiver<PeerFrame>,
    outbound: mpsc::Sender<String>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a pair whose directions each buffer at most `capacity` frames.
    ///
    /// Writes block once the peer stops reading, like a stalled socket.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, MemoryPeer) {
        let (peer_tx, inbound) = mpsc::channel(capacity);
        let (outbound, peer_rx) = mpsc::channel(capacity);
        (
            Self { inbound, outbound },
            MemoryPeer {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            MemoryReader { rx: self.inbound },
            MemoryWriter {
                tx: Some(self.outbound),
            },
        )
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Inbound half of a [`MemoryTransport`].
pub struct MemoryReader {
    rx: mpsc::Receiver<PeerFrame>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        match self.rx.recv().await {
            Some(PeerFrame::Data(data)) => Ok(data),
            Some(PeerFrame::Close(code)) => Err(TransportError::Closed { code }),
            Some(PeerFrame::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Err(TransportError::Abnormal),
        }
    }
}

/// Outbound half of a [`MemoryTransport`].
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, payload: String) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(TransportError::Closed { code: None })?;
        tx.send(payload)
            .await
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    tx: mpsc::Sender<PeerFrame>,
    rx: mpsc::Receiver<String>,
}

impl MemoryPeer {
    /// Send a data frame. Returns `false` if the server dropped its reader.
    pub async fn send(&self, payload: impl Into<Bytes>) -> bool {
        self.tx.send(PeerFrame::Data(payload.into())).await.is_ok()
    }

    /// Send a close frame with an optional code.
    pub async fn close(&self, code: Option<u16>) {
        let _ = self.tx.send(PeerFrame::Close(code)).await;
    }

    /// Inject a receive failure on the server side.
    pub async fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(PeerFrame::Fail(reason.into())).await;
    }

    /// Receive the next frame. Returns `None` once the server has closed
    /// its outbound side and every buffered frame has been read.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop reading server frames, so further server writes fail like
    /// writes to a socket whose peer has gone away.
    pub fn stop_reading(&mut self) {
        self.rx.close();
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

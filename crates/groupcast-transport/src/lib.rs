//! # groupcast-transport
//!
//! Transport boundary for the groupcast relay.
//!
//! The relay core never touches sockets directly. It consumes a
//! [`Transport`] that splits into a [`FrameReader`] and a [`FrameWriter`],
//! one per direction, so the two loops serving a participant never share
//! state:
//!
//! - **WebSocket** - an upgraded `axum` socket (feature `websocket`)
//! - **Memory** - an in-process channel pair for tests and benchmarks
//!
//! ```rust,ignore
//! use groupcast_transport::{FrameReader, Transport};
//!
//! async fn drain(transport: impl Transport) {
//!     let (mut reader, _writer) = transport.split();
//!     while let Ok(frame) = reader.read_frame().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use traits::{close_code, FrameReader, FrameWriter, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

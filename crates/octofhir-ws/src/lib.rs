//! Reconnecting WebSocket transport for OctoFHIR clients.
//!
//! Presents a logical always-on connection over an unreliable physical
//! WebSocket. The transport reconnects automatically with exponential
//! backoff, queues outbound messages while disconnected, and surfaces
//! lifecycle transitions as [`TransportEvent`]s on a broadcast channel.
//!
//! Transient network failures are never returned as errors from transport
//! methods; they show up as informational `Error`/`Close` events while the
//! transport recovers on its own.

pub mod error;
pub mod options;
pub mod transport;

pub use error::TransportError;
pub use options::ReconnectOptions;
pub use transport::{ReadyState, ReconnectingWebSocket, TransportEvent};

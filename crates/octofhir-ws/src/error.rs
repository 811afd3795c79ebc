//! Transport error types.

use thiserror::Error;

/// Errors surfaced by transport construction and control methods.
///
/// Network-level failures during the life of a connection are deliberately
/// not represented here; those are recovered automatically and reported as
/// [`TransportEvent::Error`](crate::TransportEvent::Error) events.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0} (expected ws or wss)")]
    UnsupportedScheme(String),
}

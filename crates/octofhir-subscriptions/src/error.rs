//! Subscription error types.

use octofhir_ws::TransportError;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors that can occur during subscription operations.
///
/// These cover the REST interactions that establish and tear down
/// subscriptions. Transient WebSocket failures are not errors; they surface
/// as [`SubscriptionEvent::Error`](crate::SubscriptionEvent::Error) events
/// while the transport recovers on its own.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// HTTP request to the FHIR server failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid FHIR base URL
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Server response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Response body was not valid JSON
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    /// WebSocket transport could not be created
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

//! Client-side FHIR R4 WebSocket subscriptions.
//!
//! A [`SubscriptionManager`] multiplexes any number of subscription criteria
//! over a single reconnecting WebSocket. For each distinct criteria it
//! creates a `Subscription` resource on the server, obtains a binding token
//! via `$get-ws-binding-token`, and binds that token on the socket; inbound
//! notification Bundles are routed to a per-criteria
//! [`SubscriptionEmitter`]. Registrations are reference-counted, so several
//! consumers of the same criteria share one server-side subscription.
//!
//! REST traffic goes through the [`FhirClient`] trait; [`HttpFhirClient`]
//! is the stock reqwest implementation.

pub mod client;
pub mod emitter;
pub mod error;
pub mod manager;

pub use client::{FhirClient, HttpFhirClient};
pub use emitter::{EventKind, ListenerId, SubscriptionEmitter, SubscriptionEvent};
pub use error::{SubscriptionError, SubscriptionResult};
pub use manager::{SubscriptionManager, SubscriptionManagerOptions};

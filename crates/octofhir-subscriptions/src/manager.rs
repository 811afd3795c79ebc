//! Criteria-level subscription lifecycle over one shared WebSocket.
//!
//! The manager owns a single [`ReconnectingWebSocket`] and multiplexes any
//! number of criteria over it. Each criteria string maps to one backend
//! `Subscription` resource, one binding token, and one shared
//! [`SubscriptionEmitter`]; repeated registrations of the same criteria are
//! reference-counted. A background routing task turns inbound notification
//! Bundles into typed events on the matching emitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;

use octofhir_ws::{ReadyState, ReconnectOptions, ReconnectingWebSocket, TransportEvent};

use crate::client::FhirClient;
use crate::emitter::{SubscriptionEmitter, SubscriptionEvent};
use crate::error::{SubscriptionError, SubscriptionResult};

/// Configuration for a [`SubscriptionManager`].
pub struct SubscriptionManagerOptions {
    /// Options for the underlying reconnecting transport.
    pub transport: ReconnectOptions,
    /// Application-level ping cadence. A ping that goes unanswered for a
    /// full interval forces a transport reconnect. `None` disables the
    /// keepalive.
    pub ping_interval: Option<Duration>,
    /// How long before a binding token's reported expiration the manager
    /// fetches and binds a fresh one.
    pub token_refresh_lead: Duration,
}

impl Default for SubscriptionManagerOptions {
    fn default() -> Self {
        Self {
            transport: ReconnectOptions::default(),
            ping_interval: Some(Duration::from_secs(10)),
            token_refresh_lead: Duration::from_secs(30),
        }
    }
}

/// Token material returned by `Subscription/{id}/$get-ws-binding-token`.
struct TokenBinding {
    token: String,
    expiration: Option<OffsetDateTime>,
}

struct CriteriaEntry {
    refcount: usize,
    emitter: Arc<SubscriptionEmitter>,
    subscription_id: String,
    token: String,
    /// Bumped on every rebind so stale refresh timers can tell they lost.
    generation: u64,
}

#[derive(Default)]
struct ManagerState {
    criteria: HashMap<String, CriteriaEntry>,
    /// Reverse index for inbound routing.
    by_subscription: HashMap<String, String>,
}

struct Inner {
    client: Arc<dyn FhirClient>,
    ws: ReconnectingWebSocket,
    state: RwLock<ManagerState>,
    master: Arc<SubscriptionEmitter>,
    /// Serializes add/remove so concurrent registrations of the same
    /// criteria cannot both create a backend resource.
    reg_lock: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    awaiting_pong: AtomicBool,
    token_refresh_lead: Duration,
}

/// Client-side manager for FHIR R4 WebSocket subscriptions.
///
/// Dropping the manager shuts down the transport and all background tasks.
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager connected (or connecting) to the given WebSocket
    /// endpoint. REST traffic goes through `client`.
    pub fn new(
        client: Arc<dyn FhirClient>,
        ws_url: &str,
        options: SubscriptionManagerOptions,
    ) -> SubscriptionResult<Self> {
        let ws = ReconnectingWebSocket::new(ws_url, options.transport)?;
        let inner = Arc::new(Inner {
            client,
            ws,
            state: RwLock::new(ManagerState::default()),
            master: Arc::new(SubscriptionEmitter::new()),
            reg_lock: tokio::sync::Mutex::new(()),
            next_generation: AtomicU64::new(0),
            awaiting_pong: AtomicBool::new(false),
            token_refresh_lead: options.token_refresh_lead,
        });

        let rx = inner.ws.subscribe();
        tokio::spawn(run_router(Arc::downgrade(&inner), rx));
        if let Some(interval) = options.ping_interval {
            tokio::spawn(run_keepalive(Arc::downgrade(&inner), interval));
        }

        Ok(Self { inner })
    }

    /// Register interest in a criteria string, returning the emitter that
    /// will receive its events.
    ///
    /// The first registration creates a `Subscription` resource on the
    /// server, fetches a binding token, and binds it over the WebSocket.
    /// Further registrations of the same criteria share the existing emitter
    /// and only bump a reference count. If any REST call fails, no local
    /// state is kept and the error is returned to the caller; the manager
    /// does not retry.
    pub async fn add_criteria(
        &self,
        criteria: &str,
    ) -> SubscriptionResult<Arc<SubscriptionEmitter>> {
        let inner = &self.inner;
        let _guard = inner.reg_lock.lock().await;

        {
            let mut state = inner.state.write();
            if let Some(entry) = state.criteria.get_mut(criteria) {
                entry.refcount += 1;
                tracing::debug!(criteria, refcount = entry.refcount, "criteria already registered");
                return Ok(entry.emitter.clone());
            }
        }

        let subscription = inner
            .client
            .create_resource(json!({
                "resourceType": "Subscription",
                "status": "active",
                "reason": format!("WebSocket subscription for {criteria}"),
                "criteria": criteria,
                "channel": { "type": "websocket" },
            }))
            .await?;
        let subscription_id = subscription
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SubscriptionError::InvalidResponse(
                    "created Subscription is missing an id".to_string(),
                )
            })?
            .to_string();

        let binding = match inner.fetch_binding(&subscription_id).await {
            Ok(binding) => binding,
            Err(e) => {
                // Roll the resource back so a failed registration leaves no
                // partial state, locally or on the server.
                if let Err(del) = inner
                    .client
                    .delete(&format!("Subscription/{subscription_id}"))
                    .await
                {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        error = %del,
                        "failed to roll back Subscription after token fetch failure"
                    );
                }
                return Err(e);
            }
        };

        let emitter = Arc::new(SubscriptionEmitter::new());
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = inner.state.write();
            state.criteria.insert(
                criteria.to_string(),
                CriteriaEntry {
                    refcount: 1,
                    emitter: emitter.clone(),
                    subscription_id: subscription_id.clone(),
                    token: binding.token.clone(),
                    generation,
                },
            );
            state
                .by_subscription
                .insert(subscription_id.clone(), criteria.to_string());
        }

        inner.send_bind(&binding.token);
        inner.spawn_token_refresh(criteria.to_string(), generation, binding.expiration);
        tracing::debug!(criteria, subscription_id = %subscription_id, "subscription registered");
        Ok(emitter)
    }

    /// Drop one registration of a criteria. When the last registration is
    /// removed, the criteria's emitter receives a final `Disconnect`, the
    /// token is unbound, and the backend `Subscription` resource is deleted.
    /// Unknown criteria are a no-op.
    pub async fn remove_criteria(&self, criteria: &str) -> SubscriptionResult<()> {
        let inner = &self.inner;
        let _guard = inner.reg_lock.lock().await;

        let removed = {
            let mut state = inner.state.write();
            match state.criteria.get_mut(criteria) {
                None => {
                    tracing::debug!(criteria, "remove_criteria for unknown criteria");
                    return Ok(());
                }
                Some(entry) if entry.refcount > 1 => {
                    entry.refcount -= 1;
                    tracing::debug!(criteria, refcount = entry.refcount, "criteria still referenced");
                    return Ok(());
                }
                Some(_) => {}
            }
            let Some(entry) = state.criteria.remove(criteria) else {
                return Ok(());
            };
            state.by_subscription.remove(&entry.subscription_id);
            entry
        };

        let event = SubscriptionEvent::Disconnect {
            subscription_id: removed.subscription_id.clone(),
        };
        removed.emitter.dispatch(&event);
        inner.master.dispatch(&event);

        inner.ws.send(
            json!({
                "type": "unbind-from-token",
                "payload": { "token": removed.token },
            })
            .to_string(),
        );

        inner
            .client
            .delete(&format!("Subscription/{}", removed.subscription_id))
            .await?;
        tracing::debug!(criteria, subscription_id = %removed.subscription_id, "subscription removed");
        Ok(())
    }

    /// Number of distinct criteria currently registered.
    pub fn criteria_count(&self) -> usize {
        self.inner.state.read().criteria.len()
    }

    /// The manager-wide emitter. It sees every criteria's events plus
    /// transport-level `Open`, `Close`, `Error`, and `Heartbeat` events.
    pub fn master_emitter(&self) -> Arc<SubscriptionEmitter> {
        self.inner.master.clone()
    }

    /// Close the WebSocket and stop reconnecting. Registered criteria stay
    /// in place and rebind if the transport is reopened via
    /// [`reconnect_websocket`](Self::reconnect_websocket).
    pub fn close(&self) {
        self.inner.ws.close(Some(1000), Some("client closed"));
    }

    /// Force a fresh WebSocket connection cycle.
    pub fn reconnect_websocket(&self) {
        self.inner.ws.reconnect(None, None);
    }
}

impl Inner {
    fn send_bind(&self, token: &str) {
        self.ws.send(
            json!({
                "type": "bind-with-token",
                "payload": { "token": token },
            })
            .to_string(),
        );
    }

    async fn fetch_binding(&self, subscription_id: &str) -> SubscriptionResult<TokenBinding> {
        let params = self
            .client
            .get(&format!("Subscription/{subscription_id}/$get-ws-binding-token"))
            .await?;

        let mut token = None;
        let mut expiration = None;
        if let Some(parameters) = params.get("parameter").and_then(Value::as_array) {
            for parameter in parameters {
                match parameter.get("name").and_then(Value::as_str) {
                    Some("token") => {
                        token = parameter
                            .get("valueString")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    Some("expiration") => {
                        expiration = parameter
                            .get("valueDateTime")
                            .and_then(Value::as_str)
                            .and_then(|raw| match OffsetDateTime::parse(raw, &Rfc3339) {
                                Ok(parsed) => Some(parsed),
                                Err(e) => {
                                    tracing::warn!(raw, error = %e, "unparsable token expiration");
                                    None
                                }
                            });
                    }
                    _ => {}
                }
            }
        }

        let token = token.ok_or_else(|| {
            SubscriptionError::InvalidResponse(
                "$get-ws-binding-token response is missing a token".to_string(),
            )
        })?;
        Ok(TokenBinding { token, expiration })
    }

    /// Schedule a token refresh ahead of the reported expiration. The timer
    /// is generation-checked: if the entry was rebound in the meantime (for
    /// example by a transport reopen), the stale timer does nothing.
    fn spawn_token_refresh(
        self: &Arc<Self>,
        criteria: String,
        generation: u64,
        expiration: Option<OffsetDateTime>,
    ) {
        let Some(expiration) = expiration else {
            return;
        };
        let until_expiry: Duration = (expiration - OffsetDateTime::now_utc())
            .try_into()
            .unwrap_or_default();
        let wait = until_expiry.saturating_sub(self.token_refresh_lead);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let subscription_id = {
                let state = inner.state.read();
                match state.criteria.get(&criteria) {
                    Some(entry) if entry.generation == generation => {
                        entry.subscription_id.clone()
                    }
                    _ => return,
                }
            };
            tracing::debug!(criteria, subscription_id = %subscription_id, "refreshing binding token");
            inner.rebind(&criteria, &subscription_id, Some(generation)).await;
        });
    }

    /// Fetch a fresh token for one criteria and bind it. `expected_gen`
    /// guards against racing a newer rebind; `None` skips the check.
    async fn rebind(self: &Arc<Self>, criteria: &str, subscription_id: &str, expected_gen: Option<u64>) {
        let binding = match self.fetch_binding(subscription_id).await {
            Ok(binding) => binding,
            Err(e) => {
                tracing::warn!(criteria, error = %e, "token rebind failed");
                self.master
                    .dispatch(&SubscriptionEvent::Error(e.to_string()));
                return;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.write();
            match state.criteria.get_mut(criteria) {
                Some(entry)
                    if expected_gen.is_none() || expected_gen == Some(entry.generation) =>
                {
                    entry.token = binding.token.clone();
                    entry.generation = generation;
                }
                _ => return,
            }
        }

        self.send_bind(&binding.token);
        self.spawn_token_refresh(criteria.to_string(), generation, binding.expiration);
    }

    /// Rebind every registered criteria with a fresh token. Runs on each
    /// transport open so a reconnected socket regains all its bindings.
    async fn rebind_all(self: &Arc<Self>) {
        let targets: Vec<(String, String)> = {
            let state = self.state.read();
            state
                .criteria
                .iter()
                .map(|(criteria, entry)| (criteria.clone(), entry.subscription_id.clone()))
                .collect()
        };
        for (criteria, subscription_id) in targets {
            self.rebind(&criteria, &subscription_id, None).await;
        }
    }

    /// Handle one inbound text frame.
    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring non-JSON WebSocket frame");
                return;
            }
        };

        if value.get("type").and_then(Value::as_str) == Some("pong") {
            self.awaiting_pong.store(false, Ordering::Relaxed);
            return;
        }

        if value.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
            self.route_bundle(&value);
        } else {
            tracing::debug!("ignoring unrecognized WebSocket frame");
        }
    }

    /// Route a notification Bundle to the emitter of the subscription it
    /// belongs to. The first entry is expected to be a `SubscriptionStatus`.
    fn route_bundle(&self, bundle: &Value) {
        let status = bundle
            .get("entry")
            .and_then(Value::as_array)
            .and_then(|entries| entries.first())
            .and_then(|entry| entry.get("resource"));
        let Some(status) = status else {
            tracing::debug!("notification Bundle has no entries");
            return;
        };
        if status.get("resourceType").and_then(Value::as_str) != Some("SubscriptionStatus") {
            tracing::debug!("notification Bundle does not start with a SubscriptionStatus");
            return;
        }

        let kind = status.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind == "heartbeat" {
            self.master
                .dispatch(&SubscriptionEvent::Heartbeat(bundle.clone()));
            return;
        }

        let subscription_id = status
            .get("subscription")
            .and_then(|s| s.get("reference"))
            .and_then(Value::as_str)
            .and_then(|reference| reference.rsplit('/').next());
        let Some(subscription_id) = subscription_id else {
            tracing::debug!("SubscriptionStatus has no subscription reference");
            return;
        };

        let emitter = {
            let state = self.state.read();
            state
                .by_subscription
                .get(subscription_id)
                .and_then(|criteria| state.criteria.get(criteria))
                .map(|entry| entry.emitter.clone())
        };
        let Some(emitter) = emitter else {
            tracing::debug!(subscription_id, "notification for unknown subscription");
            return;
        };

        let event = match kind {
            "handshake" => SubscriptionEvent::Connect {
                subscription_id: subscription_id.to_string(),
            },
            "event-notification" => SubscriptionEvent::Message(bundle.clone()),
            other => {
                tracing::debug!(subscription_id, status_type = other, "unknown SubscriptionStatus type");
                return;
            }
        };
        emitter.dispatch(&event);
        self.master.dispatch(&event);
    }
}

/// Consume transport events: maintain bindings across reconnects and turn
/// inbound frames into subscription events.
async fn run_router(weak: Weak<Inner>, mut rx: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "subscription router lagged behind transport events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Open => {
                inner.master.dispatch(&SubscriptionEvent::Open);
                inner.rebind_all().await;
            }
            TransportEvent::Close { .. } => {
                inner.awaiting_pong.store(false, Ordering::Relaxed);
                inner.master.dispatch(&SubscriptionEvent::Close);
            }
            TransportEvent::Error(e) => {
                inner.master.dispatch(&SubscriptionEvent::Error(e));
            }
            TransportEvent::Message(text) => inner.handle_frame(&text),
        }
    }
}

/// Application-level ping/pong. A pong that fails to arrive within one full
/// interval forces a transport reconnect.
async fn run_keepalive(weak: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.ws.ready_state() != ReadyState::Open {
            inner.awaiting_pong.store(false, Ordering::Relaxed);
            continue;
        }
        if inner.awaiting_pong.swap(true, Ordering::Relaxed) {
            tracing::warn!("keepalive pong missed, forcing reconnect");
            inner.awaiting_pong.store(false, Ordering::Relaxed);
            inner.ws.reconnect(None, Some("keepalive timeout"));
        } else {
            inner.ws.send(r#"{"type":"ping"}"#);
        }
    }
}

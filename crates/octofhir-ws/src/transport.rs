//! Self-healing WebSocket transport.
//!
//! A [`ReconnectingWebSocket`] is a handle over a background task that owns
//! the tungstenite stream. The task drives a four-state lifecycle
//! (connecting/open/closing/closed), reconnecting automatically with
//! exponential backoff whenever the underlying socket fails. Outbound
//! messages sent while disconnected are queued (bounded) and flushed in FIFO
//! order once a connection opens.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::TransportError;
use crate::options::ReconnectOptions;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the connection drops without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Capacity of the transport event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Current state of the logical connection, mirroring the standard
/// WebSocket ready-state values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Lifecycle and data events emitted by the transport.
///
/// All variants are informational; the transport recovers from errors and
/// unexpected closes on its own.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The underlying socket completed its handshake and queued messages
    /// were flushed.
    Open,
    /// The underlying socket closed. Auto-reconnect follows unless the close
    /// was requested via [`ReconnectingWebSocket::close`].
    Close { code: u16, reason: String },
    /// An inbound text frame (binary frames are delivered lossily as text;
    /// the wire protocol is JSON).
    Message(String),
    /// A network error or connection timeout. The synthetic reason for a
    /// handshake timeout is `"TIMEOUT"`.
    Error(String),
}

enum Command {
    Send(String),
    Close { code: u16, reason: String },
    Reconnect { code: u16, reason: String },
    Shutdown,
}

/// Observable state shared between the handle and the background task.
struct Shared {
    ready_state: AtomicU8,
    retry_count: AtomicU32,
    queued_bytes: AtomicUsize,
}

/// A WebSocket connection that maintains itself.
///
/// Created with [`ReconnectingWebSocket::new`]. The connection is owned by a
/// background task; this handle sends it commands and exposes its state.
/// Dropping the handle shuts the connection down.
pub struct ReconnectingWebSocket {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TransportEvent>,
    shared: Arc<Shared>,
}

impl ReconnectingWebSocket {
    /// Validate the URL and spawn the connection task. Unless
    /// [`ReconnectOptions::start_closed`] is set, connecting begins
    /// immediately.
    pub fn new(url: &str, options: ReconnectOptions) -> Result<Self, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::UnsupportedScheme(other.to_string())),
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            ready_state: AtomicU8::new(if options.start_closed {
                ReadyState::Closed as u8
            } else {
                ReadyState::Connecting as u8
            }),
            retry_count: AtomicU32::new(0),
            queued_bytes: AtomicUsize::new(0),
        });

        let task = TransportTask {
            url: parsed.to_string(),
            should_reconnect: !options.start_closed,
            options,
            cmd_rx,
            events: events.clone(),
            shared: shared.clone(),
            queue: VecDeque::new(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            url: parsed.to_string(),
            cmd_tx,
            events,
            shared,
        })
    }

    /// Enqueue a text message for transmission. Never fails: while
    /// disconnected the message is queued (dropped silently beyond
    /// [`ReconnectOptions::max_enqueued_messages`]).
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Send(text.into()));
    }

    /// Close the connection and disable auto-reconnect. Idempotent.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let _ = self.cmd_tx.send(Command::Close {
            code: code.unwrap_or(1000),
            reason: reason.unwrap_or_default().to_string(),
        });
    }

    /// Force a full reconnect cycle: drop the current connection if any,
    /// reset the retry counter, re-enable auto-reconnect and connect.
    pub fn reconnect(&self, code: Option<u16>, reason: Option<&str>) {
        let _ = self.cmd_tx.send(Command::Reconnect {
            code: code.unwrap_or(1000),
            reason: reason.unwrap_or_default().to_string(),
        });
    }

    /// Subscribe to transport events. Each receiver sees every event emitted
    /// after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.ready_state.load(Ordering::Relaxed))
    }

    /// Number of consecutive failed connection attempts. Resets to zero once
    /// a connection stays open for [`ReconnectOptions::min_uptime`] or on a
    /// manual [`reconnect`](Self::reconnect).
    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::Relaxed)
    }

    /// Total size in bytes of messages queued while disconnected.
    /// Observability only.
    ///
    /// Unlike the browser `bufferedAmount`, this does not include bytes
    /// sitting in the open socket's outbound buffer: tungstenite exposes no
    /// such counter, and sends happen inline in the connection task, so the
    /// queue is the only place outbound data waits.
    pub fn buffered_amount(&self) -> usize {
        self.shared.queued_bytes.load(Ordering::Relaxed)
    }

    /// The URL this transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ReconnectingWebSocket {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

enum Flow {
    /// Return to the outer lifecycle loop.
    Continue,
    /// Tear everything down; the handle is gone or shutdown was requested.
    Terminate,
}

struct TransportTask {
    url: String,
    options: ReconnectOptions,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TransportEvent>,
    shared: Arc<Shared>,
    queue: VecDeque<String>,
    should_reconnect: bool,
}

impl TransportTask {
    async fn run(mut self) {
        loop {
            if !self.should_reconnect {
                match self.idle_until_reconnect().await {
                    Flow::Continue => continue,
                    Flow::Terminate => return,
                }
            }

            let retry = self.shared.retry_count.load(Ordering::Relaxed);
            if let Some(max) = self.options.max_retries
                && retry >= max
            {
                // Retry budget exhausted: park silently until a manual
                // reconnect resets the counter.
                tracing::debug!(url = %self.url, retry, "max retries reached, not reconnecting");
                self.set_ready(ReadyState::Closed);
                match self.idle_until_reconnect().await {
                    Flow::Continue => continue,
                    Flow::Terminate => return,
                }
            }

            self.set_ready(ReadyState::Connecting);

            let delay = self.options.next_reconnection_delay(retry);
            if !delay.is_zero() {
                tracing::debug!(url = %self.url, retry, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                match self.sleep_interruptible(delay).await {
                    Flow::Continue => {
                        if !self.should_reconnect {
                            continue;
                        }
                    }
                    Flow::Terminate => return,
                }
            }

            match tokio::time::timeout(
                self.options.connection_timeout,
                connect_async(self.url.as_str()),
            )
            .await
            {
                Ok(Ok((stream, _response))) => {
                    tracing::debug!(url = %self.url, "WebSocket connected");
                    match self.run_open(stream).await {
                        Flow::Continue => {}
                        Flow::Terminate => return,
                    }
                }
                Ok(Err(e)) => {
                    self.shared.retry_count.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(url = %self.url, error = %e, "WebSocket connect failed");
                    self.emit(TransportEvent::Error(e.to_string()));
                }
                Err(_elapsed) => {
                    self.shared.retry_count.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(url = %self.url, "WebSocket connect timed out");
                    self.emit(TransportEvent::Error("TIMEOUT".to_string()));
                }
            }
        }
    }

    /// Event loop while the socket is open. Returns when the socket closes
    /// for any reason.
    async fn run_open(&mut self, mut stream: WsStream) -> Flow {
        self.set_ready(ReadyState::Open);

        // Flush messages enqueued while disconnected, oldest first.
        while let Some(text) = self.queue.pop_front() {
            self.shared
                .queued_bytes
                .fetch_sub(text.len(), Ordering::Relaxed);
            if let Err(e) = stream.send(Message::Text(text)).await {
                return self.connection_lost(e.to_string());
            }
        }

        self.emit(TransportEvent::Open);

        let uptime = tokio::time::sleep(self.options.min_uptime);
        tokio::pin!(uptime);
        let mut accepted = false;

        loop {
            tokio::select! {
                _ = &mut uptime, if !accepted => {
                    // The connection survived long enough to count as
                    // healthy; a later drop reconnects without backoff debt.
                    accepted = true;
                    self.shared.retry_count.store(0, Ordering::Relaxed);
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(e) = stream.send(Message::Text(text)).await {
                            return self.connection_lost(e.to_string());
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        self.should_reconnect = false;
                        self.set_ready(ReadyState::Closing);
                        let _ = stream.close(Some(close_frame(code, &reason))).await;
                        self.set_ready(ReadyState::Closed);
                        self.emit(TransportEvent::Close { code, reason });
                        return Flow::Continue;
                    }
                    Some(Command::Reconnect { code, reason }) => {
                        self.shared.retry_count.store(0, Ordering::Relaxed);
                        let _ = stream.close(Some(close_frame(code, &reason))).await;
                        self.set_ready(ReadyState::Closed);
                        self.emit(TransportEvent::Close { code, reason });
                        return Flow::Continue;
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = stream.close(None).await;
                        self.set_ready(ReadyState::Closed);
                        return Flow::Terminate;
                    }
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.emit(TransportEvent::Message(
                            String::from_utf8_lossy(&data).into_owned(),
                        ));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.into_owned()),
                            None => (ABNORMAL_CLOSURE, String::new()),
                        };
                        self.shared.retry_count.fetch_add(1, Ordering::Relaxed);
                        self.set_ready(ReadyState::Closed);
                        tracing::debug!(url = %self.url, code, "server closed WebSocket");
                        self.emit(TransportEvent::Close { code, reason });
                        return Flow::Continue;
                    }
                    Some(Err(e)) => {
                        self.emit(TransportEvent::Error(e.to_string()));
                        return self.connection_lost(e.to_string());
                    }
                    None => {
                        return self.connection_lost("stream ended".to_string());
                    }
                },
            }
        }
    }

    /// Record an unexpected connection loss and hand control back to the
    /// reconnect loop.
    fn connection_lost(&mut self, reason: String) -> Flow {
        self.shared.retry_count.fetch_add(1, Ordering::Relaxed);
        self.set_ready(ReadyState::Closed);
        tracing::debug!(url = %self.url, reason = %reason, "WebSocket connection lost");
        self.emit(TransportEvent::Close {
            code: ABNORMAL_CLOSURE,
            reason,
        });
        Flow::Continue
    }

    /// Process commands while closed (explicitly, via `start_closed`, or
    /// with the retry budget exhausted). Returns on a reconnect request or
    /// shutdown.
    async fn idle_until_reconnect(&mut self) -> Flow {
        loop {
            match self.cmd_rx.recv().await {
                Some(Command::Send(text)) => self.enqueue(text),
                Some(Command::Close { .. }) => {
                    self.should_reconnect = false;
                }
                Some(Command::Reconnect { .. }) => {
                    self.should_reconnect = true;
                    self.shared.retry_count.store(0, Ordering::Relaxed);
                    return Flow::Continue;
                }
                Some(Command::Shutdown) | None => return Flow::Terminate,
            }
        }
    }

    /// Backoff sleep that stays responsive to commands.
    async fn sleep_interruptible(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => self.enqueue(text),
                    Some(Command::Close { .. }) => {
                        self.should_reconnect = false;
                        self.set_ready(ReadyState::Closed);
                        return Flow::Continue;
                    }
                    Some(Command::Reconnect { .. }) => {
                        self.shared.retry_count.store(0, Ordering::Relaxed);
                        return Flow::Continue;
                    }
                    Some(Command::Shutdown) | None => return Flow::Terminate,
                },
            }
        }
    }

    fn enqueue(&mut self, text: String) {
        if let Some(max) = self.options.max_enqueued_messages
            && self.queue.len() >= max
        {
            tracing::debug!(url = %self.url, "message queue full, dropping send");
            return;
        }
        self.shared
            .queued_bytes
            .fetch_add(text.len(), Ordering::Relaxed);
        self.queue.push_back(text);
    }

    fn set_ready(&self, state: ReadyState) {
        self.shared.ready_state.store(state as u8, Ordering::Relaxed);
    }

    fn emit(&self, event: TransportEvent) {
        // Err means no receivers are currently subscribed, which is fine.
        let _ = self.events.send(event);
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }
}

//! Real-time event stream client.
//!
//! Owns one WebSocket connection to the hub, performs the token handshake,
//! correlates commands with their `result` frames, and fans subscribed
//! events out to per-subscription sinks. A dedicated dispatch task drains
//! the socket so senders never block on inbound traffic.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubwatch_api::{Command, Credentials, EventStreamClient, ServiceCall};
//! use std::time::Duration;
//!
//! let client = EventStreamClient::new(Default::default());
//! client.connect(&credentials).await?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! client.subscribe_events(Some("state_changed"), tx).await?;
//!
//! let call = ServiceCall::new("light", "turn_on").with_target("light.kitchen");
//! client.send_command(Command::CallService(call), Duration::from_secs(10)).await?;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::protocol::{AuthFrame, Command, HubEvent, OutboundFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Where subscribed events are delivered. Unbounded so the dispatch task
/// never stalls behind a slow consumer.
pub type EventSink = mpsc::UnboundedSender<Arc<HubEvent>>;

/// Stand-in deadline when a configured timeout overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ── Configuration ────────────────────────────────────────────────────

/// Where to connect and how to authenticate.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// WebSocket endpoint, e.g. `ws://homeassistant.local:8123/api/websocket`.
    pub url: Url,
    /// Long-lived access token.
    pub access_token: SecretString,
}

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for the whole open + `auth_required` + `auth_ok` exchange.
    pub handshake_timeout: Duration,
    /// Timeout for internal requests (subscribe/unsubscribe).
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

// ── Public result types ──────────────────────────────────────────────

/// Hub identity learned during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubInfo {
    pub version: Option<String>,
}

/// Successful command outcome: the correlation id and the hub's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    pub id: u64,
    pub result: Value,
}

/// Connection liveness as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Down,
    Up { generation: u64 },
}

// ── Internal records ─────────────────────────────────────────────────

/// Command/response correlation entry.
struct PendingRequest {
    kind: &'static str,
    sent_at: Instant,
    timeout: Duration,
    responder: oneshot::Sender<Result<Value, Error>>,
}

struct Subscription {
    event_type: Option<String>,
    sink: EventSink,
}

/// Background pieces of one live connection.
struct ConnectionTasks {
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

// ── EventStreamClient ────────────────────────────────────────────────

/// Handle to the hub's real-time API.
///
/// Cheaply cloneable; all clones share the same connection. The client can
/// be reconnected after a drop by calling [`connect`](Self::connect) again.
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    /// Held for the duration of a handshake; at most one per client.
    handshake: Mutex<()>,
    /// Single writer. Every outbound frame goes through this lock.
    writer: Mutex<Option<WsSink>>,
    pending: DashMap<u64, PendingRequest>,
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
    generation: AtomicU64,
    link: watch::Sender<LinkStatus>,
    last_frame: watch::Sender<Option<Instant>>,
    tasks: Mutex<Option<ConnectionTasks>>,
}

impl Default for EventStreamClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl EventStreamClient {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let (link, _) = watch::channel(LinkStatus::Down);
        let (last_frame, _) = watch::channel(None);

        Self {
            inner: Arc::new(ClientInner {
                config,
                handshake: Mutex::new(()),
                writer: Mutex::new(None),
                pending: DashMap::new(),
                subscriptions: DashMap::new(),
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                link,
                last_frame,
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Open the transport and authenticate in one go.
    pub async fn connect(&self, credentials: &Credentials) -> Result<HubInfo, Error> {
        self.begin_handshake(&credentials.url)
            .await?
            .authenticate(&credentials.access_token)
            .await
    }

    /// Open the transport and wait for the hub's `auth_required` greeting.
    ///
    /// The returned [`Handshake`] holds this client's handshake lock until it
    /// is authenticated or dropped; a concurrent attempt fails with
    /// [`Error::HandshakeInProgress`]. Any existing connection is torn down
    /// first.
    pub async fn begin_handshake(&self, url: &Url) -> Result<Handshake<'_>, Error> {
        let guard = self
            .inner
            .handshake
            .try_lock()
            .map_err(|_| Error::HandshakeInProgress)?;

        if self.is_connected() {
            debug!("replacing live connection");
            self.disconnect().await;
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(self.inner.config.handshake_timeout)
            .unwrap_or(now + FAR_FUTURE);
        info!(url = %url, "Connecting to hub");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let (mut ws, _response) =
            tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(ClientRequestBuilder::new(uri)))
                .await
                .map_err(|_| Error::WebSocketConnect("timed out opening connection".into()))?
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let greeting = read_handshake_frame(&mut ws, deadline).await?;
        let ServerFrame::AuthRequired { ha_version } = greeting else {
            return Err(Error::Protocol {
                message: format!("expected auth_required, got {}", greeting.kind()),
            });
        };

        debug!(hub_version = ?ha_version, "auth required");
        Ok(Handshake {
            client: self,
            _guard: guard,
            ws,
            deadline,
            hub_version: ha_version,
        })
    }

    /// Tear down the transport.
    ///
    /// Every outstanding request fails with [`Error::ConnectionClosed`] and
    /// all subscriptions are dropped.
    pub async fn disconnect(&self) {
        let tasks = self.inner.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            if let Err(e) = tasks.dispatch.await {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.teardown(generation, "client disconnected").await;
    }

    /// Resolve once the connection that is live *now* goes away.
    ///
    /// Returns immediately when not connected.
    pub async fn closed(&self) {
        let mut rx = self.inner.link.subscribe();
        let LinkStatus::Up { generation } = *rx.borrow_and_update() else {
            return;
        };
        let _ = rx
            .wait_for(|status| !matches!(*status, LinkStatus::Up { generation: g } if g == generation))
            .await;
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.link.borrow(), LinkStatus::Up { .. })
    }

    /// When the last frame (of any kind) arrived on the current connection.
    pub fn last_frame_at(&self) -> Option<Instant> {
        *self.inner.last_frame.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send a command and wait up to `timeout` for its `result` frame.
    ///
    /// Concurrent callers are fine: transmission is serialized, waiting is
    /// not. On [`Error::CommandTimeout`] the hub may still have executed the
    /// command; a late `result` is discarded by the dispatch task.
    pub async fn send_command(&self, command: Command, timeout: Duration) -> Result<CommandAck, Error> {
        let id = self.next_request_id();
        let result = self.request(id, &command, timeout).await?;
        Ok(CommandAck { id, result })
    }

    /// Register `sink` and subscribe to `event_type` (`None` = every event).
    ///
    /// Returns the subscription id. Events are delivered in arrival order.
    pub async fn subscribe_events(&self, event_type: Option<&str>, sink: EventSink) -> Result<u64, Error> {
        let id = self.next_request_id();
        self.inner.subscriptions.insert(
            id,
            Subscription {
                event_type: event_type.map(String::from),
                sink,
            },
        );

        let command = Command::SubscribeEvents {
            event_type: event_type.map(String::from),
        };
        match self.request(id, &command, self.inner.config.request_timeout).await {
            Ok(_) => {
                debug!(subscription = id, event_type = ?event_type, "subscribed");
                Ok(id)
            }
            Err(e) => {
                self.inner.subscriptions.remove(&id);
                Err(e)
            }
        }
    }

    /// Drop a subscription locally and tell the hub to stop sending it.
    pub async fn unsubscribe_events(&self, subscription: u64) -> Result<(), Error> {
        self.inner.subscriptions.remove(&subscription);
        self.send_command(
            Command::UnsubscribeEvents { subscription },
            self.inner.config.request_timeout,
        )
        .await
        .map(|_| ())
    }

    /// Application-level ping. Returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, Error> {
        let started = Instant::now();
        self.send_command(Command::Ping, timeout).await?;
        Ok(started.elapsed())
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn request(&self, id: u64, command: &Command, timeout: Duration) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();

        // Registered before transmission so a fast reply can't be missed.
        self.inner.pending.insert(
            id,
            PendingRequest {
                kind: command.kind(),
                sent_at: Instant::now(),
                timeout,
                responder: tx,
            },
        );

        if let Err(e) = self.transmit(id, command).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        trace!(id, kind = command.kind(), "command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::closed("connection dropped before a result arrived")),
            Err(_) => {
                self.inner.pending.remove(&id);
                #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                debug!(id, kind = command.kind(), timeout_ms, "command timed out");
                Err(Error::CommandTimeout { id, timeout_ms })
            }
        }
    }

    async fn transmit(&self, id: u64, command: &Command) -> Result<(), Error> {
        let text = serde_json::to_string(&OutboundFrame { id, command })?;

        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| Error::closed("not connected"))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::closed(e.to_string()))
    }

    /// Install an authenticated stream and start its dispatch task.
    async fn attach(&self, ws: WsStream) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, source) = ws.split();

        *self.inner.writer.lock().await = Some(sink);
        self.inner.last_frame.send_replace(Some(Instant::now()));
        self.inner.link.send_replace(LinkStatus::Up { generation });

        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            source,
            cancel.clone(),
            generation,
        ));

        *self.inner.tasks.lock().await = Some(ConnectionTasks { cancel, dispatch });
        info!(generation, "Hub connection established");
    }
}

// ── Handshake ────────────────────────────────────────────────────────

/// An opened, not yet authenticated connection.
///
/// Holds the client's handshake lock; dropping it abandons the attempt.
pub struct Handshake<'a> {
    client: &'a EventStreamClient,
    _guard: MutexGuard<'a, ()>,
    ws: WsStream,
    deadline: Instant,
    hub_version: Option<String>,
}

impl Handshake<'_> {
    pub fn hub_version(&self) -> Option<&str> {
        self.hub_version.as_deref()
    }

    /// Send the token and wait for the verdict.
    pub async fn authenticate(mut self, token: &SecretString) -> Result<HubInfo, Error> {
        let payload = serde_json::to_string(&AuthFrame::new(token.expose_secret()))?;
        tokio::time::timeout_at(self.deadline, self.ws.send(Message::Text(payload.into())))
            .await
            .map_err(|_| Error::closed("timed out sending auth"))?
            .map_err(|e| Error::closed(e.to_string()))?;

        match read_handshake_frame(&mut self.ws, self.deadline).await? {
            ServerFrame::AuthOk { ha_version } => {
                let version = ha_version.or(self.hub_version);
                self.client.attach(self.ws).await;
                Ok(HubInfo { version })
            }
            ServerFrame::AuthInvalid { message } => {
                let _ = self.ws.close(None).await;
                let message = message.unwrap_or_else(|| "invalid access token".into());
                warn!(%message, "Hub rejected credentials");
                Err(Error::Authentication { message })
            }
            other => Err(Error::Protocol {
                message: format!("expected auth_ok or auth_invalid, got {}", other.kind()),
            }),
        }
    }
}

/// Read the next meaningful frame during the handshake.
///
/// Transport failures here map to [`Error::ConnectionClosed`]: the socket
/// was open and then went away.
async fn read_handshake_frame(ws: &mut WsStream, deadline: Instant) -> Result<ServerFrame, Error> {
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| Error::closed("handshake timed out"))?;

        match frame {
            Some(Ok(Message::Text(text))) => {
                return ServerFrame::parse(&text).map_err(|e| Error::Protocol {
                    message: format!("malformed handshake frame: {e}"),
                });
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map_or_else(|| "closed during handshake".to_owned(), |cf| cf.reason.to_string());
                return Err(Error::closed(reason));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::closed(e.to_string())),
            None => return Err(Error::closed("stream ended during handshake")),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────

/// Drain one connection until it drops or is cancelled.
async fn dispatch_loop(
    inner: Arc<ClientInner>,
    mut source: WsSource,
    cancel: CancellationToken,
    generation: u64,
) {
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break "client disconnected".to_owned(),
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        inner.touch();
                        inner.dispatch_text(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "close frame received".to_owned(),
                            |cf| format!("close frame received (code {}): {}", cf.code, cf.reason),
                        );
                        info!(%reason, "Hub closed the connection");
                        break reason;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary: tungstenite answers pings itself.
                        inner.touch();
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break e.to_string();
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break "stream ended".to_owned();
                    }
                }
            }
        }
    };

    inner.teardown(generation, &reason).await;
    debug!(generation, "dispatch loop exiting");
}

impl ClientInner {
    fn touch(&self) {
        self.last_frame.send_replace(Some(Instant::now()));
    }

    fn dispatch_text(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame {
            ServerFrame::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let detail = error.unwrap_or_default();
                    Err(Error::CommandRejected {
                        id,
                        code: detail.code,
                        message: detail.message,
                    })
                };
                self.resolve(id, "result", outcome);
            }
            ServerFrame::Pong { id } => self.resolve(id, "pong", Ok(Value::Null)),
            ServerFrame::Event { id, event } => self.route_event(id, event),
            other => warn!(frame = other.kind(), "Unexpected frame after handshake, dropping"),
        }
    }

    fn resolve(&self, id: u64, frame: &'static str, outcome: Result<Value, Error>) {
        let Some((_, request)) = self.pending.remove(&id) else {
            // Typically the waiter already timed out.
            debug!(id, frame, "No pending request for id, discarding");
            return;
        };

        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        let elapsed_ms = request.sent_at.elapsed().as_millis() as u64;
        trace!(id, kind = request.kind, elapsed_ms, timeout = ?request.timeout, "request resolved");

        if request.responder.send(outcome).is_err() {
            debug!(id, "Waiter dropped before {frame} arrived");
        }
    }

    fn route_event(&self, subscription: u64, event: HubEvent) {
        let sink_closed = {
            let Some(entry) = self.subscriptions.get(&subscription) else {
                debug!(subscription, event_type = %event.event_type, "Event for unknown subscription");
                return;
            };
            if entry
                .event_type
                .as_deref()
                .is_some_and(|wanted| wanted != event.event_type)
            {
                trace!(subscription, event_type = %event.event_type, "event filtered out");
                return;
            }
            entry.sink.send(Arc::new(event)).is_err()
        };

        if sink_closed {
            debug!(subscription, "Event sink dropped, removing subscription");
            self.subscriptions.remove(&subscription);
        }
    }

    /// Release everything tied to connection `generation`.
    ///
    /// No-op when a newer connection has already replaced it.
    async fn teardown(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let failed = ids.len();
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.responder.send(Err(Error::closed(reason)));
            }
        }
        self.subscriptions.clear();

        let was_up = matches!(*self.link.borrow(), LinkStatus::Up { .. });
        self.link.send_replace(LinkStatus::Down);
        if was_up {
            info!(generation, failed_requests = failed, %reason, "Hub connection closed");
        }
    }
}

// ── Connection supervisor ──
//
// Owns the lifecycle of one EventStreamClient: connect + authenticate,
// subscribe to state changes, feed them to the tracker, and reconnect with
// backoff when the link drops. Two side tasks run next to the supervision
// loop: a ping-based health monitor and the tracker's periodic cleanup.
//
// Bad credentials are fatal. Everything else is retried forever under the
// capped backoff in `ReconnectConfig`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use hubwatch_api::{Credentials, EventStreamClient, HubEvent, STATE_CHANGED};

use crate::config::{MAX_INTERVAL, SupervisorConfig};
use crate::error::CoreError;
use crate::operation::{OperationId, OperationStats};
use crate::tracker::OperationTracker;

/// Floor for timer periods; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Authentication was refused; the supervisor gave up.
    Failed,
}

/// Read-only snapshot returned by [`ConnectionSupervisor::get_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    /// Age of the current connection, when connected.
    pub uptime: Option<Duration>,
    pub operations: OperationStats,
    pub last_error: Option<String>,
    pub hub_version: Option<String>,
}

#[derive(Default)]
struct Vitals {
    connected_since: Option<Instant>,
    last_error: Option<String>,
    hub_version: Option<String>,
}

struct RunningTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunningTasks {
    async fn join(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Stopped,
    Forced,
    Lost(String),
}

// ── ConnectionSupervisor ─────────────────────────────────────────

/// Keeps the event stream alive and routes state changes to the tracker.
///
/// Cheaply cloneable via `Arc<SupervisorInner>`.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    client: EventStreamClient,
    credentials: Credentials,
    tracker: Arc<OperationTracker>,
    config: SupervisorConfig,
    state: watch::Sender<ConnectionState>,
    retry_count: AtomicU32,
    vitals: Mutex<Vitals>,
    /// Bumped on every manual reconnect request.
    reconnect_requests: watch::Sender<u64>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl ConnectionSupervisor {
    /// Create an idle supervisor. Call [`start()`](Self::start) to connect.
    pub fn new(
        client: EventStreamClient,
        credentials: Credentials,
        tracker: Arc<OperationTracker>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (reconnect_requests, _) = watch::channel(0);

        Self {
            inner: Arc::new(SupervisorInner {
                client,
                credentials,
                tracker,
                config,
                state,
                retry_count: AtomicU32::new(0),
                vitals: Mutex::new(Vitals::default()),
                reconnect_requests,
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn client(&self) -> &EventStreamClient {
        &self.inner.client
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.inner.tracker
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the supervision loop, health monitor and cleanup task, then
    /// wait for the first connection attempt to finish.
    ///
    /// A transient first failure is returned but the loop keeps retrying in
    /// the background; call [`stop()`](Self::stop) to give up. An
    /// authentication failure ends supervision with state
    /// [`Failed`](ConnectionState::Failed).
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.as_ref().is_some_and(|running| !running.cancel.is_cancelled()) {
            debug!("supervisor already running");
            return Ok(());
        }
        if let Some(finished) = tasks.take() {
            finished.join().await;
        }

        self.inner.retry_count.store(0, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handles = vec![
            tokio::spawn(supervise(Arc::clone(&self.inner), cancel.clone(), ready_tx)),
            tokio::spawn(health_monitor(Arc::clone(&self.inner), cancel.clone())),
            tokio::spawn(periodic_cleanup(Arc::clone(&self.inner), cancel.clone())),
        ];
        *tasks = Some(RunningTasks { cancel, handles });
        drop(tasks);

        ready_rx.await.unwrap_or_else(|_| {
            Err(CoreError::Internal(
                "supervisor stopped before the first connection attempt finished".into(),
            ))
        })
    }

    /// Cancel every task, close the connection, and go DISCONNECTED.
    pub async fn stop(&self) {
        let tasks = self.inner.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.join().await;
        }
        self.inner.client.disconnect().await;
        self.inner.vitals.lock().await.connected_since = None;
        self.inner.set_state(ConnectionState::Disconnected);
        info!("supervisor stopped");
    }

    /// Drop the current connection and reconnect right away, skipping any
    /// pending backoff delay.
    pub fn force_reconnect(&self) {
        info!("manual reconnect requested");
        self.inner.request_reconnect();
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn get_status(&self) -> SupervisorStatus {
        let state = self.state();
        let operations = self.inner.tracker.stats().await;
        let vitals = self.inner.vitals.lock().await;

        SupervisorStatus {
            state,
            retry_count: self.inner.retry_count(),
            uptime: vitals
                .connected_since
                .filter(|_| state == ConnectionState::Connected)
                .map(|since| since.elapsed()),
            operations,
            last_error: vitals.last_error.clone(),
            hub_version: vitals.hub_version.clone(),
        }
    }

    /// Feed one inbound event to the tracker. Returns the operations it
    /// verified.
    pub async fn handle_state_changed_event(&self, event: &HubEvent) -> Vec<OperationId> {
        self.inner.handle_state_changed_event(event).await
    }
}

impl SupervisorInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state");
        }
    }

    fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    fn request_reconnect(&self) {
        self.reconnect_requests.send_modify(|n| *n = n.wrapping_add(1));
    }

    async fn mark_down(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut vitals = self.vitals.lock().await;
            vitals.connected_since = None;
            if error.is_some() {
                vitals.last_error = error;
            }
        }
        self.set_state(state);
    }

    /// Connect, authenticate, and subscribe to state changes.
    async fn establish(&self) -> Result<mpsc::UnboundedReceiver<Arc<HubEvent>>, CoreError> {
        let url = &self.credentials.url;

        self.set_state(ConnectionState::Connecting);
        let handshake = self
            .client
            .begin_handshake(url)
            .await
            .map_err(|e| self.connect_error(e))?;

        self.set_state(ConnectionState::Authenticating);
        let info = handshake
            .authenticate(&self.credentials.access_token)
            .await
            .map_err(|e| self.connect_error(e))?;

        let (sink, events) = mpsc::unbounded_channel();
        if let Err(e) = self.client.subscribe_events(Some(STATE_CHANGED), sink).await {
            self.client.disconnect().await;
            return Err(e.into());
        }

        {
            let mut vitals = self.vitals.lock().await;
            vitals.connected_since = Some(Instant::now());
            vitals.hub_version.clone_from(&info.version);
        }
        self.set_state(ConnectionState::Connected);
        info!(
            url = %url,
            hub_version = info.version.as_deref().unwrap_or("unknown"),
            retry = self.retry_count(),
            "hub connected"
        );
        Ok(events)
    }

    fn connect_error(&self, err: hubwatch_api::Error) -> CoreError {
        let url = self.credentials.url.to_string();
        match err {
            hubwatch_api::Error::WebSocketConnect(reason)
            | hubwatch_api::Error::ConnectionClosed { reason } => {
                CoreError::ConnectionFailed { url, reason }
            }
            // Stalled or garbled handshakes are retried like a refused connect.
            other if other.is_transient() => CoreError::ConnectionFailed {
                url,
                reason: other.to_string(),
            },
            other => other.into(),
        }
    }

    /// Route events until the session ends.
    async fn run_connected(
        &self,
        mut events: mpsc::UnboundedReceiver<Arc<HubEvent>>,
        cancel: &CancellationToken,
        reconnects: &mut watch::Receiver<u64>,
    ) -> SessionEnd {
        reconnects.mark_unchanged();

        // Surviving one backoff interval counts as stable.
        let stability = tokio::time::sleep(self.config.reconnect.backoff(self.retry_count()));
        tokio::pin!(stability);
        let mut stable = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Stopped,
                Ok(()) = reconnects.changed() => return SessionEnd::Forced,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_state_changed_event(&event).await;
                    }
                    None => return SessionEnd::Lost("event subscription ended".into()),
                },
                () = self.client.closed() => return SessionEnd::Lost("connection closed".into()),
                () = &mut stability, if !stable => {
                    stable = true;
                    let previous = self.retry_count.swap(0, Ordering::SeqCst);
                    if previous > 0 {
                        debug!(previous, "connection stable, retry count reset");
                    }
                }
            }
        }
    }

    async fn handle_state_changed_event(&self, event: &HubEvent) -> Vec<OperationId> {
        let Some(change) = event.state_change() else {
            trace!(event_type = %event.event_type, "ignoring event without new state");
            return Vec::new();
        };
        self.tracker
            .process_state_change(&change.target_id, &change.new_state, &change.attributes)
            .await
    }

    async fn check_health(&self) {
        match self.client.ping(self.config.ping_timeout).await {
            Ok(rtt) => trace!(rtt_ms = millis(rtt), "hub ping"),
            Err(e) => {
                warn!(error = %e, "health check failed, forcing reconnect");
                self.vitals.lock().await.last_error = Some(format!("health check failed: {e}"));
                self.request_reconnect();
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Connect, stay connected, reconnect. Reports the first attempt's outcome
/// through `ready`.
async fn supervise(
    inner: Arc<SupervisorInner>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), CoreError>>,
) {
    let mut ready = Some(ready);
    let mut reconnects = inner.reconnect_requests.subscribe();

    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            attempt = inner.establish() => attempt,
        };

        match attempt {
            Ok(events) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                match inner.run_connected(events, &cancel, &mut reconnects).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Forced => {
                        inner.client.disconnect().await;
                        inner.mark_down(ConnectionState::Reconnecting, None).await;
                        continue;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(%reason, "hub connection lost");
                        inner.client.disconnect().await;
                        inner
                            .mark_down(ConnectionState::Reconnecting, Some(reason))
                            .await;
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "giving up on hub connection");
                inner
                    .mark_down(ConnectionState::Failed, Some(e.to_string()))
                    .await;
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                }
                cancel.cancel();
                return;
            }
            Err(e) => {
                warn!(error = %e, retry = inner.retry_count(), "connection attempt failed");
                inner
                    .mark_down(ConnectionState::Reconnecting, Some(e.to_string()))
                    .await;
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                }
            }
        }

        let attempt = inner.retry_count.fetch_add(1, Ordering::SeqCst);
        let delay = inner.config.reconnect.backoff(attempt);
        debug!(attempt, delay_ms = millis(delay), "waiting before reconnect");

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Ok(()) = reconnects.changed() => debug!("manual reconnect, skipping backoff"),
            () = tokio::time::sleep(delay) => {}
        }
    }

    debug!("supervision loop exiting");
}

/// Ping the hub on a fixed cadence while connected.
async fn health_monitor(inner: Arc<SupervisorInner>, cancel: CancellationToken) {
    let period = inner.config.health_check_interval.clamp(MIN_PERIOD, MAX_INTERVAL);
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticks.tick() => {
                if *inner.state.borrow() == ConnectionState::Connected {
                    inner.check_health().await;
                }
            }
        }
    }
}

/// Expire and prune tracked operations on a fixed cadence.
///
/// Runs whether or not the hub is reachable, so operations still time out
/// while the link is down.
async fn periodic_cleanup(inner: Arc<SupervisorInner>, cancel: CancellationToken) {
    let period = inner.config.cleanup_interval.clamp(MIN_PERIOD, MAX_INTERVAL);
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticks.tick() => {
                inner.tracker.cleanup_expired().await;
            }
        }
    }
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::config::TrackerConfig;
    use crate::operation::{ExpectedState, OperationStatus};

    fn supervisor() -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            EventStreamClient::default(),
            Credentials {
                url: "ws://127.0.0.1:9/api/websocket".parse().unwrap(),
                access_token: SecretString::from("token".to_owned()),
            },
            Arc::new(OperationTracker::new(TrackerConfig::default())),
            SupervisorConfig::default(),
        )
    }

    fn event(value: serde_json::Value) -> HubEvent {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn state_changed_event_completes_matching_operation() {
        let sup = supervisor();
        let op = sup
            .tracker()
            .create("light.kitchen", ExpectedState::new("on"), Duration::from_secs(5))
            .await
            .unwrap();

        let done = sup
            .handle_state_changed_event(&event(json!({
                "event_type": "state_changed",
                "data": {
                    "entity_id": "light.kitchen",
                    "new_state": { "state": "on", "attributes": { "brightness": 120 } }
                }
            })))
            .await;

        assert_eq!(done, vec![op.id]);
        let snapshot = sup.tracker().get(op.id).await.unwrap();
        assert_eq!(snapshot.status, OperationStatus::Completed);
        assert_eq!(snapshot.result.unwrap().attributes["brightness"], 120);
    }

    #[tokio::test]
    async fn removal_and_foreign_events_are_ignored() {
        let sup = supervisor();
        let op = sup
            .tracker()
            .create("light.kitchen", ExpectedState::new("on"), Duration::from_secs(5))
            .await
            .unwrap();

        let removal = event(json!({
            "event_type": "state_changed",
            "data": { "entity_id": "light.kitchen", "new_state": null }
        }));
        let other = event(json!({ "event_type": "call_service", "data": { "entity_id": "light.kitchen" } }));

        assert!(sup.handle_state_changed_event(&removal).await.is_empty());
        assert!(sup.handle_state_changed_event(&other).await.is_empty());
        assert_eq!(sup.tracker().get(op.id).await.unwrap().status, OperationStatus::Pending);
    }

    #[test]
    fn handshake_failures_are_connection_failures() {
        let sup = supervisor();
        let stalled = sup
            .inner
            .connect_error(hubwatch_api::Error::CommandTimeout { id: 0, timeout_ms: 10 });
        let CoreError::ConnectionFailed { url, reason } = stalled else {
            panic!("stalled handshake was not a connection failure");
        };
        assert_eq!(url, "ws://127.0.0.1:9/api/websocket");
        assert!(reason.contains("10ms"), "{reason}");

        let refused = sup.inner.connect_error(hubwatch_api::Error::Authentication {
            message: "Invalid access token".into(),
        });
        assert!(matches!(refused, CoreError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn idle_supervisor_reports_disconnected() {
        let sup = supervisor();
        let status = sup.get_status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.retry_count, 0);
        assert!(status.uptime.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn connection_state_labels() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Failed).unwrap(),
            json!("failed")
        );
    }
}

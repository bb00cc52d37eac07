// ── Hub facade ──
//
// One shared handle per process: the event stream client, the operation
// tracker, the supervisor that keeps them connected, and the executor that
// issues commands. Callers receive a `Hub` explicitly; there is no global.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use hubwatch_api::{EventStreamClient, HubEvent};

use crate::bulk::{BulkEntry, BulkExecutor, DeviceCommand, ExecutionReport, OperationLookup};
use crate::config::HubConfig;
use crate::error::CoreError;
use crate::operation::{Operation, OperationId};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorStatus};
use crate::tracker::OperationTracker;

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<HubInner>`.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    client: EventStreamClient,
    tracker: Arc<OperationTracker>,
    supervisor: ConnectionSupervisor,
    executor: BulkExecutor<EventStreamClient>,
}

impl Hub {
    /// Build the engine. Does NOT connect; call [`start()`](Self::start).
    pub fn new(config: HubConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let client = EventStreamClient::new(config.client.clone());
        let tracker = Arc::new(OperationTracker::new(config.tracker.clone()));
        let supervisor = ConnectionSupervisor::new(
            client.clone(),
            config.credentials(),
            Arc::clone(&tracker),
            config.supervisor.clone(),
        );
        let executor = BulkExecutor::new(client.clone(), Arc::clone(&tracker), config.executor.clone());

        Ok(Self {
            inner: Arc::new(HubInner {
                config,
                client,
                tracker,
                supervisor,
                executor,
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.inner.tracker
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect and start supervision. See [`ConnectionSupervisor::start`].
    pub async fn start(&self) -> Result<(), CoreError> {
        self.inner.supervisor.start().await
    }

    pub async fn stop(&self) {
        self.inner.supervisor.stop().await;
    }

    /// Start, run `f`, stop. Stops even when `f` fails.
    pub async fn oneshot<F, Fut, T, E>(config: HubConfig, f: F) -> Result<T, E>
    where
        F: FnOnce(Hub) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoreError>,
    {
        let hub = Hub::new(config)?;
        if let Err(e) = hub.start().await {
            hub.stop().await;
            return Err(e.into());
        }
        let result = f(hub.clone()).await;
        hub.stop().await;
        result
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Issue one command; with `wait`, block until verified or timed out.
    pub async fn execute(
        &self,
        command: DeviceCommand,
        wait: bool,
        timeout_override: Option<Duration>,
    ) -> Result<ExecutionReport, CoreError> {
        self.inner.executor.execute(command, wait, timeout_override).await
    }

    pub async fn execute_bulk(&self, commands: Vec<DeviceCommand>) -> Vec<BulkEntry> {
        self.inner.executor.execute_bulk(commands).await
    }

    pub async fn bulk_status(&self, ids: &[OperationId]) -> Vec<OperationLookup> {
        self.inner.executor.get_bulk_status(ids).await
    }

    // ── Queries ──────────────────────────────────────────────────

    pub async fn operation(&self, id: OperationId) -> Result<Operation, CoreError> {
        self.inner.tracker.get(id).await
    }

    /// Wait for one operation. See [`OperationTracker::wait`].
    pub async fn wait(&self, id: OperationId, max_wait: Duration) -> Result<Operation, CoreError> {
        self.inner.tracker.wait(id, max_wait).await
    }

    pub async fn status(&self) -> SupervisorStatus {
        self.inner.supervisor.get_status().await
    }

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.state_changes()
    }

    /// Raw event feed for the current connection.
    ///
    /// The receiver ends when the connection drops; subscribe again after a
    /// reconnect.
    pub async fn events(
        &self,
        event_type: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<Arc<HubEvent>>, CoreError> {
        let (sink, events) = mpsc::unbounded_channel();
        let subscription = self.inner.client.subscribe_events(event_type, sink).await?;
        debug!(subscription, event_type = ?event_type, "event feed opened");
        Ok(events)
    }
}

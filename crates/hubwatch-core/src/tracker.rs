// ── Operation tracker ──
//
// Authoritative in-memory map of outstanding "verify this command"
// requests. Inbound state changes are matched against each pending
// operation's expected state; pending operations past their deadline are
// swept to TIMEOUT; terminal ones are pruned after a retention window.
//
// Insertion order is age order, so capacity eviction walks the map front
// to back. Every entry carries a `watch` channel so callers can await the
// terminal status without polling.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{EvictionPolicy, TrackerConfig};
use crate::error::CoreError;
use crate::operation::{
    ExpectedState, ObservedState, Operation, OperationId, OperationStats, OperationStatus,
};

/// Reason recorded on operations dropped to make room.
pub const EVICTED_REASON: &str = "evicted: tracker at capacity";

/// Fallback horizon for absurdly long timeouts.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What one [`OperationTracker::cleanup_expired`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Operations moved from PENDING to TIMEOUT.
    pub timed_out: Vec<OperationId>,
    /// Terminal operations dropped after their retention window.
    pub removed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.removed == 0
    }
}

struct Tracked {
    operation: Operation,
    deadline: Instant,
    settled_at: Option<Instant>,
    notify: watch::Sender<Operation>,
}

impl Tracked {
    fn is_pending(&self) -> bool {
        !self.operation.status.is_terminal()
    }

    /// Move to a terminal status. Returns `false` (and changes nothing) if
    /// the operation already left PENDING.
    fn settle(
        &mut self,
        status: OperationStatus,
        result: Option<ObservedState>,
        error: Option<String>,
    ) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.operation.status = status;
        self.operation.completed_at = Some(Utc::now());
        self.operation.result = result;
        self.operation.error = error;
        self.settled_at = Some(Instant::now());
        self.notify.send_replace(self.operation.clone());
        true
    }
}

/// Tracks operations from creation to a terminal status.
///
/// Shared behind an `Arc`; every method takes `&self`.
pub struct OperationTracker {
    config: TrackerConfig,
    entries: Mutex<IndexMap<OperationId, Tracked>>,
}

impl OperationTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking a new PENDING operation that times out after `timeout`.
    ///
    /// Makes room first when the tracker is full. Fails with
    /// [`CoreError::CapacityExhausted`] only under [`EvictionPolicy::RejectNew`].
    pub async fn create(
        &self,
        target_id: impl Into<String>,
        expected_state: ExpectedState,
        timeout: Duration,
    ) -> Result<Operation, CoreError> {
        let target_id = target_id.into();
        let mut entries = self.entries.lock().await;
        self.make_room(&mut entries)?;

        let created_at = Utc::now();
        let operation = Operation {
            id: OperationId::new(),
            target_id,
            expected_state,
            status: OperationStatus::Pending,
            created_at,
            timeout_at: wall_deadline(created_at, timeout),
            completed_at: None,
            result: None,
            error: None,
        };

        let now = Instant::now();
        let (notify, _) = watch::channel(operation.clone());
        entries.insert(
            operation.id,
            Tracked {
                operation: operation.clone(),
                deadline: now.checked_add(timeout).unwrap_or(now + FAR_FUTURE),
                settled_at: None,
                notify,
            },
        );

        debug!(
            operation = %operation.id,
            entity = %operation.target_id,
            expected = %operation.expected_state.state,
            timeout_ms = millis(timeout),
            "tracking operation"
        );
        Ok(operation)
    }

    /// Complete every pending operation on `target_id` whose criteria the
    /// new state satisfies. Returns the ids it completed.
    ///
    /// Operations already terminal are left alone, so re-delivering an event
    /// changes nothing. Pending operations past their deadline are skipped;
    /// the next sweep times them out.
    pub async fn process_state_change(
        &self,
        target_id: &str,
        new_state: &str,
        attributes: &Map<String, Value>,
    ) -> Vec<OperationId> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut completed = Vec::new();

        for tracked in entries.values_mut() {
            if tracked.operation.target_id != target_id
                || !tracked.is_pending()
                || tracked.deadline <= now
                || !tracked.operation.expected_state.matches(new_state, attributes)
            {
                continue;
            }
            let observed = ObservedState {
                state: new_state.to_owned(),
                attributes: attributes.clone(),
            };
            if tracked.settle(OperationStatus::Completed, Some(observed), None) {
                completed.push(tracked.operation.id);
            }
        }

        if completed.is_empty() {
            trace!(entity = target_id, state = new_state, "state change matched nothing");
        } else {
            debug!(
                entity = target_id,
                state = new_state,
                completed = completed.len(),
                "operations verified"
            );
        }
        completed
    }

    /// Current snapshot of one operation.
    pub async fn get(&self, id: OperationId) -> Result<Operation, CoreError> {
        self.entries
            .lock()
            .await
            .get(&id)
            .map(|tracked| tracked.operation.clone())
            .ok_or(CoreError::OperationNotFound { id })
    }

    /// Mark a pending operation FAILED (e.g. the hub refused the command).
    ///
    /// Returns the resulting snapshot; an already-terminal operation is
    /// returned unchanged.
    pub async fn fail(&self, id: OperationId, reason: impl Into<String>) -> Result<Operation, CoreError> {
        let mut entries = self.entries.lock().await;
        let tracked = entries
            .get_mut(&id)
            .ok_or(CoreError::OperationNotFound { id })?;
        let reason = reason.into();
        if tracked.settle(OperationStatus::Failed, None, Some(reason.clone())) {
            debug!(operation = %id, %reason, "operation failed");
        }
        Ok(tracked.operation.clone())
    }

    /// Wait until the operation is terminal, its deadline passes, or
    /// `max_wait` elapses, whichever comes first. Returns the snapshot at
    /// that moment.
    ///
    /// Reaching the deadline times the operation out on the spot. Giving up
    /// early (or dropping this future) leaves the operation untouched.
    pub async fn wait(&self, id: OperationId, max_wait: Duration) -> Result<Operation, CoreError> {
        let (mut updates, deadline) = {
            let entries = self.entries.lock().await;
            let tracked = entries.get(&id).ok_or(CoreError::OperationNotFound { id })?;
            if !tracked.is_pending() {
                return Ok(tracked.operation.clone());
            }
            (tracked.notify.subscribe(), tracked.deadline)
        };

        let now = Instant::now();
        let give_up = now.checked_add(max_wait).unwrap_or(now + FAR_FUTURE);
        let settled = tokio::time::timeout_at(deadline.min(give_up), async {
            updates
                .wait_for(|op| op.status.is_terminal())
                .await
                .map(|op| op.clone())
        })
        .await;

        match settled {
            Ok(Ok(operation)) => Ok(operation),
            // Entry pruned while we waited.
            Ok(Err(_)) => self.get(id).await,
            Err(_) => {
                if deadline <= Instant::now() {
                    self.expire(id).await;
                }
                self.get(id).await
            }
        }
    }

    /// Time out pending operations past their deadline and prune terminal
    /// operations older than the retention window.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let now = Instant::now();
        let retention = self.config.retention;
        let mut entries = self.entries.lock().await;
        let mut report = CleanupReport::default();

        for tracked in entries.values_mut() {
            if tracked.is_pending()
                && tracked.deadline <= now
                && tracked.settle(OperationStatus::Timeout, None, None)
            {
                report.timed_out.push(tracked.operation.id);
            }
        }

        let before = entries.len();
        entries.retain(|_, tracked| {
            tracked
                .settled_at
                .is_none_or(|at| now.saturating_duration_since(at) < retention)
        });
        report.removed = before - entries.len();

        if !report.is_empty() {
            debug!(
                timed_out = report.timed_out.len(),
                removed = report.removed,
                remaining = entries.len(),
                "operation cleanup"
            );
        }
        report
    }

    pub async fn stats(&self) -> OperationStats {
        let entries = self.entries.lock().await;
        let mut stats = OperationStats::default();
        for tracked in entries.values() {
            stats.count(tracked.operation.status);
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn expire(&self, id: OperationId) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(tracked) = entries.get_mut(&id) {
            if tracked.deadline <= now && tracked.settle(OperationStatus::Timeout, None, None) {
                debug!(operation = %id, "operation timed out");
            }
        }
    }

    /// Evict until one more operation fits.
    fn make_room(&self, entries: &mut IndexMap<OperationId, Tracked>) -> Result<(), CoreError> {
        let max = self.config.max_operations.max(1);

        while entries.len() >= max {
            if let Some(index) = entries.values().position(|tracked| !tracked.is_pending()) {
                if let Some((id, tracked)) = entries.shift_remove_index(index) {
                    warn!(
                        operation = %id,
                        status = %tracked.operation.status,
                        max_operations = max,
                        "tracker full, evicted oldest finished operation"
                    );
                }
                continue;
            }

            match self.config.eviction {
                EvictionPolicy::RejectNew => {
                    warn!(max_operations = max, "tracker full of pending operations, rejecting new one");
                    return Err(CoreError::CapacityExhausted {
                        max_operations: max,
                    });
                }
                EvictionPolicy::EvictOldestPending => {
                    let Some((id, mut tracked)) = entries.shift_remove_index(0) else {
                        break;
                    };
                    tracked.settle(OperationStatus::Failed, None, Some(EVICTED_REASON.into()));
                    warn!(
                        operation = %id,
                        entity = %tracked.operation.target_id,
                        max_operations = max,
                        "tracker full, evicted oldest pending operation"
                    );
                }
            }
        }
        Ok(())
    }
}

fn wall_deadline(created_at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| created_at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

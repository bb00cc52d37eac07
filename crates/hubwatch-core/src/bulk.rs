// ── Command execution ──
//
// Issues device commands with verification. Every command gets its
// Operation *before* it is sent, so a state change that races the hub's
// acknowledgment can never be missed. The hub's synchronous answer is
// reported per command; verification itself happens later, in the tracker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use hubwatch_api::{Command, CommandAck, EventStreamClient, ServiceCall};

use crate::config::ExecutorConfig;
use crate::error::CoreError;
use crate::operation::{ExpectedState, Operation, OperationId, OperationStatus};
use crate::tracker::OperationTracker;

// ── CommandSender ────────────────────────────────────────────────

/// Anything that can deliver a command to the hub and report its
/// synchronous outcome.
pub trait CommandSender: Send + Sync {
    fn send_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandAck, hubwatch_api::Error>> + Send;
}

impl CommandSender for EventStreamClient {
    fn send_command(
        &self,
        command: Command,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandAck, hubwatch_api::Error>> + Send {
        EventStreamClient::send_command(self, command, timeout)
    }
}

// ── Request / result types ───────────────────────────────────────

/// A service call plus the state that proves it worked.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub call: ServiceCall,
    /// Entity whose state changes are watched.
    pub target_id: String,
    pub expect: ExpectedState,
    /// Verification deadline; the executor default applies when `None`.
    pub timeout: Option<Duration>,
}

impl DeviceCommand {
    /// `domain.service` aimed at `target_id`, verified by `expect`.
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        target_id: impl Into<String>,
        expect: ExpectedState,
    ) -> Self {
        let target_id = target_id.into();
        Self {
            call: ServiceCall::new(domain, service).with_target(target_id.clone()),
            target_id,
            expect,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.call = self.call.with_data(key, value);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The hub's synchronous answer to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Dispatch {
    /// The hub accepted the command; verification is under way.
    Accepted,
    /// The hub refused the command; its operation is FAILED.
    Rejected { code: String, message: String },
    /// No answer (timeout or lost connection). The command may still run,
    /// so the operation stays PENDING until verified or timed out.
    Unacknowledged { reason: String },
    /// The command was not sent because it could not be tracked.
    Untracked { reason: String },
}

impl Dispatch {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Unacknowledged { .. } => "unacknowledged",
            Self::Untracked { .. } => "untracked",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Accepted => None,
            Self::Rejected { code, message } => Some(format!("{code}: {message}")),
            Self::Unacknowledged { reason } | Self::Untracked { reason } => Some(reason.clone()),
        }
    }
}

/// One row of a bulk result, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkEntry {
    pub index: usize,
    pub target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    #[serde(flatten)]
    pub dispatch: Dispatch,
}

/// Per-id answer of [`BulkExecutor::get_bulk_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "lookup", rename_all = "snake_case")]
pub enum OperationLookup {
    Found(Operation),
    NotFound { id: OperationId },
}

/// Outcome of [`BulkExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub dispatch: Dispatch,
    /// Snapshot after the optional wait.
    pub operation: Operation,
    pub verified: bool,
}

impl ExecutionReport {
    /// Collapse the report into "verified or why not".
    pub fn into_verified(self) -> Result<Operation, CoreError> {
        if let Dispatch::Rejected { code, message } = self.dispatch {
            return Err(CoreError::CommandRejected { code, message });
        }
        let op = self.operation;
        match op.status {
            OperationStatus::Completed => Ok(op),
            OperationStatus::Failed => Err(CoreError::OperationFailed {
                id: op.id,
                reason: op.error.unwrap_or_else(|| "unknown".into()),
            }),
            OperationStatus::Timeout | OperationStatus::Pending => Err(CoreError::OperationTimeout {
                id: op.id,
                target_id: op.target_id,
            }),
        }
    }
}

// ── BulkExecutor ─────────────────────────────────────────────────

/// Sends commands through a [`CommandSender`] and tracks each one.
pub struct BulkExecutor<S = EventStreamClient> {
    sender: S,
    tracker: Arc<OperationTracker>,
    config: ExecutorConfig,
}

impl<S: CommandSender> BulkExecutor<S> {
    pub fn new(sender: S, tracker: Arc<OperationTracker>, config: ExecutorConfig) -> Self {
        Self {
            sender,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Issue one command and optionally wait for it to be verified.
    ///
    /// `timeout_override` replaces the command's own verification deadline.
    /// A synchronous rejection is reported in the returned
    /// [`ExecutionReport`] rather than as an error; only tracking failures
    /// (e.g. [`CoreError::CapacityExhausted`]) are returned as `Err`.
    pub async fn execute(
        &self,
        mut command: DeviceCommand,
        wait: bool,
        timeout_override: Option<Duration>,
    ) -> Result<ExecutionReport, CoreError> {
        if let Some(timeout) = timeout_override {
            command.timeout = Some(timeout);
        }
        let timeout = self.operation_timeout(&command);

        let (operation_id, dispatch) = self.dispatch(command).await?;
        let operation = match dispatch {
            Dispatch::Accepted | Dispatch::Unacknowledged { .. } if wait => {
                self.tracker.wait(operation_id, timeout).await?
            }
            _ => self.tracker.get(operation_id).await?,
        };

        Ok(ExecutionReport {
            verified: operation.is_verified(),
            dispatch,
            operation,
        })
    }

    /// Issue every command, at most `bulk_concurrency` at a time.
    ///
    /// Returns once each command has its synchronous outcome; never waits for
    /// verification. Entries come back in input order and one command's
    /// failure never affects another's.
    pub async fn execute_bulk(&self, commands: Vec<DeviceCommand>) -> Vec<BulkEntry> {
        let total = commands.len();
        let entries: Vec<BulkEntry> = stream::iter(commands.into_iter().enumerate())
            .map(|(index, command)| async move {
                let target_id = command.target_id.clone();
                match self.dispatch(command).await {
                    Ok((operation_id, dispatch)) => BulkEntry {
                        index,
                        target_id,
                        operation_id: Some(operation_id),
                        dispatch,
                    },
                    Err(e) => {
                        warn!(index, entity = %target_id, error = %e, "bulk command not tracked");
                        BulkEntry {
                            index,
                            target_id,
                            operation_id: None,
                            dispatch: Dispatch::Untracked {
                                reason: e.to_string(),
                            },
                        }
                    }
                }
            })
            .buffered(self.config.bulk_concurrency.max(1))
            .collect()
            .await;

        let accepted = entries
            .iter()
            .filter(|entry| entry.dispatch == Dispatch::Accepted)
            .count();
        info!(total, accepted, "bulk execution dispatched");
        entries
    }

    /// Snapshot every id; unknown ids are reported individually.
    pub async fn get_bulk_status(&self, ids: &[OperationId]) -> Vec<OperationLookup> {
        let mut lookups = Vec::with_capacity(ids.len());
        for &id in ids {
            lookups.push(match self.tracker.get(id).await {
                Ok(operation) => OperationLookup::Found(operation),
                Err(_) => OperationLookup::NotFound { id },
            });
        }
        lookups
    }

    fn operation_timeout(&self, command: &DeviceCommand) -> Duration {
        command
            .timeout
            .unwrap_or(self.config.default_operation_timeout)
    }

    /// Track, then send.
    async fn dispatch(&self, command: DeviceCommand) -> Result<(OperationId, Dispatch), CoreError> {
        let timeout = self.operation_timeout(&command);
        let operation = self
            .tracker
            .create(command.target_id.clone(), command.expect, timeout)
            .await?;
        let id = operation.id;

        let dispatch = match self
            .sender
            .send_command(Command::CallService(command.call), self.config.command_timeout)
            .await
        {
            Ok(ack) => {
                debug!(operation = %id, request = ack.id, entity = %operation.target_id, "command accepted");
                Dispatch::Accepted
            }
            Err(hubwatch_api::Error::CommandRejected { code, message, .. }) => {
                let reason = format!("rejected by hub ({code}): {message}");
                if let Err(e) = self.tracker.fail(id, reason).await {
                    debug!(operation = %id, error = %e, "rejected operation already gone");
                }
                Dispatch::Rejected { code, message }
            }
            Err(e) => {
                debug!(operation = %id, error = %e, "command unacknowledged, still tracking");
                Dispatch::Unacknowledged {
                    reason: e.to_string(),
                }
            }
        };
        Ok((id, dispatch))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn device_command_targets_its_entity() {
        let cmd = DeviceCommand::new("light", "turn_on", "light.kitchen", ExpectedState::new("on"))
            .with_data("brightness", 120)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(cmd.call.target.as_ref().unwrap().entity_id, ["light.kitchen"]);
        assert_eq!(cmd.call.service_data["brightness"], 120);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn bulk_entry_serializes_flat() {
        let entry = BulkEntry {
            index: 2,
            target_id: "switch.fan".into(),
            operation_id: None,
            dispatch: Dispatch::Untracked {
                reason: "full".into(),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["status"], "untracked");
        assert_eq!(value["reason"], "full");
        assert!(value.get("operation_id").is_none());
    }
}

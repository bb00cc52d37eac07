//! Operation verification engine between `hubwatch-api` and the CLI.
//!
//! A command sent to the hub is only *accepted* when the hub acknowledges
//! it. This crate answers the harder question, whether the device actually
//! reached the expected state, by matching the hub's real-time
//! `state_changed` events against outstanding operations:
//!
//! - **[`OperationTracker`]**: in-memory map of pending verifications with
//!   partial attribute matching, deadlines, a capacity bound and retention.
//!
//! - **[`ConnectionSupervisor`]**: keeps the event stream connected with
//!   capped exponential backoff, pings the hub, runs periodic cleanup, and
//!   feeds state changes to the tracker.
//!
//! - **[`BulkExecutor`]**: creates an operation for each command, sends it,
//!   and reports the hub's synchronous accept/reject without waiting for
//!   verification.
//!
//! - **[`Hub`]**: the facade wiring all of the above into one shared handle.

pub mod bulk;
pub mod config;
pub mod error;
pub mod hub;
pub mod operation;
pub mod supervisor;
pub mod tracker;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bulk::{
    BulkEntry, BulkExecutor, CommandSender, DeviceCommand, Dispatch, ExecutionReport,
    OperationLookup,
};
pub use config::{
    EvictionPolicy, ExecutorConfig, HubConfig, MAX_INTERVAL, SupervisorConfig, TrackerConfig,
};
pub use error::CoreError;
pub use hub::Hub;
pub use operation::{
    ExpectedState, ObservedState, Operation, OperationId, OperationStats, OperationStatus,
    matches_expected_state,
};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorStatus};
pub use tracker::{CleanupReport, OperationTracker};

// Transport types callers need alongside the engine.
pub use hubwatch_api::{ClientConfig, HubEvent, ReconnectConfig, ServiceCall, StateChange};

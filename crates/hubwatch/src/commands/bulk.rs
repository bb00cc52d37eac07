//! `bulk`: issue a batch of commands from a JSON file.
//!
//! The file holds an array of commands:
//!
//! ```json
//! [
//!   { "service": "light.turn_on", "entity_id": "light.kitchen",
//!     "data": { "brightness": 120 }, "expect": { "state": "on", "attributes": { "brightness": 120 } } },
//!   { "service": "lock.lock", "entity_id": "lock.front_door", "timeout": "20s" },
//!   { "service": "cover.set_cover_position", "entity_id": "cover.garage", "expect": "open" }
//! ]
//! ```

use std::path::Path;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabled::Tabled;
use tracing::debug;

use hubwatch_core::{
    BulkEntry, DeviceCommand, Dispatch, ExpectedState, Hub, Operation, OperationId,
    OperationLookup, OperationStatus,
};

use crate::cli::{BulkArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::{expected_state, split_service};

// ── Input ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandSpec {
    service: String,
    entity_id: String,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    expect: Option<ExpectSpec>,
    /// humantime string, e.g. "15s"
    #[serde(default)]
    timeout: Option<String>,
}

/// Either a bare state or full criteria.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpectSpec {
    State(String),
    Full(ExpectedState),
}

impl CommandSpec {
    fn into_command(self, index: usize, default_timeout: Option<Duration>) -> Result<DeviceCommand, CliError> {
        let invalid = |reason: String| CliError::Validation {
            field: format!("command #{index}"),
            reason,
        };

        let (domain, service) = split_service(&self.service).map_err(|e| invalid(e.to_string()))?;
        let expect = match self.expect {
            Some(ExpectSpec::Full(expect)) => expect,
            Some(ExpectSpec::State(state)) => ExpectedState::new(state),
            None => ExpectedState::new(
                expected_state(domain, service, None).map_err(|e| invalid(e.to_string()))?,
            ),
        };

        let timeout = match self.timeout.as_deref() {
            Some(raw) => Some(
                humantime::parse_duration(raw)
                    .map_err(|e| invalid(format!("bad timeout '{raw}': {e}")))?,
            ),
            None => default_timeout,
        };

        let mut command = DeviceCommand::new(domain, service, self.entity_id, expect);
        for (key, value) in self.data {
            command = command.with_data(key, value);
        }
        command.timeout = timeout;
        Ok(command)
    }
}

fn read_commands(path: &Path, default_timeout: Option<Duration>) -> Result<Vec<DeviceCommand>, CliError> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path)?
    };
    let specs: Vec<CommandSpec> = serde_json::from_str(&raw)?;
    specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| spec.into_command(index, default_timeout))
        .collect()
}

// ── Output ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BulkResult {
    #[serde(flatten)]
    entry: BulkEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<Operation>,
}

impl BulkResult {
    fn status(&self) -> Option<OperationStatus> {
        self.operation.as_ref().map(|op| op.status)
    }
}

#[derive(Tabled)]
struct BulkRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Dispatch")]
    dispatch: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn to_row(result: &BulkResult, color: bool) -> BulkRow {
    let entry = &result.entry;
    BulkRow {
        index: entry.index,
        entity: entry.target_id.clone(),
        dispatch: entry.dispatch.label().to_owned(),
        status: result
            .status()
            .map_or_else(|| "-".into(), |s| output::status_label(s, color)),
        operation: entry
            .operation_id
            .map_or_else(|| "-".into(), |id| id.to_string()),
        detail: entry
            .dispatch
            .detail()
            .or_else(|| result.operation.as_ref().and_then(|op| op.error.clone()))
            .unwrap_or_default(),
    }
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(hub: &Hub, args: BulkArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let commands = read_commands(&args.file, args.timeout)?;
    let default_timeout = hub.config().executor.default_operation_timeout;
    let longest = commands
        .iter()
        .map(|c| c.timeout.unwrap_or(default_timeout))
        .max()
        .unwrap_or(default_timeout);

    let entries = hub.execute_bulk(commands).await;
    let ids: Vec<OperationId> = entries.iter().filter_map(|e| e.operation_id).collect();

    if args.wait {
        debug!(operations = ids.len(), "waiting for verification");
        // Each wait ends at its own operation deadline.
        join_all(ids.iter().map(|&id| hub.wait(id, longest))).await;
    }

    let mut lookups = hub.bulk_status(&ids).await.into_iter();
    let results: Vec<BulkResult> = entries
        .into_iter()
        .map(|entry| {
            let operation = entry.operation_id.and_then(|_| match lookups.next() {
                Some(OperationLookup::Found(op)) => Some(op),
                _ => None,
            });
            BulkResult { entry, operation }
        })
        .collect();

    let color = output::should_color(global.color);
    let rendered = output::render_list(
        global.output,
        &results,
        |r| to_row(r, color),
        |r| {
            r.entry
                .operation_id
                .map_or_else(|| "-".into(), |id| id.to_string())
        },
    );
    output::print_output(&rendered, global.quiet);

    let (failed, outcome) = if args.wait {
        let unverified = results
            .iter()
            .filter(|r| r.status() != Some(OperationStatus::Completed))
            .count();
        (unverified, "verified")
    } else {
        let refused = results
            .iter()
            .filter(|r| r.entry.dispatch != Dispatch::Accepted)
            .count();
        (refused, "accepted")
    };
    if failed > 0 {
        return Err(CliError::PartialFailure {
            failed,
            total: results.len(),
            outcome,
        });
    }
    Ok(())
}

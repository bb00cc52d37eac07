// ── Operation model ──
//
// An Operation is one "verify this command" request: a target, the state
// we expect it to reach, and what we actually observed. Only the tracker
// mutates these; everyone else sees snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Opaque, unique operation identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle of an operation. Transitions only go forward:
/// `Pending` to exactly one terminal status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Match criteria: an exact state value plus a partial attribute set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedState {
    pub state: String,
    /// Only these attributes are checked; everything else is ignored.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl ExpectedState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, state: &str, attributes: &Map<String, Value>) -> bool {
        matches_expected_state(self, state, attributes)
    }
}

/// Decide whether an observed state satisfies `criteria`.
///
/// The state value must be equal. Each attribute named in `criteria` must be
/// present and equal; attributes it does not name are never looked at.
/// Numbers compare by value (`120` matches `120.0`), and nested objects are
/// matched partially by the same rule.
pub fn matches_expected_state(
    criteria: &ExpectedState,
    new_state: &str,
    attributes: &Map<String, Value>,
) -> bool {
    criteria.state == new_state && attributes_match(&criteria.attributes, attributes)
}

fn attributes_match(expected: &Map<String, Value>, actual: &Map<String, Value>) -> bool {
    expected.iter().all(|(key, want)| {
        actual
            .get(key)
            .is_some_and(|have| values_match(want, have))
    })
}

fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(want), Value::Number(have)) => {
            if let (Some(a), Some(b)) = (want.as_i64(), have.as_i64()) {
                return a == b;
            }
            want.as_f64()
                .zip(have.as_f64())
                .is_some_and(|(a, b)| (a - b).abs() <= f64::EPSILON * a.abs().max(1.0))
        }
        (Value::Object(want), Value::Object(have)) => attributes_match(want, have),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| values_match(w, h))
        }
        _ => expected == actual,
    }
}

/// What the hub reported when the operation was verified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Snapshot of one tracked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub target_id: String,
    pub expected_state: ExpectedState,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ObservedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_verified(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

/// Operation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl OperationStats {
    pub fn total(&self) -> usize {
        self.pending + self.completed + self.failed + self.timed_out
    }

    pub(crate) fn count(&mut self, status: OperationStatus) {
        match status {
            OperationStatus::Pending => self.pending += 1,
            OperationStatus::Completed => self.completed += 1,
            OperationStatus::Failed => self.failed += 1,
            OperationStatus::Timeout => self.timed_out += 1,
        }
    }
}

//! Command dispatch: bridges CLI args -> engine calls -> output formatting.

pub mod bulk;
pub mod call;
pub mod config_cmd;
pub mod status;
pub mod watch;

use hubwatch_core::Hub;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a hub-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, hub: &Hub, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Call(args) => call::handle(hub, args, global).await,
        Command::Bulk(args) => bulk::handle(hub, args, global).await,
        Command::Status => status::handle(hub, global).await,
        Command::Watch(args) => watch::handle(hub, args, global).await,
        // Config and Completions are handled before a hub is built
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "offline command dispatched to the hub".into(),
        )),
    }
}

/// Split `light.turn_on` into `("light", "turn_on")`.
pub fn split_service(raw: &str) -> Result<(&str, &str), CliError> {
    match raw.split_once('.') {
        Some((domain, service)) if !domain.is_empty() && !service.is_empty() => Ok((domain, service)),
        _ => Err(CliError::Validation {
            field: "service".into(),
            reason: format!("expected domain.service (e.g. light.turn_on), got '{raw}'"),
        }),
    }
}

/// The state a well-known service leaves its entity in.
pub fn inferred_state(service: &str) -> Option<&'static str> {
    match service {
        "turn_on" => Some("on"),
        "turn_off" => Some("off"),
        "lock" => Some("locked"),
        "unlock" => Some("unlocked"),
        "open_cover" => Some("open"),
        "close_cover" => Some("closed"),
        _ => None,
    }
}

/// `--expect` when given, otherwise the inferred state.
pub fn expected_state(domain: &str, service: &str, explicit: Option<&str>) -> Result<String, CliError> {
    explicit
        .or_else(|| inferred_state(service))
        .map(str::to_owned)
        .ok_or_else(|| CliError::Validation {
            field: "expect".into(),
            reason: format!("cannot infer the resulting state of {domain}.{service}; pass --expect"),
        })
}

//! Clap derive structures for the `hubwatch` CLI.
//!
//! Defines the command tree, global flags, and argument parsers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// hubwatch -- send smart-home commands and verify the devices obeyed
#[derive(Debug, Parser)]
#[command(
    name = "hubwatch",
    version,
    about = "Send smart-home hub commands and verify they took effect",
    long_about = "Issues service calls to a smart-home hub over its WebSocket API and\n\
        confirms each one by watching for the matching state_changed event.\n\n\
        A command the hub accepts is not a command the device carried out;\n\
        hubwatch reports both.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Hub profile to use
    #[arg(long, short = 'p', env = "HUBWATCH_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Hub WebSocket URL (overrides profile)
    #[arg(long, short = 'u', env = "HUBWATCH_URL", global = true)]
    pub url: Option<String>,

    /// Long-lived access token
    #[arg(long, env = "HUBWATCH_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "HUBWATCH_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Call a service on one entity and track the result
    Call(CallArgs),

    /// Issue a batch of commands from a JSON file
    Bulk(BulkArgs),

    /// Connect and report connection and tracker status
    Status,

    /// Stream hub events as they arrive
    Watch(WatchArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Call ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Service as domain.service (e.g. light.turn_on)
    pub service: String,

    /// Target entity id (e.g. light.kitchen)
    pub entity: String,

    /// State that proves the command worked (inferred for common services)
    #[arg(long, short = 'e')]
    pub expect: Option<String>,

    /// Expected attribute, as key=value (repeatable; value parsed as JSON)
    #[arg(long = "attr", short = 'a', value_parser = parse_key_value)]
    pub attrs: Vec<(String, Value)>,

    /// Service data, as key=value (repeatable; value parsed as JSON)
    #[arg(long = "data", short = 'd', value_parser = parse_key_value)]
    pub data: Vec<(String, Value)>,

    /// Block until the state change is observed or the deadline passes
    #[arg(long, short = 'w')]
    pub wait: bool,

    /// Verification deadline (e.g. 5s, 1m)
    #[arg(long, short = 't', value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

// ── Bulk ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct BulkArgs {
    /// JSON file holding an array of commands ('-' for stdin)
    pub file: PathBuf,

    /// Wait for every accepted command to be verified or time out
    #[arg(long, short = 'w')]
    pub wait: bool,

    /// Verification deadline for commands that don't set one (e.g. 10s)
    #[arg(long, short = 't', value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

// ── Watch ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Event type to subscribe to
    #[arg(long, default_value = "state_changed")]
    pub event_type: String,

    /// Subscribe to every event type
    #[arg(long, conflicts_with = "event_type")]
    pub all: bool,

    /// Only show events for these entities (repeatable)
    #[arg(long = "entity", short = 'e')]
    pub entities: Vec<String>,

    /// Exit after this many events
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a profile to the config file, using the global --url and --token
    Init(ConfigInitArgs),

    /// Show the effective configuration (tokens redacted)
    Show,

    /// Print the config file path
    Path,
}

#[derive(Debug, Args)]
pub struct ConfigInitArgs {
    /// Profile name
    #[arg(long, default_value = "default")]
    pub name: String,

    /// Environment variable to read the token from
    #[arg(long)]
    pub token_env: Option<String>,

    /// Store the token given with --token in the system keyring instead of the file
    #[arg(long)]
    pub keyring: bool,

    /// Make this the default profile
    #[arg(long)]
    pub default: bool,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

// ── Parsers ──────────────────────────────────────────────────────────

/// `key=value`, with the value read as JSON when it parses and as a plain
/// string otherwise (`brightness=120`, `color=red`).
pub fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

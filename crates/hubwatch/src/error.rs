//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use hubwatch_config::ConfigError;
use hubwatch_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const REJECTED: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to hub at {url}")]
    #[diagnostic(
        code(hubwatch::connection_failed),
        help(
            "Check that the hub is running and the WebSocket API is reachable.\n\
             Reason: {reason}"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Connection to the hub was lost")]
    #[diagnostic(code(hubwatch::disconnected), help("Retry the command once the hub is back."))]
    Disconnected,

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(hubwatch::auth_failed),
        help(
            "Check the access token. Long-lived tokens are created from the hub's user profile page.\n\
             Pass one with --token or HUBWATCH_TOKEN."
        )
    )]
    AuthFailed { message: String },

    #[error("No access token configured for profile '{profile}'")]
    #[diagnostic(
        code(hubwatch::no_credentials),
        help(
            "Configure one with: hubwatch config init --url <URL> --token <TOKEN>\n\
             Or set the HUBWATCH_TOKEN environment variable."
        )
    )]
    NoCredentials { profile: String },

    // ── Commands and operations ──────────────────────────────────────
    #[error("Hub rejected the command ({code}): {message}")]
    #[diagnostic(code(hubwatch::rejected))]
    Rejected { code: String, message: String },

    #[error("Hub did not acknowledge the command within {timeout_ms}ms")]
    #[diagnostic(
        code(hubwatch::command_timeout),
        help("The command may still run. Check the device state before retrying.")
    )]
    CommandTimeout { timeout_ms: u64 },

    #[error("{target_id} did not reach the expected state in time (operation {id})")]
    #[diagnostic(
        code(hubwatch::unverified),
        help(
            "The hub accepted the command but no matching state change arrived.\n\
             Raise the deadline with --timeout, or check the expected state and attributes."
        )
    )]
    Unverified { id: String, target_id: String },

    #[error("Operation {id} failed: {reason}")]
    #[diagnostic(code(hubwatch::operation_failed))]
    OperationFailed { id: String, reason: String },

    #[error("Operation '{id}' not found")]
    #[diagnostic(
        code(hubwatch::not_found),
        help("Finished operations are only kept for the configured retention period.")
    )]
    OperationNotFound { id: String },

    #[error("Too many operations in flight ({max_operations})")]
    #[diagnostic(
        code(hubwatch::capacity),
        help("Raise engine.max_operations or set engine.eviction = \"evict-oldest-pending\".")
    )]
    CapacityExhausted { max_operations: usize },

    #[error("{failed} of {total} commands were not {outcome}")]
    #[diagnostic(code(hubwatch::partial_failure))]
    PartialFailure {
        failed: usize,
        total: usize,
        outcome: &'static str,
    },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hubwatch::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(hubwatch::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: hubwatch config init --name {name} --url <URL>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No hub configured")]
    #[diagnostic(
        code(hubwatch::no_config),
        help(
            "Pass --url and --token, or create a profile with: hubwatch config init\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("{0}")]
    #[diagnostic(code(hubwatch::config))]
    Config(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(hubwatch::internal))]
    Internal(String),

    // ── IO / Serialization ────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(code(hubwatch::json), help("Check the JSON file contents and try again."))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::OperationNotFound { .. } | Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::CommandTimeout { .. } | Self::Unverified { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed { url, reason },
            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },
            CoreError::Disconnected => CliError::Disconnected,
            CoreError::CommandTimeout { timeout_ms } => CliError::CommandTimeout { timeout_ms },
            CoreError::CommandRejected { code, message } => CliError::Rejected { code, message },
            CoreError::OperationNotFound { id } => CliError::OperationNotFound { id: id.to_string() },
            CoreError::OperationTimeout { id, target_id } => CliError::Unverified {
                id: id.to_string(),
                target_id,
            },
            CoreError::OperationFailed { id, reason } => CliError::OperationFailed {
                id: id.to_string(),
                reason,
            },
            CoreError::CapacityExhausted { max_operations } => {
                CliError::CapacityExhausted { max_operations }
            }
            CoreError::Config { message } => CliError::Validation {
                field: "configuration".into(),
                reason: message,
            },
            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::UnknownProfile { profile } => CliError::ProfileNotFound {
                name: profile,
                available: String::new(),
            },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config(other.to_string()),
        }
    }
}

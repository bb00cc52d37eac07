// ── Core error types ──
//
// Caller-facing errors from hubwatch-core. Consumers never see raw frame
// parse failures or tungstenite errors; the `From<hubwatch_api::Error>`
// impl translates transport-layer errors into these variants.

use thiserror::Error;

use crate::operation::OperationId;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to hub at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Hub disconnected")]
    Disconnected,

    // ── Command errors ───────────────────────────────────────────────
    #[error("Hub did not acknowledge the command within {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("Command rejected by hub ({code}): {message}")]
    CommandRejected { code: String, message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation not found: {id}")]
    OperationNotFound { id: OperationId },

    /// The operation reached its deadline without a matching state change.
    /// The command may still have taken effect.
    #[error("Operation {id} unverified: no matching state change for {target_id} before its deadline")]
    OperationTimeout { id: OperationId, target_id: String },

    #[error("Operation {id} failed: {reason}")]
    OperationFailed { id: OperationId, reason: String },

    #[error("Operation tracker is full ({max_operations} operations, none evictable)")]
    CapacityExhausted { max_operations: usize },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` if reconnecting cannot fix this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. } | Self::Config { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hubwatch_api::Error> for CoreError {
    fn from(err: hubwatch_api::Error) -> Self {
        match err {
            hubwatch_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            hubwatch_api::Error::HandshakeInProgress => {
                CoreError::Internal("authentication handshake already in progress".into())
            }
            // Connect attempts with a URL are mapped by the supervisor.
            hubwatch_api::Error::WebSocketConnect(_) | hubwatch_api::Error::ConnectionClosed { .. } => {
                CoreError::Disconnected
            }
            hubwatch_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            hubwatch_api::Error::CommandTimeout { timeout_ms, .. } => {
                CoreError::CommandTimeout { timeout_ms }
            }
            hubwatch_api::Error::CommandRejected { code, message, .. } => {
                CoreError::CommandRejected { code, message }
            }
            hubwatch_api::Error::Protocol { message } => {
                CoreError::Internal(format!("Protocol violation: {message}"))
            }
            hubwatch_api::Error::Serialization(e) => {
                CoreError::Internal(format!("Serialization error: {e}"))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn authentication_maps_to_fatal_core_error() {
        let err = CoreError::from(hubwatch_api::Error::Authentication {
            message: "Invalid access token".into(),
        });
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn connection_loss_maps_to_disconnected() {
        let err = CoreError::from(hubwatch_api::Error::ConnectionClosed {
            reason: "reset".into(),
        });
        assert!(matches!(err, CoreError::Disconnected));
        assert!(!err.is_fatal());
    }

    #[test]
    fn connect_failure_outside_supervision_is_disconnected() {
        let err = CoreError::from(hubwatch_api::Error::WebSocketConnect("refused".into()));
        assert!(matches!(err, CoreError::Disconnected));
        assert_eq!(err.to_string(), "Hub disconnected");
    }

    #[test]
    fn rejection_keeps_hub_code() {
        let err = CoreError::from(hubwatch_api::Error::CommandRejected {
            id: 4,
            code: "service_not_found".into(),
            message: "Service light.explode not found.".into(),
        });
        assert_eq!(
            err.to_string(),
            "Command rejected by hub (service_not_found): Service light.explode not found."
        );
    }
}

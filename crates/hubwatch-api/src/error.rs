use thiserror::Error;

/// Top-level error type for the `hubwatch-api` crate.
///
/// Covers every failure mode of the real-time API surface: the
/// authentication handshake, the transport, and per-command correlation.
/// `hubwatch-core` maps these into caller-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The hub answered the handshake with `auth_invalid`.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Another handshake is already running on this client.
    #[error("Authentication handshake already in progress")]
    HandshakeInProgress,

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket connection could not be opened.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The connection went away (or was never there) while a request was
    /// outstanding.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Commands ────────────────────────────────────────────────────
    /// No `result` frame arrived for the command within its timeout.
    /// The hub may still have executed it.
    #[error("Command {id} timed out after {timeout_ms}ms")]
    CommandTimeout { id: u64, timeout_ms: u64 },

    /// The hub answered with `success: false`.
    #[error("Command {id} rejected by hub ({code}): {message}")]
    CommandRejected {
        id: u64,
        code: String,
        message: String,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// The hub sent a frame that does not fit the current protocol phase.
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// Frame (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying cannot fix this error.
    ///
    /// Bad credentials stay bad no matter how many times we reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::InvalidUrl(_))
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::ConnectionClosed { .. }
                | Self::CommandTimeout { .. }
                | Self::Protocol { .. }
        )
    }
}

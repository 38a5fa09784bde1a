//! Error taxonomy for engine commands

use thiserror::Error;

/// Failure of a single gateway command.
///
/// Every variant names the command that failed so that callers can
/// surface a distinguishable message instead of a generic "failed".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Transport failure or timeout. The next scheduled poll retries.
    #[error("engine unavailable for {command}: {reason}")]
    RemoteUnavailable { command: &'static str, reason: String },

    /// The engine answered with a structured business error.
    #[error("engine rejected {command}: {reason}")]
    RemoteRejected { command: &'static str, reason: String },

    /// The engine answered, but the payload did not have the expected shape.
    #[error("unexpected {command} response: {reason}")]
    DecodeError { command: &'static str, reason: String },

    /// Local argument validation failed; nothing was sent.
    #[error("invalid argument for {command}: {reason}")]
    InvalidArgument { command: &'static str, reason: String },
}

impl GatewayError {
    /// Command that produced this error
    pub fn command(&self) -> &'static str {
        match self {
            GatewayError::RemoteUnavailable { command, .. }
            | GatewayError::RemoteRejected { command, .. }
            | GatewayError::DecodeError { command, .. }
            | GatewayError::InvalidArgument { command, .. } => command,
        }
    }

    /// Underlying reason text, without the command prefix
    pub fn reason(&self) -> &str {
        match self {
            GatewayError::RemoteUnavailable { reason, .. }
            | GatewayError::RemoteRejected { reason, .. }
            | GatewayError::DecodeError { reason, .. }
            | GatewayError::InvalidArgument { reason, .. } => reason,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::RemoteUnavailable { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, GatewayError::RemoteRejected { .. })
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

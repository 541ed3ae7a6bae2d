use std::time::Duration;
use thiserror::Error;

use crate::session::state::SessionState;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DAP request '{command}' failed: {message}{}", .hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default())]
    CommandFailed {
        command: String,
        message: String,
        hint: Option<String>,
    },

    #[error("Invalid session state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Adapter policy '{0}' does not support child sessions")]
    ChildSessionsUnsupported(&'static str),

    #[error("Unknown session: {0}")]
    SessionNotFound(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a policy-translated hint. The original backend message is
    /// always preserved; the hint is additive.
    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        match self {
            Self::CommandFailed {
                command, message, ..
            } => Self::CommandFailed {
                command,
                message,
                hint: Some(hint.into()),
            },
            other => other,
        }
    }

    /// Timeouts and command rejections fail only the waiting operation;
    /// everything else tears the session down.
    pub fn is_fatal_for_session(&self) -> bool {
        !matches!(
            self,
            Self::Timeout { .. } | Self::CommandFailed { .. } | Self::InvalidTransition { .. }
        )
    }
}

//! Error types for auralink-mcp.

use thiserror::Error;

use crate::protocol::{error_codes, AgentKind, ErrorObject};

/// Result type for auralink-mcp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for auralink-mcp.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural violation found while decoding an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No route exists for the requested agent.
    #[error("unroutable target: {0}")]
    UnroutableTarget(AgentKind),

    /// The receiving endpoint has no capability for the method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A capability handler failed.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The remote endpoint answered with an error envelope.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// No matching reply arrived before the deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller withdrew the call.
    #[error("call cancelled")]
    Cancelled,

    /// Bounded mailbox rejected the envelope.
    #[error("mailbox full: {0}")]
    QueueFull(AgentKind),

    /// An endpoint for this agent is already attached to the bus.
    #[error("agent already attached: {0}")]
    AlreadyAttached(AgentKind),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Invalid state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Reserved wire code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::MalformedEnvelope(_) => error_codes::INVALID_REQUEST,
            Error::Serialization(_) => error_codes::PARSE_ERROR,
            Error::UnroutableTarget(_) => error_codes::UNROUTABLE_TARGET,
            Error::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Error::Remote { code, .. } => *code,
            Error::Timeout(_) => error_codes::TIMEOUT,
            Error::Cancelled => error_codes::CANCELLED,
            Error::QueueFull(_) => error_codes::QUEUE_FULL,
            _ => error_codes::HANDLER_FAILURE,
        }
    }

    /// Convert into the structured error carried by an `error` envelope.
    pub fn to_error_object(&self) -> ErrorObject {
        let message = match self {
            Error::MethodNotFound(method) => format!("Method not found: {method}"),
            Error::HandlerFailure(message) | Error::InvalidParams(message) => message.clone(),
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorObject::new(self.code(), message)
    }

    /// Map an error envelope's payload back to the caller-facing error.
    ///
    /// Codes the bus synthesises come back as their dedicated variants;
    /// anything produced by the remote handler stays a [`Error::Remote`].
    pub fn from_error_object(target: AgentKind, error: ErrorObject) -> Self {
        match error.code {
            error_codes::UNROUTABLE_TARGET => Error::UnroutableTarget(target),
            error_codes::TIMEOUT => Error::Timeout(error.message),
            error_codes::CANCELLED => Error::Cancelled,
            error_codes::QUEUE_FULL => Error::QueueFull(target),
            code => Error::Remote {
                code,
                message: error.message,
            },
        }
    }
}

//! Error types for URD client operations

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport unreachable or the discovery handshake failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Missing required field '{field}' for {service}")]
    Validation { service: String, field: String },

    #[error("Invalid argument '{field}' for {service}: {reason}")]
    InvalidArgument {
        service: String,
        field: String,
        reason: String,
    },

    #[error("{service}() takes at most {max} positional arguments but {given} were given")]
    Arity {
        service: String,
        max: usize,
        given: usize,
    },

    #[error("Operation '{service}' timed out after {:.3}s", .elapsed.as_secs_f64())]
    Timeout { service: String, elapsed: Duration },

    #[error("Failed to parse {service} response: {reason}")]
    MalformedResponse {
        service: String,
        raw: String,
        reason: String,
    },

    #[error("{service} failed: {}", .message.as_deref().unwrap_or("no message"))]
    RemoteOperation {
        service: String,
        message: Option<String>,
        details: Option<serde_json::Value>,
    },

    #[error("{service} call failed: {source}")]
    Rpc {
        service: String,
        #[source]
        source: TransportError,
    },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Client is closed")]
    ClientClosed,

    #[error("Failed to subscribe to '{topic}': {source}")]
    Subscription {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ClientError {
    /// Name of the remote service this error relates to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            ClientError::Validation { service, .. }
            | ClientError::InvalidArgument { service, .. }
            | ClientError::Arity { service, .. }
            | ClientError::Timeout { service, .. }
            | ClientError::MalformedResponse { service, .. }
            | ClientError::RemoteOperation { service, .. }
            | ClientError::Rpc { service, .. } => Some(service),
            ClientError::UnknownService(name) => Some(name),
            _ => None,
        }
    }

    /// True when the failure happened before anything was sent on the wire.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ClientError::Validation { .. }
                | ClientError::InvalidArgument { .. }
                | ClientError::Arity { .. }
                | ClientError::UnknownService(_)
                | ClientError::ClientClosed
        )
    }
}

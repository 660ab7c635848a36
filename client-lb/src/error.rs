use thiserror::Error;

use crate::outcome::is_server_attributable_failure;

/// Failure delivered by the invocation pipeline for one attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    /// A response with a failure status, including business errors
    #[error("Remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Local failure that never reached the network
    #[error("Consumer side failure: {0}")]
    ConsumerInner(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum LbError {
    #[error("No available server for microservice {service}")]
    NoServerAvailable { service: String },

    #[error("Invocation already finished, not retrying")]
    InvocationFinished,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Unknown load balance strategy: {0}")]
    UnknownStrategy(String),

    #[error("Config error: {0}")]
    Config(#[from] mesh_core::ConfigError),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl LbError {
    /// Only failures that can be blamed on the server deserve another server.
    pub fn is_retryable(&self) -> bool {
        match self {
            LbError::Call(e) => is_server_attributable_failure(e),
            _ => false,
        }
    }
}

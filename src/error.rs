//! Error types for the relay.
//!
//! Every variant except [`RelayError::Spawn`] is channel-local: it is logged
//! or turned into an error reply, and never takes the process down.

use std::time::Duration;

use thiserror::Error;

use crate::ipc::FramingError;

/// Relay error taxonomy.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or truncated envelope on the host channel.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A payload that is not valid JSON or not a recognisable message shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The host asked for an action the catalog does not know.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A reply referenced an internal id with no pending request.
    #[error("No pending request for id {0}")]
    CorrelationMiss(u64),

    /// The MCP server exited or its pipes broke.
    #[error("MCP server unavailable: {0}")]
    SubprocessUnavailable(String),

    /// A pending request outlived its deadline.
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The MCP server could not be started at all.
    #[error("Failed to spawn MCP server `{command}`: {source}")]
    Spawn {
        /// Command that was attempted.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error outside the framing layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Parse(err.to_string())
    }
}

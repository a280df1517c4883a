//! Error types for the router core.

use std::time::Duration;

use rmcp::ErrorData as McpError;

/// Errors produced by hierarchy lookups, the server registry, and tool
/// dispatch. Everything user-visible is carried as a human-readable message
/// on the MCP tool-error channel; the router defines no wire-level codes of
/// its own.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("category not found: {0}")]
    PathNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no MCP server configured for tool: {0}")]
    NoServerForTool(String),

    #[error("server config not found: {0}")]
    ServerConfigMissing(String),

    #[error("<{server}> failed to connect: {message}")]
    ConnectFailed { server: String, message: String },

    #[error("<{server}> tool call failed: {message}")]
    CallFailed { server: String, message: String },

    #[error("<{server}> tool call timed out after {timeout:?}")]
    CallTimeout { server: String, timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<RouterError> for McpError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::PathNotFound(_)
            | RouterError::ToolNotFound(_)
            | RouterError::InvalidArguments(_)
            | RouterError::NoServerForTool(_)
            | RouterError::ServerConfigMissing(_) => McpError::invalid_params(err.to_string(), None),
            other => McpError::internal_error(other.to_string(), None),
        }
    }
}

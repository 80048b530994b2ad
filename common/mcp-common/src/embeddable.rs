//! Embeddable MCP trait for in-process execution
//!
//! [`EmbeddableMcp`] lets a host drive an MCP server directly, without a
//! transport in between. Errors keep the full [`McpError`] so an embedding
//! host sees the same error codes and `data` a remote client would.
//!
//! ```rust,ignore
//! use mcp_common::EmbeddableMcp;
//!
//! let tools = server.list_tools();
//! let result = server.call_tool("list_devices", serde_json::json!({})).await?;
//! ```

use async_trait::async_trait;
use rmcp::{
    model::{CallToolResult, ErrorCode, Tool},
    ErrorData as McpError,
};
use serde_json::Value;

/// Error type for embeddable MCP operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddableError {
    /// Tool was not found in the server
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Error reported by the server itself
    #[error("mcp error: {}", .0.message)]
    Mcp(McpError),
}

impl From<McpError> for EmbeddableError {
    fn from(err: McpError) -> Self {
        if err.code == ErrorCode::METHOD_NOT_FOUND {
            EmbeddableError::ToolNotFound(err.message.to_string())
        } else {
            EmbeddableError::Mcp(err)
        }
    }
}

impl EmbeddableError {
    /// The `kind` carried in the MCP error data, if any
    pub fn kind(&self) -> Option<&str> {
        match self {
            EmbeddableError::Mcp(err) => err.data.as_ref()?.get("kind")?.as_str(),
            _ => None,
        }
    }
}

/// Result type for embeddable MCP operations
pub type EmbeddableResult<T> = Result<T, EmbeddableError>;

/// Trait for MCP servers that can be executed in-process
///
/// Implementations must be `Send + Sync`; hosts call tools concurrently
/// from multiple tasks.
#[async_trait]
pub trait EmbeddableMcp: Send + Sync {
    /// Returns the server name for identification
    fn server_name(&self) -> &str;

    /// Returns a list of all available tools
    fn list_tools(&self) -> Vec<Tool>;

    /// Executes a tool by name with the given JSON parameters
    async fn call_tool(&self, name: &str, params: Value) -> EmbeddableResult<CallToolResult>;

    /// Returns an optional description of the server
    fn server_description(&self) -> Option<&str> {
        None
    }

    /// Returns the server version, if available
    fn server_version(&self) -> Option<&str> {
        None
    }
}

//! MCP Common - Shared utilities for MCP servers
//!
//! This crate provides the plumbing every MCP server in the workspace needs:
//!
//! - **Initialization**: tracing setup and stdio / TCP serving helpers
//! - **Results**: Helper functions for creating `CallToolResult` responses
//! - **Errors**: kind-tagged MCP errors so callers can branch on a stable
//!   machine-readable error kind instead of parsing messages
//! - **Embeddable**: [`EmbeddableMcp`] trait for in-process execution
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_common::{init_tracing, serve_stdio, json_success};
//!
//! init_tracing("droid_mcp", false)?;
//! serve_stdio(MyServer::new()).await?;
//! ```

pub mod embeddable;
pub mod error;
pub mod init;
pub mod result;

// Re-export commonly used items at crate root
pub use embeddable::{EmbeddableError, EmbeddableMcp, EmbeddableResult};
pub use error::{kind_error, IntoMcpError, ResultExt};
pub use init::{init_tracing, serve_stdio, serve_tcp};
#[cfg(feature = "image-processing")]
pub use result::image_success;
pub use result::json_success;

// Re-export rmcp types that are commonly needed
pub use rmcp::{
    model::{CallToolResult, ErrorCode, Tool},
    ErrorData as McpError,
};

// Re-export async_trait for implementing EmbeddableMcp
pub use async_trait::async_trait;

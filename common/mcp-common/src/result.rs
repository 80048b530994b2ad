//! Result helpers for MCP tool responses

use rmcp::{
    model::{CallToolResult, Content},
    ErrorData as McpError,
};
use serde::Serialize;

use crate::error::ResultExt;

/// Create a successful JSON response from any serializable data
///
/// ```rust,ignore
/// use mcp_common::json_success;
///
/// json_success(&devices)
/// ```
pub fn json_success<T: Serialize>(data: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(data).to_mcp_err()?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Create a successful response holding an image plus JSON metadata
///
/// The image is base64 encoded into an image content item, followed by the
/// pretty-printed `metadata` as a text item.
#[cfg(feature = "image-processing")]
pub fn image_success<T: Serialize>(
    bytes: &[u8],
    mime_type: &str,
    metadata: &T,
) -> Result<CallToolResult, McpError> {
    use base64::Engine;

    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let json = serde_json::to_string_pretty(metadata).to_mcp_err()?;
    Ok(CallToolResult::success(vec![
        Content::image(encoded, mime_type),
        Content::text(json),
    ]))
}

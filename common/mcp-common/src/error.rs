//! Error helpers for MCP servers
//!
//! Servers attach a stable error `kind` to an MCP error through
//! [`kind_error`]. The kind travels in the error's `data` object so clients
//! never have to parse the human-readable message.

use rmcp::{model::ErrorCode, ErrorData as McpError};
use serde_json::{json, Value};

/// Conversion of foreign errors into MCP errors
pub trait IntoMcpError {
    fn into_mcp_error(self) -> McpError;
}

impl IntoMcpError for serde_json::Error {
    fn into_mcp_error(self) -> McpError {
        McpError::internal_error(format!("JSON error: {}", self), None)
    }
}

/// `?`-friendly conversion for results whose error implements [`IntoMcpError`]
///
/// ```rust,ignore
/// use mcp_common::ResultExt;
///
/// let value = serde_json::to_value(&params).to_mcp_err()?;
/// ```
pub trait ResultExt<T> {
    fn to_mcp_err(self) -> Result<T, McpError>;
}

impl<T, E: IntoMcpError> ResultExt<T> for Result<T, E> {
    fn to_mcp_err(self) -> Result<T, McpError> {
        self.map_err(|e| e.into_mcp_error())
    }
}

/// Create an MCP error carrying a machine-readable `kind`
///
/// The error's `data` is always an object with a `kind` field. Entries of
/// `extra`, when it is an object, are merged next to it; this is where a
/// server puts request ids or other correlation data.
///
/// ```rust,ignore
/// use mcp_common::{kind_error, ErrorCode};
///
/// let err = kind_error(
///     ErrorCode::INVALID_PARAMS,
///     "DeviceNotFound",
///     "device \"emulator-5556\" is not attached",
///     Some(serde_json::json!({ "id": 7 })),
/// );
/// ```
pub fn kind_error(
    code: ErrorCode,
    kind: &str,
    message: impl Into<String>,
    extra: Option<Value>,
) -> McpError {
    let message = message.into();
    let mut data = json!({ "kind": kind, "message": message.clone() });
    if let (Some(Value::Object(extra)), Some(target)) = (extra, data.as_object_mut()) {
        for (key, value) in extra {
            target.entry(key).or_insert(value);
        }
    }
    McpError::new(code, message, Some(data))
}

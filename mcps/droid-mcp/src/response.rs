//! Mapping of command results onto MCP tool responses

use mcp_common::{image_success, json_success, kind_error, CallToolResult, ErrorCode, McpError};
use serde_json::{json, Value};

use crate::dispatcher::{CommandResult, Outcome, Payload, RequestState};
use crate::error::ErrorKind;

impl CommandResult {
    /// Captures become image content plus JSON metadata, other payloads
    /// pretty JSON text
    ///
    /// Rejected requests use the JSON-RPC codes for unknown methods and
    /// invalid params. Every other failure is an internal error whose
    /// `data` carries the request id, error kind and message.
    pub fn into_call_result(self) -> Result<CallToolResult, McpError> {
        let CommandResult {
            id,
            state,
            device,
            outcome,
            ..
        } = self;

        match outcome {
            Outcome::Result(Payload::Capture(capture)) => {
                image_success(&capture.data, &capture.mime_type, &capture.summary())
            }
            Outcome::Result(payload) => json_success(&payload),
            Outcome::Error(error) => {
                let code = match (state, error.kind) {
                    (RequestState::Rejected, ErrorKind::UnknownMethod) => ErrorCode::METHOD_NOT_FOUND,
                    (RequestState::Rejected, kind) if kind.is_rejection() => ErrorCode::INVALID_PARAMS,
                    _ => ErrorCode::INTERNAL_ERROR,
                };

                let mut extra = json!({ "id": id });
                if let (Some(device), Value::Object(map)) = (device, &mut extra) {
                    map.insert("device".into(), Value::String(device));
                }
                Err(kind_error(code, error.kind.as_str(), error.message, Some(extra)))
            }
        }
    }
}

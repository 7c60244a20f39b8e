//! Wire types for the tool-dispatch protocol.
//!
//! Communication is newline-delimited JSON over a bidirectional
//! stream. The client sends `{tool, arguments}` requests; the server
//! answers each with exactly one `{result}` or `{error}` envelope. A
//! request-level error never terminates the stream.

use serde::{Deserialize, Serialize};

/// A tool-invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Name of the tool to invoke.
    pub tool: String,
    /// Tool arguments; validated against the tool's declared schema
    /// before dispatch.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A response envelope: exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Structured error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

/// The error half of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResponse {
    /// Create a success response.
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(ToolErrorBody {
                code: code.to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Error codes returned in the error envelope.
pub mod error_codes {
    /// The named tool is not declared.
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
    /// Arguments failed schema validation; no engine operation ran.
    pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
    /// The referenced knowledgebase does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// A wrapped lower-level failure; the message is preserved.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_arguments_to_null() {
        let req: ToolRequest =
            serde_json::from_str(r#"{"tool": "list_knowledgebases"}"#).expect("parse");
        assert_eq!(req.tool, "list_knowledgebases");
        assert!(req.arguments.is_null());
    }

    #[test]
    fn test_response_envelope_is_exclusive() {
        let ok = ToolResponse::success(serde_json::json!({"x": 1}));
        let json = serde_json::to_string(&ok).expect("serialize");
        assert!(json.contains("result"));
        assert!(!json.contains("error"));

        let err = ToolResponse::failure(error_codes::NOT_FOUND, "missing");
        let json = serde_json::to_string(&err).expect("serialize");
        assert!(!json.contains("result"));
        assert!(json.contains("NOT_FOUND"));
    }
}

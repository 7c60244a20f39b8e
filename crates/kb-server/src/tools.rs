//! Tool dispatch: validation and routing.
//!
//! A thin shell over the engine. Every request is validated against
//! the tool's declared input schema (required fields, types, enum
//! membership, bounds) before any engine call; a validation failure
//! produces `INVALID_PARAMETERS` naming the offending field and has no
//! side effects. Engine failures map into the error taxonomy with
//! their messages preserved. Caller mistakes are logged at debug, not
//! error -- they are not our bugs.

use std::sync::Arc;

use serde_json::{json, Value};

use kb_core::error::KbError;
use kb_core::search::SearchRequest;
use kb_core::types::SourceKind;
use kb_core::KnowledgeEngine;

use crate::protocol::{error_codes, ToolRequest, ToolResponse};

/// Document types accepted by `search_knowledgebases`.
const DOCUMENT_TYPES: [&str; 8] = [
    "pdf", "docx", "pptx", "xlsx", "html", "markdown", "text", "audio",
];

/// Validation failure: the offending field plus a message.
struct Invalid {
    field: &'static str,
    message: String,
}

impl Invalid {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }

    fn into_response(self) -> ToolResponse {
        ToolResponse::failure(
            error_codes::INVALID_PARAMETERS,
            format!("invalid parameter '{}': {}", self.field, self.message),
        )
    }
}

/// Routes validated tool requests to engine operations.
pub struct ToolDispatcher {
    engine: Arc<KnowledgeEngine>,
}

impl ToolDispatcher {
    /// Create a dispatcher over the shared engine.
    pub fn new(engine: Arc<KnowledgeEngine>) -> Self {
        Self { engine }
    }

    /// Names of all declared tools.
    pub fn tool_names() -> [&'static str; 4] {
        [
            "list_knowledgebases",
            "search_knowledgebases",
            "get_knowledgebase_stats",
            "open_knowledgebase_manager",
        ]
    }

    /// Dispatch one request. Always returns a response; never panics
    /// the serve loop.
    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        let response = match request.tool.as_str() {
            "list_knowledgebases" => self.list_knowledgebases(),
            "search_knowledgebases" => self.search_knowledgebases(&request.arguments).await,
            "get_knowledgebase_stats" => self.get_knowledgebase_stats(&request.arguments),
            "open_knowledgebase_manager" => self.open_knowledgebase_manager(),
            other => {
                tracing::debug!(tool = other, "unknown tool requested");
                ToolResponse::failure(
                    error_codes::TOOL_NOT_FOUND,
                    format!("unknown tool: {other}"),
                )
            }
        };

        if let Some(error) = &response.error {
            tracing::debug!(
                tool = %request.tool,
                code = %error.code,
                message = %error.message,
                "tool request failed"
            );
        }
        response
    }

    fn list_knowledgebases(&self) -> ToolResponse {
        match self.engine.registry().list() {
            Ok(summaries) => ToolResponse::success(json!({ "knowledgebases": summaries })),
            Err(e) => map_engine_error(e),
        }
    }

    async fn search_knowledgebases(&self, args: &Value) -> ToolResponse {
        let query = match require_string(args, "query") {
            Ok(q) => q,
            Err(invalid) => return invalid.into_response(),
        };
        if query.trim().is_empty() {
            return Invalid::new("query", "must be a non-empty string").into_response();
        }

        let kb_filter = match optional_string(args, "knowledgebase_name") {
            Ok(v) => v,
            Err(invalid) => return invalid.into_response(),
        };

        let type_filter = match optional_string(args, "document_type") {
            Ok(Some(raw)) => {
                if !DOCUMENT_TYPES.contains(&raw.as_str()) {
                    return Invalid::new(
                        "document_type",
                        format!("must be one of {DOCUMENT_TYPES:?}, got {raw:?}"),
                    )
                    .into_response();
                }
                Some(SourceKind::from_str_lossy(&raw))
            }
            Ok(None) => None,
            Err(invalid) => return invalid.into_response(),
        };

        let max_results = match optional_integer(args, "max_results", 1, 200) {
            Ok(v) => v.map(|n| n as usize),
            Err(invalid) => return invalid.into_response(),
        };

        let exclude_tests = match optional_bool(args, "exclude_tests") {
            Ok(v) => v.unwrap_or(false),
            Err(invalid) => return invalid.into_response(),
        };

        let request = SearchRequest {
            query,
            kb_filter,
            type_filter,
            exclude_tests,
            max_results,
        };

        match self.engine.search_engine().search(&request).await {
            Ok(response) => ToolResponse::success(json!({
                "results": response.results,
                "total": response.total,
                "query_ms": response.query_ms,
            })),
            Err(e) => map_engine_error(e),
        }
    }

    fn get_knowledgebase_stats(&self, args: &Value) -> ToolResponse {
        let name = match require_string(args, "name") {
            Ok(n) => n,
            Err(invalid) => return invalid.into_response(),
        };
        if name.trim().is_empty() {
            return Invalid::new("name", "must be a non-empty string").into_response();
        }

        match self.engine.registry().stats(&name) {
            Ok(stats) => match serde_json::to_value(&stats) {
                Ok(value) => ToolResponse::success(value),
                Err(e) => ToolResponse::failure(error_codes::INTERNAL_ERROR, e.to_string()),
            },
            Err(e) => map_engine_error(e),
        }
    }

    fn open_knowledgebase_manager(&self) -> ToolResponse {
        let url = self.engine.config().search.manager_url.clone();
        ToolResponse::success(json!({
            "url": url,
            "message": format!("Open {url} in a browser to manage knowledgebases."),
        }))
    }
}

/// Map an engine error into the dispatch taxonomy, preserving the
/// message.
fn map_engine_error(error: KbError) -> ToolResponse {
    match &error {
        KbError::NotFound { .. } => {
            ToolResponse::failure(error_codes::NOT_FOUND, error.to_string())
        }
        KbError::InvalidInput { .. } => {
            ToolResponse::failure(error_codes::INVALID_PARAMETERS, error.to_string())
        }
        _ => {
            tracing::warn!(error = %error, "engine operation failed");
            ToolResponse::failure(error_codes::INTERNAL_ERROR, error.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Schema validation helpers
// ---------------------------------------------------------------------------

fn as_object(args: &Value) -> Option<&serde_json::Map<String, Value>> {
    match args {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn require_string(args: &Value, field: &'static str) -> Result<String, Invalid> {
    let map = match args {
        Value::Null => None,
        other => as_object(other),
    };
    let Some(map) = map else {
        return Err(Invalid::new(field, "arguments must be an object"));
    };
    match map.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Invalid::new(
            field,
            format!("must be a string, got {}", type_name(other)),
        )),
        None => Err(Invalid::new(field, "is required")),
    }
}

fn optional_string(args: &Value, field: &'static str) -> Result<Option<String>, Invalid> {
    match as_object(args).and_then(|map| map.get(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Invalid::new(
            field,
            format!("must be a string, got {}", type_name(other)),
        )),
    }
}

fn optional_bool(args: &Value, field: &'static str) -> Result<Option<bool>, Invalid> {
    match as_object(args).and_then(|map| map.get(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(Invalid::new(
            field,
            format!("must be a boolean, got {}", type_name(other)),
        )),
    }
}

fn optional_integer(
    args: &Value,
    field: &'static str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, Invalid> {
    match as_object(args).and_then(|map| map.get(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let Some(value) = n.as_i64() else {
                return Err(Invalid::new(field, "must be an integer"));
            };
            if value < min || value > max {
                return Err(Invalid::new(
                    field,
                    format!("must be within {min}..={max}, got {value}"),
                ));
            }
            Ok(Some(value))
        }
        Some(other) => Err(Invalid::new(
            field,
            format!("must be an integer, got {}", type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

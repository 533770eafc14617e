//! MCP protocol response helpers.

use rmcp::model::{CallToolResult, Content};
use rmcp::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};

/// Output format for tool responses.
#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// JSON format (default).
    #[default]
    Json,
    /// TOON (Token-Oriented Object Notation), fewer tokens for tabular rows.
    Toon,
}

/// Tool response that serializes as the raw inner value.
///
/// # Example
///
/// ```ignore
/// Response::json(outcome).into()
/// Response(outcome, Some(OutputFormat::Toon)).into_call_result(true)
/// ```
pub struct Response<T>(pub T, pub Option<OutputFormat>);

impl<T> Response<T> {
    pub fn json(data: T) -> Self {
        Response(data, None)
    }
}

impl<T: Serialize> Response<T> {
    /// Renders the tool result; `is_error` marks a failed invocation whose
    /// payload still carries partial rows.
    pub fn into_call_result(self, is_error: bool) -> Result<CallToolResult, rmcp::model::ErrorData> {
        let content = match self.1.unwrap_or_default() {
            OutputFormat::Json => {
                let value = serde_json::to_value(&self.0).map_err(|e| {
                    rmcp::model::ErrorData::internal_error(
                        format!("Failed to serialize response: {}", e),
                        None,
                    )
                })?;
                Content::json(value)?
            }
            OutputFormat::Toon => {
                let toon_str = serde_toon::to_string(&self.0)
                    .unwrap_or_else(|e| format!("TOON serialization error: {}", e));
                Content::text(toon_str)
            }
        };

        Ok(if is_error {
            CallToolResult::error(vec![content])
        } else {
            CallToolResult::success(vec![content])
        })
    }
}

impl<T: Serialize> Serialize for Response<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T: Serialize> From<Response<T>> for Result<CallToolResult, rmcp::model::ErrorData> {
    fn from(response: Response<T>) -> Self {
        response.into_call_result(false)
    }
}

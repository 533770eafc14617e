//! Query tools: read and write invocations plus protocol-level cancel.
//!
//! The rmcp request cancellation token is handed to the router as the
//! invocation's withdrawal signal, so a client-side cancel aborts the query.

use std::time::Duration;

use rmcp::{
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::{self, JsonSchema},
    service::RequestContext,
    tool, tool_router, ErrorData as McpError, RoleServer,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::ErrorKind;
use crate::mcp::protocol::{OutputFormat, Response};
use crate::mcp::server::McpServer;
use crate::router::{InvocationStatus, QueryRequest};
use crate::row::Row;
use crate::statement::AccessMode;
use crate::transcoder::{ErrorFrame, InvocationOutcome};

// ============================================================================
// Parameter Types
// ============================================================================

/// Parameters for the query and execute tools.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryParams {
    /// Logical backend id (see list_backends).
    pub backend_id: String,
    /// Statement in the backend's own language (SQL or Cypher).
    pub statement: String,
    /// Positional parameters: $1..$N (PostgreSQL), ? (MySQL/MariaDB), $p1..$pN (graph).
    #[serde(default)]
    pub parameters: Vec<JsonValue>,
    /// Caller-chosen request id, usable with cancel_query. Defaults to a fresh ULID.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Wall-clock limit in milliseconds (default: gateway invocation timeout).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Output format: "json" (default) or "toon".
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

/// Parameters for cancel_query tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelQueryParams {
    /// Request id of the in-flight invocation.
    pub request_id: String,
}

// ============================================================================
// Response Types
// ============================================================================

/// Collected invocation, as returned to the client.
#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub request_id: String,
    pub backend_id: String,
    pub status: InvocationStatus,
    pub row_count: u64,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFrame>,
}

#[derive(Debug, Serialize)]
pub struct CancelQueryResult {
    pub request_id: String,
    /// Whether an in-flight invocation with this id was found.
    pub cancelled: bool,
}

impl QueryResult {
    fn new(backend_id: String, outcome: InvocationOutcome) -> Self {
        Self {
            request_id: outcome.request_id,
            backend_id,
            status: outcome.status,
            row_count: outcome.row_count,
            rows: outcome.rows,
            error: outcome.error,
        }
    }
}

/// Request-level rejections surface as protocol errors; anything that got
/// as far as a backend is reported in the payload with its partial rows.
fn is_request_error(error: &ErrorFrame) -> bool {
    matches!(
        error.kind,
        ErrorKind::UnknownBackend | ErrorKind::ProtocolViolation | ErrorKind::AccessDenied
    )
}

fn executed_message() -> Row {
    Row::from_iter([(
        "message".to_string(),
        json!("Statement executed successfully"),
    )])
}

// ============================================================================
// Tool Router
// ============================================================================

#[tool_router(router = query_tools, vis = "pub(crate)")]
impl McpServer {
    /// Run a read-only statement and collect its rows.
    #[tool(
        description = "Run a read-only statement (SQL or Cypher) on a backend and return its rows. Write statements are rejected."
    )]
    pub async fn query(
        &self,
        Parameters(params): Parameters<QueryParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_invocation(params, AccessMode::Read, context).await
    }

    /// Run a data-modifying statement and collect the affected rows.
    #[tool(
        description = "Run a data-modifying statement on a backend. Requires write access to be enabled for that backend. Returns affected rows where the dialect supports RETURNING."
    )]
    pub async fn execute(
        &self,
        Parameters(params): Parameters<QueryParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_invocation(params, AccessMode::Write, context).await
    }

    /// Cancel an in-flight invocation.
    #[tool(description = "Cancel an in-flight query or execute call by its request_id.")]
    pub async fn cancel_query(
        &self,
        Parameters(params): Parameters<CancelQueryParams>,
    ) -> Result<CallToolResult, McpError> {
        let cancelled = self.ctx.router.cancel(&params.request_id);
        Response::json(CancelQueryResult {
            request_id: params.request_id,
            cancelled,
        })
        .into()
    }
}

impl McpServer {
    async fn run_invocation(
        &self,
        params: QueryParams,
        mode: AccessMode,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let mut request = QueryRequest::new(params.backend_id.clone(), params.statement)
            .with_parameters(params.parameters)
            .with_mode(mode);
        if let Some(request_id) = params.request_id {
            request = request.with_request_id(request_id);
        }
        if let Some(timeout_ms) = params.timeout_ms {
            request = request.with_timeout(Duration::from_millis(timeout_ms));
        }

        tracing::info!(
            request_id = %request.request_id,
            backend = %request.backend_id,
            ?mode,
            "Running invocation"
        );

        let outcome = self.ctx.router.invoke(request, context.ct).outcome().await;
        let mut result = QueryResult::new(params.backend_id, outcome);

        if let Some(error) = &result.error {
            if is_request_error(error) {
                return Err(error.clone().into());
            }
            return Response(result, params.format).into_call_result(true);
        }

        if mode == AccessMode::Write && result.rows.is_empty() {
            result.rows.push(executed_message());
        }
        Response(result, params.format).into()
    }
}

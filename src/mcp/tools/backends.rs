//! Backend discovery tools: configured backends, live status and schemas.

use rmcp::{
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::{self, JsonSchema},
    service::RequestContext,
    tool, tool_router, ErrorData as McpError, RoleServer,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{AccessSettings, BackendKind};
use crate::mcp::protocol::{OutputFormat, Response};
use crate::mcp::server::McpServer;
use crate::router::{ActiveSnapshot, BackendStatus};
use crate::schema::{self, Schema};

// ============================================================================
// Parameter Types
// ============================================================================

/// Parameters for list_backends tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListBackendsParams {
    /// Include in-flight invocations (default: false).
    #[serde(default)]
    pub include_active: bool,
    /// Output format: "json" (default) or "toon".
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

/// Parameters for describe_schema tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DescribeSchemaParams {
    /// Logical backend id.
    pub backend_id: String,
    /// Output format: "json" (default) or "toon".
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub kind: BackendKind,
    /// Connection string with credentials masked.
    pub connect: String,
    pub max_concurrency: usize,
    pub connection_limit: usize,
    pub access: AccessSettings,
    pub status: Option<BackendStatus>,
}

#[derive(Debug, Serialize)]
pub struct ListBackendsResult {
    pub backends: Vec<BackendInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<Vec<ActiveSnapshot>>,
}

#[derive(Debug, Serialize)]
pub struct DescribeSchemaResult {
    pub backend_id: String,
    pub kind: BackendKind,
    pub schema: Schema,
}

// ============================================================================
// Tool Router
// ============================================================================

#[tool_router(router = backend_tools, vis = "pub(crate)")]
impl McpServer {
    /// List configured backends with admission and pool status.
    #[tool(
        description = "List configured database backends with kind, access switches and live admission/pool status."
    )]
    pub async fn list_backends(
        &self,
        Parameters(params): Parameters<ListBackendsParams>,
    ) -> Result<CallToolResult, McpError> {
        let router = &self.ctx.router;
        let mut statuses = router.status();

        let backends = router
            .registry()
            .iter()
            .map(|handle| {
                let d = &handle.descriptor;
                let status = statuses
                    .iter()
                    .position(|s| s.id == d.id)
                    .map(|idx| statuses.swap_remove(idx));
                BackendInfo {
                    id: d.id.clone(),
                    kind: d.kind,
                    connect: d.connect.redacted(),
                    max_concurrency: d.max_concurrency,
                    connection_limit: d.connection_limit,
                    access: d.access,
                    status,
                }
            })
            .collect();

        let active = params.include_active.then(|| router.active());
        Response(ListBackendsResult { backends, active }, params.format).into()
    }

    /// Describe a backend's schema: labels and relationships, or tables.
    #[tool(
        description = "Describe a backend's schema. Graph backends return node labels with property keys and relationship types; SQL backends return tables with columns, foreign keys and constraints."
    )]
    pub async fn describe_schema(
        &self,
        Parameters(params): Parameters<DescribeSchemaParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let router = &self.ctx.router;
        let kind = router.registry().resolve(&params.backend_id)?.descriptor.kind;

        tracing::info!(backend = %params.backend_id, "Running describe_schema tool");
        let deadline = Instant::now() + router.settings().invocation_timeout;
        let schema = schema::describe(router, &params.backend_id, deadline, &context.ct).await?;

        Response(
            DescribeSchemaResult {
                backend_id: params.backend_id,
                kind,
                schema,
            },
            params.format,
        )
        .into()
    }
}

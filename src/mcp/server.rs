//! MCP server implementation for dbgate.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, ServerHandler},
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool_handler,
};

use crate::context::Context;

/// dbgate MCP server.
///
/// Routes tool calls to the configured graph and SQL backends, enforcing
/// per-backend admission limits and read/write switches.
#[derive(Clone)]
pub struct McpServer {
    pub(crate) ctx: Arc<Context>,
    tool_router: ToolRouter<McpServer>,
}

impl McpServer {
    pub fn new(ctx: Context) -> Self {
        tracing::info!(backends = ctx.router.registry().len(), "Initializing dbgate MCP server");

        Self {
            ctx: Arc::new(ctx),
            tool_router: Self::tool_router(),
        }
    }

    /// Build the combined tool router from all tool modules.
    fn tool_router() -> ToolRouter<Self> {
        Self::backend_tools() + Self::query_tools()
    }

    /// Get direct access to the context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

// ============================================================================
// Server Handler
// ============================================================================

#[tool_handler]
impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                r#"dbgate - Multi-backend query gateway

Runs statements against configured graph (Cypher) and SQL (PostgreSQL, MySQL, MariaDB) backends.

## Getting Started

1. **list_backends** - See backend ids, kinds, access switches and load
2. **describe_schema** - Inspect labels/relationships or tables before querying

## Query Tools

- **query** - Read-only statement; write statements are rejected
- **execute** - Data-modifying statement; needs write access on the backend
- **cancel_query** - Abort an in-flight call by its request_id

## Parameters

Statements take positional parameters: `$1..$N` on PostgreSQL, `?` on MySQL/MariaDB,
`$p1..$pN` on graph backends. Failed calls still return the rows produced before the error.
"#
                .to_string(),
            ),
        }
    }
}

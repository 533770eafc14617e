//! `dbgate mcp`: serve the gateway over stdio until the client disconnects.

use color_eyre::{eyre::eyre, Result};
use rmcp::ServiceExt;

use crate::context::Context;
use crate::mcp::McpServer;

use super::App;

impl App {
    pub async fn run_mcp(&self) -> Result<()> {
        let ctx = Context::from(self.load_config()?).await?;
        let router = ctx.router.clone();
        tracing::info!(backends = router.registry().len(), "Gateway ready, serving MCP on stdio");

        let service = McpServer::new(ctx)
            .serve(rmcp::transport::stdio())
            .await
            .map_err(|e| eyre!("Failed to start MCP server: {}", e))?;

        // Drain the gateway whether the session ended cleanly or not.
        let session = service.waiting().await;
        let summary = router.shutdown().await;
        tracing::info!(
            cancelled = summary.cancelled,
            pools = summary.pools.len(),
            "Gateway stopped"
        );

        session.map_err(|e| eyre!("MCP session ended with error: {}", e))?;
        Ok(())
    }
}

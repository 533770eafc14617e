//! Check command: boot, verify every backend, shut down.

use color_eyre::Result;

use crate::context::Context;

use super::App;

impl App {
    pub async fn run_check(&self) -> Result<()> {
        let mut config = self.load_config()?;
        config.gateway.verify_on_startup = true;

        let ctx = Context::from(config).await?;
        let backends = ctx.router.registry().len();
        ctx.router.shutdown().await;

        println!("{} backend(s) reachable", backends);
        Ok(())
    }
}

//! Application context: the gateway assembled from configuration.

use std::sync::Arc;

use crate::config::Config;
use crate::error::GatewayError;
use crate::registry::Registry;
use crate::router::{Router, RouterSettings};

/// Root application context shared by the protocol layer.
#[derive(Clone)]
pub struct Context {
    /// Query router owning the registry and every pool.
    pub router: Router,
    /// Application configuration.
    pub config: Arc<Config>,
}

impl Context {
    /// Creates a context around an already-built router.
    pub fn new(router: Router, config: Config) -> Self {
        Self {
            router,
            config: Arc::new(config),
        }
    }

    /// Builds registry, pools and router from configuration.
    ///
    /// Verifies every backend first when `verify_on_startup` is set; a
    /// backend that cannot be reached aborts startup.
    pub async fn from(config: Config) -> Result<Self, GatewayError> {
        config.validate()?;

        let mut registry = Registry::new();
        for backend in &config.backends {
            registry.register_descriptor(backend.descriptor())?;
        }

        if config.gateway.verify_on_startup {
            tracing::info!(backends = registry.len(), "Verifying backends");
            if let Err(e) = registry.verify().await {
                tracing::error!(error = %e, "Backend verification failed");
                for handle in registry.iter() {
                    handle.pool.shutdown(config.gateway.shutdown_grace()).await;
                }
                return Err(e);
            }
        }

        let router = Router::new(registry, RouterSettings::from(&config.gateway));
        Ok(Self::new(router, config))
    }
}

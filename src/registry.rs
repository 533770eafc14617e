//! Backend registry: logical backend id to descriptor, adapter and pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::backend::BackendDescriptor;
use crate::backends::{adapter_for, Adapter};
use crate::error::{AdapterError, GatewayError};
use crate::pool::Pool;

/// Everything needed to run a statement against one backend.
#[derive(Clone)]
pub struct BackendHandle {
    pub descriptor: Arc<BackendDescriptor>,
    pub adapter: Arc<dyn Adapter>,
    pub pool: Pool,
}

impl BackendHandle {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Registered backends, in registration order.
///
/// Populated at boot and read-only afterwards.
#[derive(Default)]
pub struct Registry {
    backends: Vec<BackendHandle>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend with an explicit adapter.
    pub fn register(
        &mut self,
        descriptor: BackendDescriptor,
        adapter: Arc<dyn Adapter>,
    ) -> Result<&BackendHandle, GatewayError> {
        if self.index.contains_key(&descriptor.id) {
            return Err(GatewayError::DuplicateBackend(descriptor.id));
        }

        tracing::info!(
            backend = %descriptor.id,
            kind = %descriptor.kind,
            connect = %descriptor.connect,
            max_concurrency = descriptor.max_concurrency,
            connection_limit = descriptor.connection_limit,
            "Registered backend"
        );

        let pool = Pool::new(&descriptor, Arc::clone(&adapter));
        let slot = self.backends.len();
        self.index.insert(descriptor.id.clone(), slot);
        self.backends.push(BackendHandle {
            descriptor: Arc::new(descriptor),
            adapter,
            pool,
        });
        Ok(&self.backends[slot])
    }

    /// Registers a backend using the driver adapter for its kind.
    pub fn register_descriptor(
        &mut self,
        descriptor: BackendDescriptor,
    ) -> Result<&BackendHandle, GatewayError> {
        let adapter = adapter_for(&descriptor);
        self.register(descriptor, adapter)
    }

    pub fn resolve(&self, id: &str) -> Result<&BackendHandle, GatewayError> {
        self.index
            .get(id)
            .map(|&slot| &self.backends[slot])
            .ok_or_else(|| GatewayError::UnknownBackend(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendHandle> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Acquires one connection per backend and health-checks it.
    ///
    /// Stops at the first backend that cannot be reached.
    pub async fn verify(&self) -> Result<(), GatewayError> {
        for handle in &self.backends {
            let deadline = Instant::now() + handle.descriptor.pool.acquire_timeout;
            let mut conn = handle.pool.acquire(deadline).await?;
            let healthy = handle.adapter.health_check(conn.connection_mut()).await;
            conn.release(healthy);

            if !healthy {
                return Err(AdapterError::io(handle.id(), "health check failed").into());
            }
            tracing::info!(backend = %handle.id(), "Backend verified");
        }
        Ok(())
    }
}

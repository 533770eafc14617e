//! Backend adapters: one driver per backend kind behind a shared contract.
//!
//! - [`Adapter`] - per-backend factory for connections plus the operations the
//!   router invokes (`execute`, `cancel`, `health_check`)
//! - [`Connection`] - one live driver session, owned by a single invocation at a time
//! - [`CancelHandle`] - detached handle able to abort the statement running on a connection
//!
//! Use [`adapter_for`] to build the adapter matching a descriptor's kind.

pub mod graph;
pub mod mariadb;
pub mod mysql;
pub mod postgres;

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::backend::{BackendDescriptor, BackendKind};
use crate::error::AdapterError;
use crate::row::RowStream;

/// A live driver session.
///
/// Never shared between concurrent invocations; the pool hands it to exactly
/// one holder at a time.
#[async_trait]
pub trait Connection: Send {
    /// Executes a statement and returns its rows lazily.
    ///
    /// The stream borrows the connection; dropping it before exhaustion
    /// abandons the remaining rows.
    async fn execute(
        &mut self,
        statement: &str,
        params: &[JsonValue],
    ) -> Result<RowStream<'_>, AdapterError>;

    /// Returns a handle able to abort whatever this connection is running.
    fn cancel_handle(&self) -> CancelHandle;

    /// Round-trips a trivial statement.
    async fn health_check(&mut self) -> bool;

    /// Closes the session gracefully.
    async fn close(self: Box<Self>);
}

/// Driver-specific abort of an in-flight statement.
#[async_trait]
pub trait CancelQuery: Send + Sync {
    async fn cancel(&self) -> Result<(), AdapterError>;
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The backend accepted the abort request.
    Acknowledged,
    /// The driver has no way to abort a running statement.
    Unsupported,
    /// The abort request itself failed.
    Failed(AdapterError),
}

/// Handle to cancel the statement running on one connection.
pub struct CancelHandle {
    inner: Option<Box<dyn CancelQuery>>,
}

impl CancelHandle {
    pub fn new(cancel: impl CancelQuery + 'static) -> Self {
        Self {
            inner: Some(Box::new(cancel)),
        }
    }

    /// Handle for drivers without an abort primitive.
    pub fn unsupported() -> Self {
        Self { inner: None }
    }

    pub async fn cancel(&self) -> CancelOutcome {
        match &self.inner {
            None => CancelOutcome::Unsupported,
            Some(inner) => match inner.cancel().await {
                Ok(()) => CancelOutcome::Acknowledged,
                Err(e) => CancelOutcome::Failed(e),
            },
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("supported", &self.inner.is_some())
            .finish()
    }
}

/// Uniform streaming-query interface over one backend.
///
/// The provided methods delegate to the connection; adapters override them
/// only when the driver needs something beyond that.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Opens a new driver session.
    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError>;

    /// Rewrites a write-mode statement so it returns the affected rows.
    fn prepare_write<'s>(&self, statement: &'s str) -> Cow<'s, str> {
        Cow::Borrowed(statement)
    }

    async fn execute<'c>(
        &self,
        connection: &'c mut dyn Connection,
        statement: &str,
        params: &[JsonValue],
    ) -> Result<RowStream<'c>, AdapterError> {
        connection.execute(statement, params).await
    }

    async fn cancel(&self, handle: &CancelHandle) -> CancelOutcome {
        handle.cancel().await
    }

    async fn health_check(&self, connection: &mut dyn Connection) -> bool {
        connection.health_check().await
    }
}

/// Builds the adapter for a descriptor's backend kind.
pub fn adapter_for(descriptor: &BackendDescriptor) -> Arc<dyn Adapter> {
    match descriptor.kind {
        BackendKind::Graph => Arc::new(graph::GraphAdapter::new(descriptor)),
        BackendKind::Postgres => Arc::new(postgres::PostgresAdapter::new(descriptor)),
        BackendKind::MySql => Arc::new(mysql::MySqlAdapter::new(descriptor)),
        BackendKind::MariaDb => Arc::new(mariadb::MariaDbAdapter::new(descriptor)),
    }
}

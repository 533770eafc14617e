//! Per-invocation start and end events for the telemetry owner.

use std::time::Duration;

use crate::error::ErrorKind;
use crate::router::InvocationStatus;
use crate::statement::AccessMode;

#[derive(Debug, Clone)]
pub struct InvocationStarted {
    pub request_id: String,
    pub backend_id: String,
    pub mode: AccessMode,
}

#[derive(Debug, Clone)]
pub struct InvocationFinished {
    pub request_id: String,
    pub backend_id: String,
    pub latency: Duration,
    pub status: InvocationStatus,
    pub rows: u64,
    pub error: Option<ErrorKind>,
}

/// Receives invocation lifecycle events.
///
/// Called inline on the invocation task, so implementations must not block.
pub trait InvocationObserver: Send + Sync {
    fn on_start(&self, event: &InvocationStarted);
    fn on_end(&self, event: &InvocationFinished);
}

/// Emits invocation events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl InvocationObserver for TracingObserver {
    fn on_start(&self, event: &InvocationStarted) {
        tracing::debug!(
            request_id = %event.request_id,
            backend = %event.backend_id,
            mode = ?event.mode,
            "Invocation started"
        );
    }

    fn on_end(&self, event: &InvocationFinished) {
        let latency_ms = event.latency.as_millis() as u64;
        match event.status {
            InvocationStatus::Completed => tracing::info!(
                request_id = %event.request_id,
                backend = %event.backend_id,
                latency_ms,
                rows = event.rows,
                "Invocation completed"
            ),
            InvocationStatus::Failed | InvocationStatus::Cancelled => tracing::warn!(
                request_id = %event.request_id,
                backend = %event.backend_id,
                latency_ms,
                rows = event.rows,
                status = ?event.status,
                error = ?event.error,
                "Invocation did not complete"
            ),
        }
    }
}

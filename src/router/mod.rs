//! Query router: resolve, admit, dispatch and supervise invocations.
//!
//! Each invocation runs on its own task and walks
//! `Received -> Admitted -> Dispatched -> Streaming` before exactly one of
//! `Completed`, `Failed` or `Cancelled`. Nothing is retried here; every
//! failure reaches the caller as a terminal frame carrying the request id.

mod admission;
mod invocation;

pub use admission::{Admission, AdmissionGate, GateStatus};
pub use invocation::{
    ActiveInvocation, ActiveSnapshot, InvocationState, InvocationStatus, QueryRequest,
};

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendKind;
use crate::backends::{Adapter, CancelOutcome, Connection};
use crate::config::GatewayConfig;
use crate::error::{AdapterError, CancelReason, GatewayError};
use crate::observe::{InvocationFinished, InvocationObserver, InvocationStarted, TracingObserver};
use crate::pool::{PoolStats, PoolStatus, ShutdownReport};
use crate::registry::{BackendHandle, Registry};
use crate::statement::{classify, AccessMode, StatementClass};
use crate::transcoder::{self, FrameSink, InvocationStream, PumpOutcome};
use invocation::{ActiveGuard, ActiveSet};

/// Router timing and buffering knobs.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Deadline applied to requests that carry none.
    pub invocation_timeout: Duration,
    /// Frames buffered ahead of a slow consumer.
    pub frame_buffer: usize,
    /// How long shutdown waits for in-flight invocations.
    pub shutdown_grace: Duration,
    /// How long a cancelled invocation waits for the backend to acknowledge the abort.
    pub cancel_grace: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(30),
            frame_buffer: 256,
            shutdown_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl From<&GatewayConfig> for RouterSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            invocation_timeout: config.invocation_timeout(),
            frame_buffer: config.frame_buffer,
            shutdown_grace: config.shutdown_grace(),
            cancel_grace: config.cancel_grace(),
        }
    }
}

/// Live view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: BackendKind,
    pub admission: GateStatus,
    pub pool: PoolStatus,
    pub stats: PoolStats,
}

/// What [`Router::shutdown`] found.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownSummary {
    /// Invocations still running after the grace period and cancelled.
    pub cancelled: usize,
    pub pools: Vec<(String, ShutdownReport)>,
}

struct RouterInner {
    registry: Registry,
    gates: HashMap<String, AdmissionGate>,
    settings: RouterSettings,
    active: Arc<ActiveSet>,
    observer: Arc<dyn InvocationObserver>,
    accepting: AtomicBool,
}

/// Routes invocations to backends. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(registry: Registry, settings: RouterSettings) -> Self {
        Self::with_observer(registry, settings, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        registry: Registry,
        settings: RouterSettings,
        observer: Arc<dyn InvocationObserver>,
    ) -> Self {
        let gates = registry
            .iter()
            .map(|h| (h.id().to_string(), AdmissionGate::new(&h.descriptor)))
            .collect();
        Self {
            inner: Arc::new(RouterInner {
                registry,
                gates,
                settings,
                active: Arc::new(ActiveSet::default()),
                observer,
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.inner.settings
    }

    /// Starts an invocation and returns its frame stream.
    ///
    /// `cancel` is the caller's withdrawal signal. The stream always ends with
    /// one terminal frame, including for requests rejected up front.
    pub fn invoke(&self, request: QueryRequest, cancel: CancellationToken) -> InvocationStream {
        let (sink, stream) =
            transcoder::channel(request.request_id.clone(), self.inner.settings.frame_buffer);

        match self.inner.active.insert(&request, cancel.child_token()) {
            Ok(guard) => {
                tokio::spawn(run(Arc::clone(&self.inner), request, guard, sink));
            }
            Err(err) => {
                tracing::warn!(request_id = %request.request_id, error = %err, "Rejected invocation");
                let observer = &self.inner.observer;
                observer.on_start(&InvocationStarted {
                    request_id: request.request_id.clone(),
                    backend_id: request.backend_id.clone(),
                    mode: request.mode,
                });
                observer.on_end(&InvocationFinished {
                    request_id: request.request_id,
                    backend_id: request.backend_id,
                    latency: Duration::ZERO,
                    status: InvocationStatus::from_error(&err),
                    rows: 0,
                    error: Some(err.kind()),
                });
                tokio::spawn(async move { sink.fail(&err).await });
            }
        }
        stream
    }

    /// Runs a gateway-issued read, such as schema introspection.
    ///
    /// Admission, pooling and deadlines apply as for [`Router::invoke`], but
    /// the backend's read/write switches and statement classification do not.
    pub fn introspect(
        &self,
        backend_id: &str,
        statement: impl Into<String>,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> InvocationStream {
        let mut request = QueryRequest::new(backend_id, statement).with_deadline(deadline);
        request.trusted = true;
        self.invoke(request, cancel)
    }

    /// Withdraws an in-flight invocation by request id.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.inner.active.get(request_id) {
            Some(active) => {
                tracing::info!(request_id, backend = %active.backend_id, "Cancelling invocation");
                active.cancel(CancelReason::Withdrawn);
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<ActiveSnapshot> {
        self.inner.active.snapshot()
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.inner
            .registry
            .iter()
            .filter_map(|handle| {
                let gate = self.inner.gates.get(handle.id())?;
                Some(BackendStatus {
                    id: handle.id().to_string(),
                    kind: handle.descriptor.kind,
                    admission: gate.status(),
                    pool: handle.pool.status(),
                    stats: handle.pool.stats(),
                })
            })
            .collect()
    }

    /// Drains in-flight work, then closes every pool.
    ///
    /// New and queued invocations fail with `Cancelled(Shutdown)`. Running
    /// ones get the shutdown grace period before they are cancelled.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let inner = &self.inner;
        if !inner.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!("Router already shut down");
        }
        for gate in inner.gates.values() {
            gate.close();
        }

        let settings = &inner.settings;
        let mut cancelled = 0;
        if timeout(settings.shutdown_grace, inner.active.wait_empty())
            .await
            .is_err()
        {
            cancelled = inner.active.cancel_all(CancelReason::Shutdown);
            tracing::warn!(cancelled, "Cancelling invocations still running after grace period");
            let _ = timeout(settings.cancel_grace, inner.active.wait_empty()).await;
        }

        let mut pools = Vec::with_capacity(inner.registry.len());
        for handle in inner.registry.iter() {
            let report = handle.pool.shutdown(settings.shutdown_grace).await;
            pools.push((handle.id().to_string(), report));
        }

        tracing::info!(backends = pools.len(), cancelled, "Router shut down");
        ShutdownSummary { cancelled, pools }
    }
}

async fn run(inner: Arc<RouterInner>, request: QueryRequest, active: ActiveGuard, mut sink: FrameSink) {
    let started = Instant::now();
    let deadline = request
        .deadline
        .unwrap_or(started + inner.settings.invocation_timeout);

    inner.observer.on_start(&InvocationStarted {
        request_id: request.request_id.clone(),
        backend_id: request.backend_id.clone(),
        mode: request.mode,
    });

    let result = dispatch(&inner, &request, &active, &mut sink, deadline).await;
    let result = result.map_err(|err| match err {
        // The token fired; report why it was cancelled, if the router knows.
        GatewayError::Cancelled(CancelReason::Withdrawn) => {
            GatewayError::Cancelled(active.cancel_reason().unwrap_or(CancelReason::Withdrawn))
        }
        other => other,
    });

    let status = match &result {
        Ok(()) => InvocationStatus::Completed,
        Err(err) => InvocationStatus::from_error(err),
    };
    active.advance(status.state());
    drop(active);

    inner.observer.on_end(&InvocationFinished {
        request_id: request.request_id.clone(),
        backend_id: request.backend_id.clone(),
        latency: started.elapsed(),
        status,
        rows: sink.rows_delivered(),
        error: result.as_ref().err().map(GatewayError::kind),
    });

    match result {
        Ok(()) => sink.complete().await,
        Err(err) => sink.fail(&err).await,
    }
}

async fn dispatch(
    inner: &RouterInner,
    request: &QueryRequest,
    active: &ActiveInvocation,
    sink: &mut FrameSink,
    deadline: Instant,
) -> Result<(), GatewayError> {
    if request.backend_id.trim().is_empty() {
        return Err(GatewayError::ProtocolViolation("backend id is empty".into()));
    }
    if request.statement.trim().is_empty() {
        return Err(GatewayError::ProtocolViolation("statement is empty".into()));
    }
    if !inner.accepting.load(Ordering::Acquire) {
        return Err(GatewayError::Cancelled(CancelReason::Shutdown));
    }

    let handle = inner.registry.resolve(&request.backend_id)?;
    let statement = authorize(handle, request)?;
    let gate = inner
        .gates
        .get(handle.id())
        .ok_or_else(|| GatewayError::UnknownBackend(request.backend_id.clone()))?;

    let token = active.token();
    let _admission = gate.admit(deadline, token).await?;
    active.advance(InvocationState::Admitted);

    let acquire_by = acquire_deadline(deadline, handle.descriptor.pool.acquire_timeout);
    let mut conn = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(GatewayError::Cancelled(CancelReason::Withdrawn)),
        acquired = handle.pool.acquire(acquire_by) => match acquired {
            // The request's own deadline ran out first.
            Err(GatewayError::AcquireTimeout { .. }) if acquire_by >= deadline => {
                return Err(GatewayError::Cancelled(CancelReason::DeadlineExceeded))
            }
            other => other?,
        },
    };
    active.set_holds_connection(true);
    active.advance(InvocationState::Dispatched);

    let abort = conn.connection().cancel_handle();
    let outcome = stream_rows(
        handle.adapter.as_ref(),
        conn.connection_mut(),
        &statement,
        request,
        active,
        sink,
        deadline,
    )
    .await;

    // Release before the terminal frame goes out.
    let result = match outcome {
        PumpOutcome::Exhausted => {
            conn.release(true);
            Ok(())
        }
        PumpOutcome::Failed(err) => {
            conn.release(err.connection_usable);
            Err(GatewayError::Adapter(err))
        }
        PumpOutcome::Interrupted(reason) => {
            let aborted = match timeout(inner.settings.cancel_grace, handle.adapter.cancel(&abort)).await {
                Ok(outcome) => outcome,
                Err(_) => CancelOutcome::Failed(AdapterError::io(
                    handle.id(),
                    "abort not acknowledged within the cancel grace period",
                )),
            };
            if let CancelOutcome::Failed(e) = &aborted {
                tracing::warn!(request_id = %request.request_id, error = %e, "Backend abort failed");
            }

            // An acknowledged abort may still be in flight on the server; a
            // completed round-trip proves it has been consumed.
            let verified = match &aborted {
                CancelOutcome::Acknowledged => Some(
                    timeout(
                        inner.settings.cancel_grace,
                        handle.adapter.health_check(conn.connection_mut()),
                    )
                    .await
                    .unwrap_or(false),
                ),
                _ => None,
            };
            let reuse = reusable_after_abort(&aborted, verified);
            tracing::debug!(
                request_id = %request.request_id,
                backend = %handle.id(),
                ?reason,
                reuse,
                "Invocation interrupted"
            );
            conn.release(reuse);
            Err(GatewayError::Cancelled(reason))
        }
    };
    active.set_holds_connection(false);
    result
}

/// Whether an interrupted connection may go back to the idle set.
///
/// `verified` is the result of the round-trip run after an acknowledged abort.
fn reusable_after_abort(abort: &CancelOutcome, verified: Option<bool>) -> bool {
    matches!(abort, CancelOutcome::Acknowledged) && verified == Some(true)
}

/// Acquisition waits for the backend's acquire timeout, never past the request deadline.
fn acquire_deadline(deadline: Instant, acquire_timeout: Duration) -> Instant {
    deadline.min(Instant::now() + acquire_timeout)
}

/// Executes the statement and pumps its rows into the sink.
async fn stream_rows(
    adapter: &dyn Adapter,
    connection: &mut dyn Connection,
    statement: &str,
    request: &QueryRequest,
    active: &ActiveInvocation,
    sink: &mut FrameSink,
    deadline: Instant,
) -> PumpOutcome {
    let token = active.token();
    let rows = tokio::select! {
        biased;
        _ = token.cancelled() => return PumpOutcome::Interrupted(CancelReason::Withdrawn),
        _ = sleep_until(deadline) => return PumpOutcome::Interrupted(CancelReason::DeadlineExceeded),
        rows = adapter.execute(connection, statement, &request.parameters) => rows,
    };

    match rows {
        Ok(rows) => {
            active.advance(InvocationState::Streaming);
            transcoder::pump(rows, sink, token, deadline).await
        }
        Err(err) => PumpOutcome::Failed(err),
    }
}

/// Applies the backend's read/write switches to the request.
///
/// Returns the statement to run, rewritten for row-returning writes.
fn authorize<'r>(
    handle: &BackendHandle,
    request: &'r QueryRequest,
) -> Result<Cow<'r, str>, GatewayError> {
    if request.trusted {
        return Ok(Cow::Borrowed(request.statement.as_str()));
    }

    let access = handle.descriptor.access;
    let class = classify(handle.descriptor.kind, &request.statement);
    let denied = |reason: &str| GatewayError::AccessDenied {
        backend_id: handle.id().to_string(),
        reason: reason.to_string(),
    };

    match request.mode {
        AccessMode::Read => {
            if !access.read {
                return Err(denied("read access is disabled"));
            }
            if class == StatementClass::Write {
                return Err(denied("statement modifies data; use write mode"));
            }
            Ok(Cow::Borrowed(request.statement.as_str()))
        }
        AccessMode::Write => {
            if !access.write {
                return Err(denied("write access is disabled"));
            }
            if class == StatementClass::Read && !access.read {
                return Err(denied("read access is disabled"));
            }
            Ok(handle.adapter.prepare_write(&request.statement))
        }
    }
}

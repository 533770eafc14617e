//! Invocation requests, lifecycle states and the set of in-flight invocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, GatewayError};
use crate::row::Params;
use crate::statement::AccessMode;

/// One inbound tool invocation.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub backend_id: String,
    pub statement: String,
    pub parameters: Params,
    pub request_id: String,
    /// Absolute deadline; the router default applies when unset.
    pub deadline: Option<Instant>,
    pub mode: AccessMode,
    /// Gateway-issued statement that bypasses access control.
    pub(crate) trusted: bool,
}

impl QueryRequest {
    /// Read-mode request with a fresh ULID request id.
    pub fn new(backend_id: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            statement: statement.into(),
            parameters: Vec::new(),
            request_id: ulid::Ulid::new().to_string(),
            deadline: None,
            mode: AccessMode::Read,
            trusted: false,
        }
    }

    pub fn with_parameters(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Per-invocation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Received,
    Admitted,
    Dispatched,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Completed | InvocationState::Failed | InvocationState::Cancelled
        )
    }

    /// Forward-only transitions; any live state may fail or be cancelled.
    pub fn can_advance_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        match (self, next) {
            (from, Failed | Cancelled) => !from.is_terminal(),
            (Received, Admitted) => true,
            (Admitted, Dispatched) => true,
            (Dispatched, Streaming) => true,
            (Streaming, Completed) => true,
            _ => false,
        }
    }
}

/// Terminal status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Completed,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    pub fn from_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::Cancelled(_) => InvocationStatus::Cancelled,
            _ => InvocationStatus::Failed,
        }
    }

    pub fn state(self) -> InvocationState {
        match self {
            InvocationStatus::Completed => InvocationState::Completed,
            InvocationStatus::Failed => InvocationState::Failed,
            InvocationStatus::Cancelled => InvocationState::Cancelled,
        }
    }
}

/// Router-side record of one in-flight invocation.
pub struct ActiveInvocation {
    pub request_id: String,
    pub backend_id: String,
    pub started: Instant,
    token: CancellationToken,
    inner: Mutex<ActiveState>,
}

struct ActiveState {
    state: InvocationState,
    holds_connection: bool,
    cancel_reason: Option<CancelReason>,
}

impl ActiveInvocation {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> InvocationState {
        self.inner.lock().state
    }

    /// Moves to `next` if the transition is legal.
    pub fn advance(&self, next: InvocationState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_advance_to(next) {
            tracing::warn!(
                request_id = %self.request_id,
                from = ?inner.state,
                to = ?next,
                "Ignoring illegal invocation transition"
            );
            return false;
        }
        inner.state = next;
        true
    }

    pub fn set_holds_connection(&self, holds: bool) {
        self.inner.lock().holds_connection = holds;
    }

    /// Requests cancellation, recording the first reason given.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.lock().cancel_reason.get_or_insert(reason);
        self.token.cancel();
    }

    /// The reason recorded by whoever cancelled through the router, if any.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner.lock().cancel_reason
    }

    pub fn snapshot(&self) -> ActiveSnapshot {
        let inner = self.inner.lock();
        ActiveSnapshot {
            request_id: self.request_id.clone(),
            backend_id: self.backend_id.clone(),
            state: inner.state,
            holds_connection: inner.holds_connection,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable view of an [`ActiveInvocation`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSnapshot {
    pub request_id: String,
    pub backend_id: String,
    pub state: InvocationState,
    pub holds_connection: bool,
    pub elapsed_ms: u64,
}

/// In-flight invocations keyed by request id.
#[derive(Default)]
pub(crate) struct ActiveSet {
    map: Mutex<HashMap<String, Arc<ActiveInvocation>>>,
    emptied: Notify,
}

impl ActiveSet {
    /// Tracks a new invocation until the returned guard drops.
    pub(crate) fn insert(
        self: &Arc<Self>,
        request: &QueryRequest,
        token: CancellationToken,
    ) -> Result<ActiveGuard, GatewayError> {
        let mut map = self.map.lock();
        if map.contains_key(&request.request_id) {
            return Err(GatewayError::ProtocolViolation(format!(
                "request id {} is already in flight",
                request.request_id
            )));
        }
        let active = Arc::new(ActiveInvocation {
            request_id: request.request_id.clone(),
            backend_id: request.backend_id.clone(),
            started: Instant::now(),
            token,
            inner: Mutex::new(ActiveState {
                state: InvocationState::Received,
                holds_connection: false,
                cancel_reason: None,
            }),
        });
        map.insert(request.request_id.clone(), Arc::clone(&active));
        Ok(ActiveGuard {
            set: Arc::clone(self),
            active,
        })
    }

    pub(crate) fn get(&self, request_id: &str) -> Option<Arc<ActiveInvocation>> {
        self.map.lock().get(request_id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<ActiveSnapshot> {
        let mut all: Vec<_> = self.map.lock().values().map(|a| a.snapshot()).collect();
        all.sort_by_key(|s| std::cmp::Reverse(s.elapsed_ms));
        all
    }

    pub(crate) fn cancel_all(&self, reason: CancelReason) -> usize {
        let map = self.map.lock();
        for active in map.values() {
            active.cancel(reason);
        }
        map.len()
    }

    /// Waits until no invocation is tracked.
    pub(crate) async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();
            if self.map.lock().is_empty() {
                return;
            }
            emptied.await;
        }
    }
}

/// Removes its invocation from the active set on drop.
pub(crate) struct ActiveGuard {
    set: Arc<ActiveSet>,
    active: Arc<ActiveInvocation>,
}

impl std::ops::Deref for ActiveGuard {
    type Target = ActiveInvocation;

    fn deref(&self) -> &Self::Target {
        &self.active
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut map = self.set.map.lock();
        map.remove(&self.active.request_id);
        if map.is_empty() {
            self.set.emptied.notify_waiters();
        }
    }
}

//! Shared fixtures: a scriptable in-memory adapter and router builders.

#![allow(dead_code)]

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use dbgate::backend::{AdmissionPolicy, AdmissionSettings, BackendDescriptor, BackendKind};
use dbgate::backends::{Adapter, CancelHandle, CancelQuery, Connection};
use dbgate::error::{AdapterError, AdapterErrorKind};
use dbgate::observe::{InvocationFinished, InvocationObserver, InvocationStarted};
use dbgate::registry::Registry;
use dbgate::router::{Router, RouterSettings};
use dbgate::row::{Row, RowStream};
use dbgate::statement::append_returning;

/// What every statement on a fake backend produces.
#[derive(Debug, Clone)]
pub struct Script {
    /// Rows `{"n": 0}..{"n": rows - 1}`.
    pub rows: usize,
    /// Raise an error instead of row `n`.
    pub fail_after: Option<usize>,
    /// Whether that error leaves the connection usable.
    pub usable_after_error: bool,
    /// Pause before the first row.
    pub start_delay: Duration,
    /// Pause before each row.
    pub row_delay: Duration,
    /// Whether the driver can abort a running statement.
    pub cancellable: bool,
    /// What the connection health check reports.
    pub healthy: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            rows: 3,
            fail_after: None,
            usable_after_error: true,
            start_delay: Duration::ZERO,
            row_delay: Duration::ZERO,
            cancellable: true,
            healthy: true,
        }
    }
}

/// Counters observed by the tests.
#[derive(Debug, Default)]
pub struct FakeStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub executing: AtomicUsize,
    pub max_executing: AtomicUsize,
    pub cancels: AtomicUsize,
    pub health_checks: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
}

impl FakeStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeAdapter {
    backend_id: String,
    script: Script,
    pub stats: Arc<FakeStats>,
}

impl FakeAdapter {
    pub fn new(backend_id: &str, script: Script) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            script,
            stats: Arc::new(FakeStats::default()),
        }
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, AdapterError> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            backend_id: self.backend_id.clone(),
            script: self.script.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn prepare_write<'s>(&self, statement: &'s str) -> Cow<'s, str> {
        append_returning(statement, &["INSERT", "UPDATE", "DELETE"])
    }
}

struct FakeConnection {
    backend_id: String,
    script: Script,
    stats: Arc<FakeStats>,
}

/// Counts a statement as executing until its row stream drops.
struct Executing(Arc<FakeStats>);

impl Executing {
    fn enter(stats: &Arc<FakeStats>) -> Self {
        let now = stats.executing.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_executing.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(stats))
    }
}

impl Drop for Executing {
    fn drop(&mut self) {
        self.0.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn numbered(n: usize) -> Row {
    Row::from_iter([("n".to_string(), json!(n))])
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(
        &mut self,
        statement: &str,
        _params: &[JsonValue],
    ) -> Result<RowStream<'_>, AdapterError> {
        self.stats.statements.lock().push(statement.to_string());
        let executing = Executing::enter(&self.stats);
        let script = self.script.clone();
        let backend_id = self.backend_id.clone();

        Ok(Box::pin(async_stream::try_stream! {
            let _executing = executing;
            tokio::time::sleep(script.start_delay).await;
            for n in 0..script.rows {
                if script.fail_after == Some(n) {
                    Err::<(), _>(AdapterError::new(
                        backend_id.clone(),
                        AdapterErrorKind::Backend,
                        script.usable_after_error,
                        "simulated failure",
                    ))?;
                }
                if !script.row_delay.is_zero() {
                    tokio::time::sleep(script.row_delay).await;
                }
                yield numbered(n);
            }
        }))
    }

    fn cancel_handle(&self) -> CancelHandle {
        if self.script.cancellable {
            CancelHandle::new(FakeCancel(Arc::clone(&self.stats)))
        } else {
            CancelHandle::unsupported()
        }
    }

    async fn health_check(&mut self) -> bool {
        self.stats.health_checks.fetch_add(1, Ordering::SeqCst);
        self.script.healthy
    }

    async fn close(self: Box<Self>) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeCancel(Arc<FakeStats>);

#[async_trait]
impl CancelQuery for FakeCancel {
    async fn cancel(&self) -> Result<(), AdapterError> {
        self.0.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every observer event.
#[derive(Default)]
pub struct RecordingObserver {
    pub started: Mutex<Vec<InvocationStarted>>,
    pub finished: Mutex<Vec<InvocationFinished>>,
}

impl InvocationObserver for RecordingObserver {
    fn on_start(&self, event: &InvocationStarted) {
        self.started.lock().push(event.clone());
    }

    fn on_end(&self, event: &InvocationFinished) {
        self.finished.lock().push(event.clone());
    }
}

pub fn descriptor(
    id: &str,
    max_concurrency: usize,
    connection_limit: usize,
    policy: AdmissionPolicy,
) -> BackendDescriptor {
    BackendDescriptor::new(id, BackendKind::Postgres, format!("fake://{}", id))
        .with_max_concurrency(max_concurrency)
        .with_connection_limit(connection_limit)
        .with_admission(AdmissionSettings {
            policy,
            ..AdmissionSettings::default()
        })
        .with_access(true, true)
}

pub fn settings() -> RouterSettings {
    RouterSettings {
        invocation_timeout: Duration::from_secs(5),
        frame_buffer: 16,
        shutdown_grace: Duration::from_millis(200),
        cancel_grace: Duration::from_millis(200),
    }
}

/// A test gateway over one fake backend.
pub struct Gateway {
    pub router: Router,
    pub stats: Arc<FakeStats>,
    pub observer: Arc<RecordingObserver>,
}

pub fn gateway(descriptor: BackendDescriptor, script: Script) -> Gateway {
    gateway_with(descriptor, script, settings())
}

pub fn gateway_with(
    descriptor: BackendDescriptor,
    script: Script,
    settings: RouterSettings,
) -> Gateway {
    let adapter = FakeAdapter::new(&descriptor.id, script);
    let stats = Arc::clone(&adapter.stats);
    let mut registry = Registry::new();
    registry
        .register(descriptor, Arc::new(adapter))
        .expect("register fake backend");

    let observer = Arc::new(RecordingObserver::default());
    let router = Router::with_observer(registry, settings, observer.clone());
    Gateway {
        router,
        stats,
        observer,
    }
}

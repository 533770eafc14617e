//! Bounded per-backend connection pool.
//!
//! A semaphore with `connection_limit` permits caps live connections: every
//! lent connection holds one permit, and the permit is only returned after
//! the connection is back in the idle set or closed. Idle connections are
//! reused most-recent-first; a reaper closes those idle past `idle_timeout`
//! while keeping `min_idle` around.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendDescriptor, PoolSettings};
use crate::backends::{Adapter, Connection};
use crate::error::GatewayError;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub limit: usize,
    pub closed: bool,
}

/// Cumulative pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub releases: u64,
    pub acquire_timeouts: u64,
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    acquire_timeouts: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`Pool::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every lent connection came back within the grace period.
    pub drained: bool,
    /// Connections still lent out when the grace period ended.
    ///
    /// The pool cannot take a connection back from its holder. Each of these is
    /// closed, never pooled, the moment it is released or dropped, whatever
    /// its health.
    pub outstanding: usize,
    /// Idle connections closed by the shutdown itself.
    pub closed: usize,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

struct PoolInner {
    backend_id: String,
    adapter: Arc<dyn Adapter>,
    limit: usize,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    /// Oldest at the front, most recently released at the back.
    idle: Mutex<VecDeque<IdleConnection>>,
    live: AtomicUsize,
    lent: AtomicUsize,
    closed: AtomicBool,
    returned: Notify,
    reaper: CancellationToken,
    stats: AtomicPoolStats,
}

/// Connection pool for one backend. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates an empty pool; connections are opened on demand.
    ///
    /// The idle reaper starts when a tokio runtime is available.
    pub fn new(descriptor: &BackendDescriptor, adapter: Arc<dyn Adapter>) -> Self {
        let inner = Arc::new(PoolInner {
            backend_id: descriptor.id.clone(),
            adapter,
            limit: descriptor.connection_limit,
            settings: descriptor.pool.clone(),
            permits: Arc::new(Semaphore::new(descriptor.connection_limit)),
            idle: Mutex::new(VecDeque::with_capacity(descriptor.connection_limit)),
            live: AtomicUsize::new(0),
            lent: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            returned: Notify::new(),
            reaper: CancellationToken::new(),
            stats: AtomicPoolStats::default(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_loop(
                Arc::downgrade(&inner),
                inner.reaper.clone(),
                reap_interval(inner.settings.idle_timeout),
            ));
        }

        Self { inner }
    }

    pub fn backend_id(&self) -> &str {
        &self.inner.backend_id
    }

    /// Lends a connection, waiting until `deadline` for one to free up.
    pub async fn acquire(&self, deadline: Instant) -> Result<PooledConnection, GatewayError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(GatewayError::PoolClosed(inner.backend_id.clone()));
        }

        let started = Instant::now();
        let permit = match timeout_at(deadline, Arc::clone(&inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GatewayError::PoolClosed(inner.backend_id.clone())),
            Err(_) => {
                AtomicPoolStats::bump(&inner.stats.acquire_timeouts);
                return Err(inner.timed_out(started));
            }
        };

        // Reuse the most recently released connection when it still works.
        loop {
            let Some(entry) = inner.idle.lock().pop_back() else {
                break;
            };
            let slot = LiveSlot::adopt(inner);
            let mut conn = entry.conn;

            if entry.idle_since.elapsed() >= inner.settings.validate_after {
                let healthy = matches!(
                    timeout_at(deadline, inner.adapter.health_check(conn.as_mut())).await,
                    Ok(true)
                );
                if !healthy {
                    AtomicPoolStats::bump(&inner.stats.health_check_failures);
                    tracing::debug!(backend = %inner.backend_id, "Discarding idle connection that failed its health check");
                    drop(slot);
                    inner.close_detached(conn);
                    if Instant::now() >= deadline {
                        return Err(inner.timed_out(started));
                    }
                    continue;
                }
            }

            slot.commit();
            return Ok(self.lend(conn, permit));
        }

        let slot = LiveSlot::reserve(inner);
        let conn = match timeout_at(deadline, inner.adapter.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(GatewayError::Adapter(e)),
            Err(_) => {
                AtomicPoolStats::bump(&inner.stats.acquire_timeouts);
                return Err(inner.timed_out(started));
            }
        };
        slot.commit();
        AtomicPoolStats::bump(&inner.stats.connections_created);
        tracing::debug!(backend = %inner.backend_id, live = inner.live.load(Ordering::Relaxed), "Opened pooled connection");

        Ok(self.lend(conn, permit))
    }

    fn lend(&self, conn: Box<dyn Connection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        self.inner.lent.fetch_add(1, Ordering::AcqRel);
        AtomicPoolStats::bump(&self.inner.stats.acquisitions);
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            in_use: inner.lent.load(Ordering::Acquire),
            limit: inner.limit,
            closed: inner.closed.load(Ordering::Acquire),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Closes idle connections past the inactivity window, keeping `min_idle`.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Stops lending, waits up to `grace` for lent connections, then closes idle ones.
    ///
    /// Connections released after this point are closed instead of pooled.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        {
            let _idle = inner.idle.lock();
            inner.closed.store(true, Ordering::Release);
        }
        inner.permits.close();
        inner.reaper.cancel();

        let drained = timeout(grace, async {
            loop {
                let returned = inner.returned.notified();
                tokio::pin!(returned);
                returned.as_mut().enable();
                if inner.lent.load(Ordering::Acquire) == 0 {
                    break;
                }
                returned.await;
            }
        })
        .await
        .is_ok();

        let idle: Vec<_> = inner.idle.lock().drain(..).collect();
        let closed = idle.len();
        for entry in idle {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            AtomicPoolStats::bump(&inner.stats.connections_closed);
            entry.conn.close().await;
        }

        let outstanding = inner.lent.load(Ordering::Acquire);
        if outstanding > 0 {
            tracing::warn!(backend = %inner.backend_id, outstanding, "Pool shut down with connections still lent; closing them on release");
        }
        tracing::info!(backend = %inner.backend_id, closed, drained, "Pool shut down");

        ShutdownReport {
            drained,
            outstanding,
            closed,
        }
    }
}

impl PoolInner {
    fn timed_out(&self, started: Instant) -> GatewayError {
        GatewayError::AcquireTimeout {
            backend_id: self.backend_id.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Takes back a lent connection.
    fn give_back(&self, conn: Box<dyn Connection>, healthy: bool) {
        AtomicPoolStats::bump(&self.stats.releases);
        if healthy {
            let mut idle = self.idle.lock();
            if !self.closed.load(Ordering::Acquire) {
                idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                return;
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.close_detached(conn);
    }

    /// Closes a connection that is no longer counted as live.
    fn close_detached(&self, conn: Box<dyn Connection>) {
        AtomicPoolStats::bump(&self.stats.connections_closed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(conn.close());
            }
            Err(_) => drop(conn),
        }
    }

    async fn reap_idle(&self) -> usize {
        let expired: Vec<IdleConnection> = {
            let mut idle = self.idle.lock();
            let mut expired = Vec::new();
            while idle.len() > self.settings.min_idle {
                match idle.front() {
                    Some(oldest) if oldest.idle_since.elapsed() >= self.settings.idle_timeout => {
                        expired.extend(idle.pop_front());
                    }
                    _ => break,
                }
            }
            expired
        };

        let count = expired.len();
        for entry in expired {
            self.live.fetch_sub(1, Ordering::AcqRel);
            AtomicPoolStats::bump(&self.stats.connections_closed);
            entry.conn.close().await;
        }
        if count > 0 {
            tracing::debug!(backend = %self.backend_id, count, "Reaped idle connections");
        }
        count
    }
}

fn reap_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(Duration::from_millis(10))
}

async fn reap_loop(pool: Weak<PoolInner>, stop: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.reap_idle().await;
            }
        }
    }
}

/// Accounts for one live connection that is neither idle nor lent yet.
///
/// Dropping an uncommitted slot gives the count back, so a cancelled acquire
/// cannot leak capacity.
struct LiveSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> LiveSlot<'a> {
    /// Counts a connection about to be opened.
    fn reserve(inner: &'a PoolInner) -> Self {
        inner.live.fetch_add(1, Ordering::AcqRel);
        Self { inner, armed: true }
    }

    /// Takes over the count of a connection just removed from the idle set.
    fn adopt(inner: &'a PoolInner) -> Self {
        Self { inner, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for LiveSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A connection lent to one invocation.
///
/// Call [`release`](Self::release) to hand it back. Dropping it without
/// releasing discards the connection as unhealthy.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn connection(&self) -> &dyn Connection {
        self.conn
            .as_deref()
            .expect("connection present until released")
    }

    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        self.conn
            .as_deref_mut()
            .expect("connection present until released")
    }

    /// Returns the connection to the idle set, or closes it when unhealthy.
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, healthy);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(backend = %self.pool.backend_id, "Pooled connection dropped without release");
            self.pool.give_back(conn, false);
        }
        self.pool.lent.fetch_sub(1, Ordering::AcqRel);
        self.pool.returned.notify_waiters();
    }
}

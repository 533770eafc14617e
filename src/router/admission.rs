//! Per-backend admission gate bounding in-flight invocations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::backend::{AdmissionPolicy, AdmissionSettings, BackendDescriptor};
use crate::error::{CancelReason, GatewayError};

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub in_flight: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub policy: AdmissionPolicy,
}

/// Admits at most `max_concurrency` invocations at a time.
///
/// Waiters are served in arrival order (tokio's semaphore is fair).
pub struct AdmissionGate {
    backend_id: String,
    max_concurrency: usize,
    settings: AdmissionSettings,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Held for as long as the invocation counts against the limit.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            backend_id: descriptor.id.clone(),
            max_concurrency: descriptor.max_concurrency,
            settings: descriptor.admission.clone(),
            permits: Arc::new(Semaphore::new(descriptor.max_concurrency)),
            queued: AtomicUsize::new(0),
        }
    }

    pub async fn admit(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Admission, GatewayError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(Admission { _permit: permit }),
            Err(TryAcquireError::Closed) => {
                return Err(GatewayError::Cancelled(CancelReason::Shutdown))
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        if self.settings.policy == AdmissionPolicy::Reject {
            return Err(self.saturated());
        }

        let _queued = QueueSlot::enter(&self.queued, self.settings.queue_depth)
            .ok_or_else(|| self.saturated())?;

        let started = Instant::now();
        let wait_until = deadline.min(started + self.settings.wait_timeout);
        tracing::debug!(backend = %self.backend_id, "Invocation queued for admission");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled(CancelReason::Withdrawn)),
            acquired = timeout_at(wait_until, Arc::clone(&self.permits).acquire_owned()) => match acquired {
                Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
                Ok(Err(_)) => Err(GatewayError::Cancelled(CancelReason::Shutdown)),
                Err(_) if wait_until >= deadline => {
                    Err(GatewayError::Cancelled(CancelReason::DeadlineExceeded))
                }
                Err(_) => Err(GatewayError::AdmissionTimeout {
                    backend_id: self.backend_id.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                }),
            },
        }
    }

    fn saturated(&self) -> GatewayError {
        GatewayError::BackendSaturated {
            backend_id: self.backend_id.clone(),
            max_concurrency: self.max_concurrency,
        }
    }

    /// Refuses new admissions and wakes queued waiters with a shutdown error.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.permits.available_permits())
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            in_flight: self.in_flight(),
            queued: self.queued.load(Ordering::Acquire),
            max_concurrency: self.max_concurrency,
            policy: self.settings.policy,
        }
    }
}

/// One place in the bounded admission queue.
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn enter(queued: &'a AtomicUsize, depth: usize) -> Option<Self> {
        if queued.fetch_add(1, Ordering::AcqRel) >= depth {
            queued.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(queued))
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use std::time::Duration;

    fn gate(policy: AdmissionPolicy, depth: usize, wait: Duration) -> AdmissionGate {
        AdmissionGate::new(
            &BackendDescriptor::new("pg1", BackendKind::Postgres, "postgresql://localhost/app")
                .with_max_concurrency(1)
                .with_admission(AdmissionSettings {
                    policy,
                    queue_depth: depth,
                    wait_timeout: wait,
                }),
        )
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let gate = gate(AdmissionPolicy::Reject, 8, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let _held = gate.admit(far(), &cancel).await.unwrap();

        let err = gate.admit(far(), &cancel).await.err().unwrap();
        assert!(matches!(err, GatewayError::BackendSaturated { max_concurrency: 1, .. }));
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let gate = Arc::new(gate(AdmissionPolicy::Queue, 8, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let held = gate.admit(far(), &cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                gate.admit(far(), &cancel).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.status().queued, 1);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.status().queued, 0);
    }

    #[tokio::test]
    async fn test_queue_depth_bound() {
        let gate = Arc::new(gate(AdmissionPolicy::Queue, 0, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let _held = gate.admit(far(), &cancel).await.unwrap();

        let err = gate.admit(far(), &cancel).await.err().unwrap();
        assert!(matches!(err, GatewayError::BackendSaturated { .. }));
    }

    #[tokio::test]
    async fn test_wait_timeout_and_deadline() {
        let gate = gate(AdmissionPolicy::Queue, 8, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let _held = gate.admit(far(), &cancel).await.unwrap();

        let err = gate.admit(far(), &cancel).await.err().unwrap();
        assert!(matches!(err, GatewayError::AdmissionTimeout { .. }));

        let soon = Instant::now() + Duration::from_millis(5);
        let err = gate.admit(soon, &cancel).await.err().unwrap();
        assert!(matches!(
            err,
            GatewayError::Cancelled(CancelReason::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let gate = Arc::new(gate(AdmissionPolicy::Queue, 8, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let _held = gate.admit(far(), &cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.admit(far(), &CancellationToken::new()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.close();

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, GatewayError::Cancelled(CancelReason::Shutdown)));
    }
}

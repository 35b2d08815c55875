//! Batch aggregator: one completion signal for the whole batch.

use super::cancel::{CancelReason, CancellationController};
use super::operation::{FailureReason, OperationId};
use super::permits::{PermitPool, PermitSnapshot};
use super::tracker::{OutcomeTracker, TrackerCounts};
use crate::telemetry::{BatchEvent, BatchEventSink};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

/// Final breakdown of a drained batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub succeeded: BTreeSet<OperationId>,
    pub failures: BTreeMap<OperationId, FailureReason>,
    pub cancelled: BTreeSet<OperationId>,
    pub cancelled_by: Option<CancelReason>,
    pub elapsed_ms: u64,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len() + self.cancelled.len()
    }
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && self.cancelled.is_empty()
    }
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.succeeded.len() as f64 / self.total() as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    #[serde(flatten)]
    pub counts: TrackerCounts,
    pub permits: PermitSnapshot,
    pub cancelled_by: Option<CancelReason>,
    pub drained: bool,
}

pub(crate) struct Shared {
    pub(crate) batch_id: Uuid,
    pub(crate) tracker: Arc<OutcomeTracker>,
    pub(crate) pool: Arc<PermitPool>,
    pub(crate) cancel: CancellationController,
    pub(crate) sink: Arc<dyn BatchEventSink>,
    pub(crate) started: Instant,
    pub(crate) result: OnceLock<BatchResult>,
}

/// Handle to a running batch.
///
/// Cheap to clone; all clones observe the same batch. Dropping every handle
/// does not stop the batch, its operations still run to completion.
#[derive(Clone)]
pub struct BatchHandle {
    shared: Arc<Shared>,
}

impl BatchHandle {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.batch_id
    }

    /// Wait until every operation is terminal.
    ///
    /// Resolves on the last terminal record whether it was a success, a
    /// failure, or a cancellation. Repeated calls return the same result.
    /// Structural defects (a duplicate completion, leaked permits) are
    /// returned as `Err` instead of a result.
    pub async fn wait(&self) -> Result<BatchResult> {
        let mut drained = self.shared.tracker.subscribe();
        drained.wait_for(|d| *d).await.map_err(|_| {
            Error::runtime_with_context(
                "completion signal dropped before the batch drained",
                ErrorContext::new().with_source("batch_aggregator"),
            )
        })?;

        let result = self
            .shared
            .result
            .get_or_init(|| self.build_result())
            .clone();
        self.check_invariants()?;
        Ok(result)
    }

    /// Like [`wait`](Self::wait), but aborts the batch once `limit` elapses.
    ///
    /// After an expiry, pending operations are cancelled and in-flight ones
    /// aborted; the call still waits for every permit to come back and then
    /// returns the final result with `cancelled_by` set to `Timeout` (unless
    /// the batch had already been cancelled for another reason).
    pub async fn wait_timeout(&self, limit: Duration) -> Result<BatchResult> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(r) => r,
            Err(_) => {
                self.shared.cancel.fire(
                    CancelReason::Timeout {
                        after_ms: limit.as_millis() as u64,
                    },
                    true,
                );
                self.wait().await
            }
        }
    }

    /// Stop dispatching; pending operations become `Cancelled`. In-flight
    /// operations are aborted only when the batch was configured with
    /// `abort_in_flight`. Returns `true` if this call cancelled the batch;
    /// a drained batch cannot be cancelled.
    pub fn cancel(&self) -> bool {
        !self.is_drained() && self.shared.cancel.cancel()
    }

    /// Stop dispatching and abort all in-flight operations.
    pub fn abort(&self) -> bool {
        !self.is_drained() && self.shared.cancel.abort()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_drained(&self) -> bool {
        self.shared.tracker.is_drained()
    }

    /// Failed operations of a resolved batch; `None` until `wait` has resolved.
    pub fn failures(&self) -> Option<BTreeMap<OperationId, FailureReason>> {
        self.shared.result.get().map(|r| r.failures.clone())
    }

    /// The resolved result, if `wait` has completed.
    pub fn result(&self) -> Option<BatchResult> {
        self.shared.result.get().cloned()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let counts = self.shared.tracker.counts();
        BatchSnapshot {
            batch_id: self.shared.batch_id,
            counts,
            permits: self.shared.pool.snapshot(counts.in_flight),
            cancelled_by: self.shared.cancel.reason(),
            drained: self.shared.tracker.is_drained(),
        }
    }

    fn build_result(&self) -> BatchResult {
        let s = &self.shared;
        let outcomes = s.tracker.outcomes();
        let elapsed = s
            .tracker
            .drained_at()
            .map(|t| t.saturating_duration_since(s.started))
            .unwrap_or_else(|| s.started.elapsed());
        let result = BatchResult {
            batch_id: s.batch_id,
            succeeded: outcomes.succeeded,
            failures: outcomes.failures,
            cancelled: outcomes.cancelled,
            cancelled_by: s.cancel.reason(),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        info!(
            batch_id = %s.batch_id,
            succeeded = result.succeeded.len(),
            failed = result.failures.len(),
            cancelled = result.cancelled.len(),
            elapsed_ms = result.elapsed_ms,
            "batch drained"
        );
        s.sink.report(&BatchEvent::Drained {
            batch_id: s.batch_id,
            succeeded: result.succeeded.len(),
            failed: result.failures.len(),
            cancelled: result.cancelled.len(),
        });
        result
    }

    fn check_invariants(&self) -> Result<()> {
        let s = &self.shared;
        if let Some(defect) = s.tracker.defects().into_iter().next() {
            error!(batch_id = %s.batch_id, %defect, "batch defect");
            return Err(defect.into());
        }
        if let Err(defect) = s.pool.verify(s.tracker.counts().in_flight) {
            error!(batch_id = %s.batch_id, %defect, "batch defect");
            return Err(defect.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Defect;
    use crate::telemetry::{noop_sink, InMemoryEventSink};

    fn handle_with(tracker: Arc<OutcomeTracker>, pool: Arc<PermitPool>) -> BatchHandle {
        BatchHandle::new(Shared {
            batch_id: Uuid::new_v4(),
            tracker,
            pool,
            cancel: CancellationController::default(),
            sink: noop_sink(),
            started: Instant::now(),
            result: OnceLock::new(),
        })
    }

    #[tokio::test]
    async fn test_empty_batch_resolves() {
        let tracker = Arc::new(OutcomeTracker::new());
        tracker.seal();
        let h = handle_with(tracker, Arc::new(PermitPool::new(3)));
        let r = h.wait().await.unwrap();
        assert_eq!(r.total(), 0);
        assert!(r.all_succeeded());
        assert_eq!(r.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_resolves_after_last_failure() {
        let tracker = Arc::new(OutcomeTracker::new());
        let a = tracker.enqueue().unwrap();
        let b = tracker.enqueue().unwrap();
        tracker.seal();
        let h = handle_with(Arc::clone(&tracker), Arc::new(PermitPool::new(2)));
        assert!(h.failures().is_none());

        let waiter = tokio::spawn({
            let h = h.clone();
            async move { h.wait().await }
        });
        tracker.mark_in_flight(a).unwrap();
        tracker.mark_in_flight(b).unwrap();
        tracker.record_success(a).unwrap();
        tracker
            .record_failure(b, FailureReason::transport("bucket full"))
            .unwrap();

        let r = waiter.await.unwrap().unwrap();
        assert_eq!(r.succeeded, BTreeSet::from([a]));
        assert_eq!(r.failures.len(), 1);
        assert_eq!(h.failures().unwrap()[&b].message, "bucket full");
    }

    #[tokio::test]
    async fn test_idempotent_wait() {
        let tracker = Arc::new(OutcomeTracker::new());
        let a = tracker.enqueue().unwrap();
        tracker.seal();
        tracker.mark_in_flight(a).unwrap();
        tracker.record_success(a).unwrap();

        let sink = Arc::new(InMemoryEventSink::new(16));
        let h = BatchHandle::new(Shared {
            batch_id: Uuid::new_v4(),
            tracker,
            pool: Arc::new(PermitPool::new(1)),
            cancel: CancellationController::default(),
            sink: sink.clone(),
            started: Instant::now(),
            result: OnceLock::new(),
        });
        let first = h.wait().await.unwrap();
        let second = h.wait().await.unwrap();
        assert_eq!(first, second);
        // drained is reported once
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_completion_surfaces_as_error() {
        let tracker = Arc::new(OutcomeTracker::new());
        let a = tracker.enqueue().unwrap();
        tracker.seal();
        tracker.mark_in_flight(a).unwrap();
        tracker.record_success(a).unwrap();
        let _ = tracker.record_success(a);

        let h = handle_with(tracker, Arc::new(PermitPool::new(1)));
        let err = h.wait().await.unwrap_err();
        assert_eq!(err.defect(), Some(&Defect::DuplicateCompletion { id: a }));
    }

    #[tokio::test]
    async fn test_leaked_permit_surfaces_as_error() {
        let tracker = Arc::new(OutcomeTracker::new());
        tracker.seal();
        let pool = Arc::new(PermitPool::new(2));
        std::mem::forget(pool.try_acquire());

        let h = handle_with(tracker, pool);
        let err = h.wait().await.unwrap_err();
        assert!(matches!(err.defect(), Some(Defect::PermitLeak { .. })));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let tracker = Arc::new(OutcomeTracker::new());
        let a = tracker.enqueue().unwrap();
        tracker.enqueue().unwrap();
        tracker.seal();
        let pool = Arc::new(PermitPool::new(4));
        let _permit = pool.try_acquire().unwrap();
        tracker.mark_in_flight(a).unwrap();

        let h = handle_with(tracker, pool);
        let snap = h.snapshot();
        assert_eq!(snap.counts.outstanding, 2);
        assert_eq!(snap.counts.in_flight, 1);
        assert_eq!(snap.counts.pending, 1);
        assert_eq!(
            snap.permits,
            PermitSnapshot {
                limit: 4,
                available: 3,
                in_flight: 1
            }
        );
        assert!(!snap.drained);
        assert!(snap.cancelled_by.is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_drain_is_ignored() {
        let tracker = Arc::new(OutcomeTracker::new());
        tracker.seal();
        let h = handle_with(tracker, Arc::new(PermitPool::new(1)));
        assert!(!h.cancel());
        assert!(!h.abort());
        assert!(h.wait().await.unwrap().cancelled_by.is_none());
    }
}

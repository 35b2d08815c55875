//! Dispatcher: launches operations under the permit bound.
//!
//! Every dispatched operation runs in its own task which owns the permit. The
//! task drops the permit before it records the terminal outcome, so by the time
//! the outstanding count reaches zero every permit is back in the pool.

use super::cancel::CancellationController;
use super::operation::{FailureReason, Operation, OperationId, Outcome};
use super::permits::{Permit, PermitPool};
use super::tracker::OutcomeTracker;
use crate::telemetry::{BatchEvent, BatchEventSink};
use crate::transport::{OutcomeFuture, SendRequest, Transport};
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Everything an operation task needs after the dispatcher has moved on.
#[derive(Clone)]
pub(crate) struct Completion {
    pub(crate) batch_id: Uuid,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tracker: Arc<OutcomeTracker>,
    pub(crate) cancel: CancellationController,
    pub(crate) sink: Arc<dyn BatchEventSink>,
    pub(crate) operation_timeout: Option<Duration>,
}

impl Completion {
    /// Record the single terminal outcome of a dispatched operation.
    fn complete(&self, id: OperationId, outcome: Outcome) {
        let failed = !outcome.is_success();
        match &outcome {
            Outcome::Success => debug!(batch_id = %self.batch_id, operation = %id, "operation succeeded"),
            Outcome::Failure(reason) => {
                warn!(batch_id = %self.batch_id, operation = %id, %reason, "operation failed")
            }
        }
        self.sink.report(&BatchEvent::Completed {
            batch_id: self.batch_id,
            id,
            outcome: outcome.clone(),
        });
        // threshold cancellation must be visible before this record can drain the batch
        if failed {
            self.cancel.observe_failure();
        }
        if let Err(defect) = self.tracker.record(id, outcome) {
            error!(batch_id = %self.batch_id, operation = %id, %defect, "completion rejected");
        }
    }

    fn cancel_pending(&self, id: OperationId) {
        match self.tracker.record_cancelled(id) {
            Ok(()) => {
                debug!(batch_id = %self.batch_id, operation = %id, "operation cancelled before dispatch");
                self.sink.report(&BatchEvent::Cancelled {
                    batch_id: self.batch_id,
                    id,
                });
            }
            Err(defect) => {
                error!(batch_id = %self.batch_id, operation = %id, %defect, "cancellation rejected")
            }
        }
    }

    /// Drive one remote call to its outcome, then release the permit and record.
    async fn drive(self, id: OperationId, call: OutcomeFuture, permit: Permit) {
        let guarded = AssertUnwindSafe(call)
            .catch_unwind()
            .map(|r| {
                r.unwrap_or_else(|panic| {
                    Outcome::failure(FailureReason::panicked(panic_message(&*panic)))
                })
            });

        let operation_timeout = self.operation_timeout;
        let bounded = async move {
            match operation_timeout {
                Some(limit) => tokio::time::timeout(limit, guarded).await.unwrap_or_else(|_| {
                    Outcome::failure(FailureReason::timed_out(format!(
                        "no outcome after {}ms",
                        limit.as_millis()
                    )))
                }),
                None => guarded.await,
            }
        };

        let outcome = tokio::select! {
            outcome = bounded => outcome,
            _ = self.cancel.abort_token().cancelled() => {
                self.transport.abort(id);
                Outcome::failure(FailureReason::aborted("batch cancelled while in flight"))
            }
        };

        drop(permit);
        self.complete(id, outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "transport panicked".to_string()
    }
}

pub(crate) struct Dispatcher {
    pool: Arc<PermitPool>,
    completion: Completion,
}

impl Dispatcher {
    pub(crate) fn new(pool: Arc<PermitPool>, completion: Completion) -> Self {
        Self { pool, completion }
    }

    /// Dispatch operations in order until all are launched or the batch is
    /// cancelled; whatever is left is recorded as cancelled.
    pub(crate) async fn run(self, operations: Vec<Operation>) {
        let mut queue = operations.into_iter();
        while let Some(op) = queue.next() {
            if !self.submit(op).await {
                for rest in queue.by_ref() {
                    self.completion.cancel_pending(rest.id);
                }
                break;
            }
        }
        debug!(batch_id = %self.completion.batch_id, "dispatch loop finished");
    }

    /// Acquire a permit and launch one operation. Returns `false` when the
    /// batch was cancelled before the operation could be dispatched.
    pub(crate) async fn submit(&self, op: Operation) -> bool {
        let c = &self.completion;
        let permit = match self.pool.acquire(c.cancel.stop_token()).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                c.cancel_pending(op.id);
                return false;
            }
            Err(e) => {
                error!(batch_id = %c.batch_id, error = %e, "permit pool unavailable");
                c.cancel.abort();
                c.cancel_pending(op.id);
                return false;
            }
        };

        // Only Pending operations can be marked; anything else is either
        // terminal or already owned by the task that marked it.
        if let Err(defect) = c.tracker.mark_in_flight(op.id) {
            error!(batch_id = %c.batch_id, operation = %op.id, %defect, "dispatch rejected");
            return true;
        }
        c.sink.report(&BatchEvent::Dispatched {
            batch_id: c.batch_id,
            id: op.id,
        });
        debug!(batch_id = %c.batch_id, operation = %op.id, "dispatching operation");

        let request = SendRequest {
            id: op.id,
            payload: op.payload,
        };
        // a panic in send must not take the dispatch loop down with it
        match panic::catch_unwind(AssertUnwindSafe(|| c.transport.send(request))) {
            Ok(Ok(call)) => {
                tokio::spawn(c.clone().drive(op.id, call, permit));
            }
            Ok(Err(e)) => {
                drop(permit);
                c.complete(op.id, Outcome::failure(FailureReason::rejected(e.to_string())));
            }
            Err(panic) => {
                drop(permit);
                c.complete(
                    op.id,
                    Outcome::failure(FailureReason::panicked(panic_message(&*panic))),
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::cancel::CancelPolicy;
    use crate::batch::operation::{OperationState, PayloadRef};
    use crate::telemetry::noop_sink;
    use crate::transport::{Script, SimulatedTransport};

    fn setup(
        transport: SimulatedTransport,
        limit: usize,
        n: usize,
        policy: CancelPolicy,
    ) -> (Dispatcher, Arc<OutcomeTracker>, Arc<PermitPool>, Vec<Operation>) {
        let tracker = Arc::new(OutcomeTracker::new());
        let ops: Vec<Operation> = (0..n)
            .map(|_| {
                let id = tracker.enqueue().unwrap();
                Operation::new(id, PayloadRef::bytes(vec![0u8; 8]))
            })
            .collect();
        tracker.seal();
        let pool = Arc::new(PermitPool::new(limit));
        let completion = Completion {
            batch_id: Uuid::new_v4(),
            transport: Arc::new(transport),
            tracker: Arc::clone(&tracker),
            cancel: CancellationController::new(policy),
            sink: noop_sink(),
            operation_timeout: None,
        };
        (
            Dispatcher::new(Arc::clone(&pool), completion),
            tracker,
            pool,
            ops,
        )
    }

    #[tokio::test]
    async fn test_sync_rejection_releases_permit() {
        let t = SimulatedTransport::new().with_script(0, Script::Reject("connection refused".into()));
        let (d, tracker, pool, mut ops) = setup(t, 1, 1, CancelPolicy::default());

        assert!(d.submit(ops.remove(0)).await);
        assert!(tracker.is_drained());
        assert_eq!(pool.available(), 1);
        match tracker.state(OperationId(0)) {
            Some(OperationState::Failed(r)) => {
                assert_eq!(r.kind, crate::batch::FailureKind::Rejected)
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_after_cancel_marks_cancelled() {
        let (d, tracker, pool, mut ops) =
            setup(SimulatedTransport::new(), 2, 2, CancelPolicy::default());
        d.completion.cancel.cancel();
        assert!(!d.submit(ops.remove(0)).await);
        assert_eq!(tracker.state(OperationId(0)), Some(OperationState::Cancelled));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_run_drains_with_mixed_outcomes() {
        let t = SimulatedTransport::new()
            .failing([1, 3])
            .with_latency(Duration::from_millis(5));
        let stats = t.stats();
        let (d, tracker, pool, ops) = setup(t, 2, 6, CancelPolicy::default());

        d.run(ops).await;
        let mut rx = tracker.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|drained| *drained))
            .await
            .unwrap()
            .unwrap();

        let out = tracker.outcomes();
        assert_eq!(out.succeeded.len(), 4);
        assert_eq!(out.failures.len(), 2);
        assert!(stats.peak_in_flight() <= 2);
        assert!(pool.verify(0).is_ok());
    }

    #[tokio::test]
    async fn test_panicking_transport_is_recorded() {
        let t = SimulatedTransport::new().with_script(0, Script::Panic);
        let (d, tracker, pool, ops) = setup(t, 1, 1, CancelPolicy::default());
        d.run(ops).await;
        let mut rx = tracker.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|drained| *drained))
            .await
            .unwrap()
            .unwrap();
        let failures = tracker.outcomes().failures;
        let reason = &failures[&OperationId(0)];
        assert_eq!(reason.kind, crate::batch::FailureKind::Panicked);
        assert!(reason.message.contains("simulated transport panic"));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_send_is_recorded_and_dispatch_continues() {
        let t = SimulatedTransport::new().with_script(0, Script::PanicOnSend);
        let stats = t.stats();
        let (d, tracker, pool, ops) = setup(t, 1, 3, CancelPolicy::default());

        d.run(ops).await;
        let mut rx = tracker.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|drained| *drained))
            .await
            .unwrap()
            .unwrap();

        let out = tracker.outcomes();
        let reason = &out.failures[&OperationId(0)];
        assert_eq!(reason.kind, crate::batch::FailureKind::Panicked);
        assert!(reason.message.contains("simulated send panic"));
        assert_eq!(out.succeeded.len(), 2);
        assert_eq!(stats.calls(), 3);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_second_dispatch_of_in_flight_operation_does_not_stall() {
        let t = SimulatedTransport::new().with_latency(Duration::from_millis(20));
        let stats = t.stats();
        let (d, tracker, pool, ops) = setup(t, 2, 1, CancelPolicy::default());

        assert!(d.submit(ops[0].clone()).await);
        assert!(d.submit(ops[0].clone()).await);
        assert_eq!(stats.calls(), 1);
        assert_eq!(pool.available(), 1);

        let mut rx = tracker.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|drained| *drained))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.state(OperationId(0)), Some(OperationState::Succeeded));
        assert!(matches!(
            tracker.defects().as_slice(),
            [crate::error::Defect::InvalidTransition { .. }]
        ));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*boxed), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "transport panicked");
    }
}

//! Cancellation controller.
//!
//! Two tokens: `stop` ends dispatching (pending operations become `Cancelled`),
//! `abort` additionally tears down in-flight operations. Firing is idempotent;
//! the first reason wins.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CancelReason {
    /// `cancel()` or `abort()` called by the owner of the batch.
    External,
    /// The configured failure threshold was reached.
    FailureThreshold { failures: usize },
    /// `wait_timeout` expired.
    Timeout { after_ms: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelPolicy {
    /// Cancel the batch once this many operations have failed.
    pub max_failures: Option<usize>,
    /// Abort in-flight operations on `cancel()` instead of letting them finish.
    pub abort_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    policy: CancelPolicy,
    stop: CancellationToken,
    abort: CancellationToken,
    failures: AtomicUsize,
    reason: OnceLock<CancelReason>,
}

#[derive(Debug, Clone)]
pub struct CancellationController {
    inner: Arc<Inner>,
}

impl CancellationController {
    pub fn new(policy: CancelPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                failures: AtomicUsize::new(0),
                reason: OnceLock::new(),
            }),
        }
    }

    /// Stop dispatching. In-flight operations are aborted only if the policy
    /// says so. Returns `true` for the call that actually cancelled the batch.
    pub fn cancel(&self) -> bool {
        self.fire(CancelReason::External, self.inner.policy.abort_in_flight)
    }

    /// Stop dispatching and abort everything in flight.
    pub fn abort(&self) -> bool {
        self.fire(CancelReason::External, true)
    }

    pub(crate) fn fire(&self, reason: CancelReason, abort_in_flight: bool) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        if first {
            warn!(?reason, abort_in_flight, "batch cancelled");
        }
        self.inner.stop.cancel();
        if abort_in_flight {
            self.inner.abort.cancel();
        }
        first
    }

    /// Count one failed operation; fires `FailureThreshold` when the policy's
    /// limit is reached.
    ///
    /// Exactly one caller observes the count equal to the limit, so the
    /// recorded reason always carries the limit itself.
    pub fn observe_failure(&self) {
        let failures = self.inner.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.inner.policy.max_failures == Some(failures) {
            self.fire(
                CancelReason::FailureThreshold { failures },
                self.inner.policy.abort_in_flight,
            );
        }
    }

    pub fn failures(&self) -> usize {
        self.inner.failures.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    pub fn policy(&self) -> &CancelPolicy {
        &self.inner.policy
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    pub(crate) fn abort_token(&self) -> &CancellationToken {
        &self.inner.abort
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new(CancelPolicy::default())
    }
}

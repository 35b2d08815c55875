//! Concurrency permit pool.

use crate::error::Defect;
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermitSnapshot {
    pub limit: usize,
    pub available: usize,
    /// Operations currently in flight, as recorded by the outcome tracker.
    pub in_flight: usize,
}

/// One in-flight slot. Dropping it returns the slot to the pool, so release is
/// tied to scope on every path (success, error, abort, panic unwind).
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

/// Bounds how many operations of a batch may be in flight at once.
pub struct PermitPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl PermitPool {
    /// A limit of zero is clamped to one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Wait for a free permit, or return `Ok(None)` once `stop` fires.
    ///
    /// Cancellation is checked first, so a stopped batch never hands out a
    /// permit even when one is free.
    pub async fn acquire(&self, stop: &CancellationToken) -> Result<Option<Permit>> {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Ok(None),
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|_| {
                    Error::runtime_with_context(
                        "Permit semaphore closed",
                        ErrorContext::new().with_source("permit_pool"),
                    )
                })?;
                Ok(Some(Permit { _inner: permit }))
            }
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|p| Permit { _inner: p })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn snapshot(&self, in_flight: usize) -> PermitSnapshot {
        PermitSnapshot {
            limit: self.limit,
            available: self.available(),
            in_flight,
        }
    }

    /// Check `available + in_flight == limit`.
    ///
    /// Only exact at quiescent points (no permit between acquisition and the
    /// `InFlight` mark, or between release and the terminal record), e.g. once
    /// the batch has drained and `in_flight` is zero.
    pub fn verify(&self, in_flight: usize) -> std::result::Result<(), Defect> {
        let available = self.available();
        if available + in_flight != self.limit {
            return Err(Defect::PermitLeak {
                limit: self.limit,
                available,
                in_flight,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_limit_clamped() {
        let pool = PermitPool::new(0);
        assert_eq!(pool.limit(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = PermitPool::new(2);
        let stop = CancellationToken::new();

        let a = pool.acquire(&stop).await.unwrap().unwrap();
        let b = pool.acquire(&stop).await.unwrap().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());
        assert!(pool.verify(2).is_ok());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert!(pool.verify(0).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_returns_none_when_stopped() {
        let pool = PermitPool::new(1);
        let stop = CancellationToken::new();
        let _held = pool.try_acquire().unwrap();

        let waiter = {
            let stop = stop.clone();
            async move { pool.acquire(&stop).await }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.cancel();
        };
        let (res, _) = tokio::join!(waiter, canceller);
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stopped_pool_hands_out_nothing() {
        let pool = PermitPool::new(3);
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(pool.acquire(&stop).await.unwrap().is_none());
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_verify_detects_leak() {
        let pool = PermitPool::new(1);
        let permit = pool.try_acquire().unwrap();
        std::mem::forget(permit);
        assert_eq!(
            pool.verify(0),
            Err(Defect::PermitLeak {
                limit: 1,
                available: 0,
                in_flight: 0
            })
        );
    }
}

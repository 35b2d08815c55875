//! Shared helpers for batch integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;
use upload_batch::batch::{BatchHandle, PayloadRef};

/// Upper bound for any single batch in these tests; a hang is a failure, not a slow test.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub fn payloads(n: usize, bytes: usize) -> Vec<PayloadRef> {
    let payload = PayloadRef::bytes(vec![0u8; bytes]);
    (0..n).map(|_| payload.clone()).collect()
}

/// Await `fut`, panicking if it does not finish within [`DRAIN_DEADLINE`].
pub async fn within_deadline<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(DRAIN_DEADLINE, fut)
        .await
        .expect("batch did not drain before the deadline")
}

/// Poll `cond` against the batch snapshot until it holds.
pub async fn until(handle: &BatchHandle, cond: impl Fn(&upload_batch::batch::BatchSnapshot) -> bool) {
    within_deadline(async {
        loop {
            if cond(&handle.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

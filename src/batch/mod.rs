//! 批处理核心：有界并发提交、结果跟踪、整体完成信号与取消。
//!
//! # Upload Batch Core
//!
//! A batch launches many independent operations against a [`Transport`](crate::transport::Transport),
//! never more than a fixed number at once, and exposes one completion signal
//! for the whole set. That signal resolves when the last operation reaches a
//! terminal state, however many of them failed.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Batch`] / [`BatchBuilder`] | Create a batch from payloads and start dispatching |
//! | [`BatchHandle`] | Wait for the batch, cancel it, inspect it |
//! | [`BatchResult`] | Succeeded, failed, and cancelled operations of a drained batch |
//! | [`BatchConfig`] | Concurrency limit, per-operation timeout, cancellation policy |
//! | [`PermitPool`] | Bounds in-flight operations; permits are RAII guards |
//! | [`OutcomeTracker`] | Single writer of operation states and the outstanding count |
//! | [`CancellationController`] | Stops dispatching, optionally aborts in-flight work |
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use upload_batch::batch::{Batch, PayloadRef};
//! use upload_batch::transport::SimulatedTransport;
//!
//! # async fn run() -> upload_batch::Result<()> {
//! let transport = Arc::new(SimulatedTransport::new().failing([15]));
//! let payloads = (0..20).map(|_| PayloadRef::bytes(vec![0u8; 1024]));
//!
//! let batch = Batch::spawn(transport, payloads, 5)?;
//! let result = batch.wait().await?;
//! assert_eq!(result.success_count(), 19);
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! - **Pending**: registered, waiting for a permit
//! - **InFlight**: permit held, transport call running
//! - **Succeeded / Failed**: recorded once by the operation's own task, after its permit is released
//! - **Cancelled**: the batch was cancelled before the operation got a permit

mod aggregator;
mod builder;
mod cancel;
mod config;
mod dispatcher;
mod operation;
mod permits;
mod tracker;

pub use aggregator::{BatchHandle, BatchResult, BatchSnapshot};
pub use builder::{Batch, BatchBuilder};
pub use cancel::{CancelPolicy, CancelReason, CancellationController};
pub use config::BatchConfig;
pub use operation::{
    FailureKind, FailureReason, Operation, OperationId, OperationState, Outcome, PayloadRef,
    StateKind,
};
pub use permits::{Permit, PermitPool, PermitSnapshot};
pub use tracker::{OutcomeTracker, Outcomes, TrackerCounts};

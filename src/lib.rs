//! # upload-batch
//!
//! 有界并发的上传批处理：即使远端存储中途失败，整体完成信号也一定会解析。
//!
//! Bounded-concurrency upload batches whose combined completion signal always
//! resolves, even when the remote store starts failing part-way through.
//!
//! ## Overview
//!
//! Issuing many concurrent writes and joining them with one "all done" future
//! is easy to get subtly wrong: a permit leaked on one failure path, or an
//! aggregate that waits on a different signal for failures than for
//! successes, and the batch stalls forever although every request has
//! finished. This crate keeps the bookkeeping in one place and makes the
//! drain condition a single counter reaching zero.
//!
//! ## Core Guarantees
//!
//! - **Liveness**: [`batch::BatchHandle::wait`] resolves once every operation is terminal, whatever the failure ratio
//! - **Permit conservation**: permits are RAII guards, released on every path including panics and aborts
//! - **Exactly-once completion**: a second terminal record for an operation is reported as a defect
//! - **Order independence**: the result depends only on per-operation outcomes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use upload_batch::batch::{Batch, BatchConfig, PayloadRef};
//! use upload_batch::transport::{HttpPutConfig, HttpPutTransport};
//!
//! #[tokio::main]
//! async fn main() -> upload_batch::Result<()> {
//!     let endpoint = url::Url::parse("http://127.0.0.1:9000").expect("valid url");
//!     let transport = HttpPutTransport::new(HttpPutConfig::new(endpoint, "test-bucket"))?;
//!
//!     let payloads = (0..20).map(|_| PayloadRef::file("large-file"));
//!     let batch = Batch::builder()
//!         .config(BatchConfig::from_env().with_concurrency_limit(5))
//!         .spawn(Arc::new(transport), payloads)?;
//!
//!     let result = batch.wait().await?;
//!     for (id, reason) in &result.failures {
//!         eprintln!("upload {id} failed: {reason}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Dispatcher, outcome tracker, aggregator, cancellation |
//! | [`transport`] | Transport trait, HTTP `PUT` transport, simulated store |
//! | [`telemetry`] | Optional batch lifecycle event sinks |

pub mod batch;
pub mod telemetry;
pub mod transport;

pub use batch::{Batch, BatchConfig, BatchHandle, BatchResult, OperationId, PayloadRef};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Defect, Error, ErrorContext};
